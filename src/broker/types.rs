//! Broker boundary types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

/// Broker acknowledgement of an accepted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Broker-side lifecycle of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderState {
    /// Resting or partially filled
    Open,
    Filled,
    /// Cancelled with the unfilled remainder released
    Cancelled,
    Rejected,
}

/// Authoritative order status as reported by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderStatus {
    pub broker_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    /// Cumulative filled quantity
    pub filled_quantity: u64,
    /// Average price over all fills so far
    pub avg_fill_price: Option<Decimal>,
    pub state: BrokerOrderState,
}

/// One holding in the account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub name: String,
    pub quantity: u64,
    pub avg_price: Decimal,
    pub current_price: Decimal,
}

/// Account holdings plus cash summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    pub holdings: Vec<Holding>,
    pub cash: Decimal,
    pub total_eval: Decimal,
}

impl Balance {
    /// Held quantity for a symbol, zero if absent
    pub fn quantity_of(&self, symbol: &str) -> u64 {
        self.holdings
            .iter()
            .filter(|h| h.symbol == symbol)
            .map(|h| h.quantity)
            .sum()
    }
}

/// One OHLCV bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}
