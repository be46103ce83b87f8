//! Real-time feed types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single trade print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    /// KRX short code (e.g. "122630")
    pub symbol: String,
    pub price: Decimal,
    /// Quantity of this print
    pub volume: u64,
    /// Local receive time
    pub timestamp: DateTime<Utc>,
    /// Exchange trade time
    pub exchange_ts: DateTime<Utc>,
}

/// Everything the stream can deliver
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tick(PriceTick),
    /// Execution notice for our account
    ///
    /// The order number is only known when the notice arrived unencrypted;
    /// `None` asks the consumer to reconcile every active order.
    OrderNotice { broker_order_id: Option<String> },
    Connected,
    Disconnected,
}
