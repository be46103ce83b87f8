//! Position types

use crate::exit::ExitThresholds;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Positions are keyed by symbol and owning strategy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub strategy: String,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            strategy: strategy.into(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.strategy)
    }
}

/// An open position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub key: PositionKey,
    pub quantity: u64,
    pub avg_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub thresholds: ExitThresholds,
}

impl Position {
    /// Unrealized return in percent at `price`
    pub fn profit_pct(&self, price: Decimal) -> Decimal {
        if self.avg_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.avg_price) / self.avg_price * Decimal::ONE_HUNDRED
    }

    pub fn holding_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.opened_at
    }
}

/// Kind of divergence between local and broker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MismatchKind {
    /// Broker holds shares the cache did not know about
    MissingLocally,
    /// Cache holds a position the broker does not
    MissingAtBroker,
    QuantityDiffers,
    AvgPriceDiffers,
    /// A sell fill exceeded the cached quantity
    Oversell,
}

/// Audit record of a reconciliation mismatch; the broker side always wins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub symbol: String,
    pub kind: MismatchKind,
    pub local_quantity: u64,
    pub broker_quantity: u64,
    pub detail: String,
}

/// Result of one broker sync
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub mismatches: Vec<AuditEvent>,
    pub open_positions: usize,
    /// Symbols left untouched because orders or fills were in flight
    pub skipped: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Symbols the cache held but the broker did not
    pub fn missing_at_broker(&self) -> impl Iterator<Item = &str> {
        self.mismatches
            .iter()
            .filter(|m| m.kind == MismatchKind::MissingAtBroker)
            .map(|m| m.symbol.as_str())
    }
}
