//! Strategy types

use crate::broker::Candle;
use crate::position::Position;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a strategy wants done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// A trading decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    /// In [0, 1]
    pub confidence: f64,
    pub reason: String,
}

impl Signal {
    pub fn buy(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Buy,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
        }
    }

    pub fn sell(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Sell,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
        }
    }

    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}

/// Market state handed to a strategy for one decision
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub symbol: String,
    pub price: Decimal,
    /// Oldest first
    pub candles: Vec<Candle>,
    /// The strategy's own open position on this symbol, if any
    pub position: Option<Position>,
    pub now: DateTime<Utc>,
}
