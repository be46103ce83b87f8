//! One-way trade notifications
//!
//! Notifiers never feed back into core state; delivery errors are logged
//! and dropped.

mod slack;

pub use slack::SlackNotifier;

use crate::broker::OrderSide;
use crate::safety::HaltSource;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    OrderFilled {
        symbol: String,
        strategy: String,
        side: OrderSide,
        quantity: u64,
        avg_price: Decimal,
    },
    OrderFailed {
        symbol: String,
        strategy: String,
        side: OrderSide,
        reason: String,
    },
    PositionClosed {
        symbol: String,
        strategy: String,
        reason: String,
        quantity: u64,
        avg_price: Option<Decimal>,
    },
    EmergencyStop {
        source: HaltSource,
        reason: String,
    },
    LiquidationSummary {
        closed: usize,
        failed: usize,
    },
    RecoveryGap {
        detail: String,
    },
}

impl fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeEvent::OrderFilled {
                symbol,
                strategy,
                side,
                quantity,
                avg_price,
            } => write!(
                f,
                "[FILLED] {:?} {} x{} @ {} ({})",
                side, symbol, quantity, avg_price, strategy
            ),
            TradeEvent::OrderFailed {
                symbol,
                strategy,
                side,
                reason,
            } => write!(f, "[FAILED] {:?} {} ({}): {}", side, symbol, strategy, reason),
            TradeEvent::PositionClosed {
                symbol,
                strategy,
                reason,
                quantity,
                avg_price,
            } => match avg_price {
                Some(price) => write!(
                    f,
                    "[CLOSED] {} x{} @ {} ({}): {}",
                    symbol, quantity, price, strategy, reason
                ),
                None => write!(f, "[CLOSED] {} x{} ({}): {}", symbol, quantity, strategy, reason),
            },
            TradeEvent::EmergencyStop { source, reason } => {
                write!(f, "[EMERGENCY STOP] {:?}: {}", source, reason)
            }
            TradeEvent::LiquidationSummary { closed, failed } => write!(
                f,
                "[LIQUIDATION] closed {} position(s), {} need manual attention",
                closed, failed
            ),
            TradeEvent::RecoveryGap { detail } => write!(f, "[RECOVERY GAP] {}", detail),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: TradeEvent);
}

/// Writes events to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: TradeEvent) {
        match &event {
            TradeEvent::OrderFailed { .. }
            | TradeEvent::EmergencyStop { .. }
            | TradeEvent::RecoveryGap { .. } => tracing::warn!(%event, "Notification"),
            _ => tracing::info!(%event, "Notification"),
        }
    }
}

/// Delivers each event to every inner notifier in order
pub struct FanoutNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(inner: Vec<Arc<dyn Notifier>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: TradeEvent) {
        for notifier in &self.inner {
            notifier.notify(event.clone()).await;
        }
    }
}
