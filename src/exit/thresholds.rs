//! Exit threshold evaluation

use crate::config::ExitConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exit thresholds attached to a position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitThresholds {
    /// Take-profit in percent of entry price
    pub take_profit_pct: Decimal,
    /// Stop-loss in percent of entry price
    pub stop_loss_pct: Decimal,
    /// Maximum holding time in minutes (0 = no timeout)
    pub max_holding_minutes: i64,
}

impl From<&ExitConfig> for ExitThresholds {
    fn from(config: &ExitConfig) -> Self {
        Self {
            take_profit_pct: config.take_profit_pct,
            stop_loss_pct: config.stop_loss_pct,
            max_holding_minutes: config.max_holding_minutes,
        }
    }
}

impl Default for ExitThresholds {
    fn default() -> Self {
        Self::from(&ExitConfig::default())
    }
}

/// Why a position is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Timeout,
}

impl ExitThresholds {
    /// Evaluate a price against the thresholds
    ///
    /// Stop-loss wins over take-profit, which wins over timeout.
    pub fn evaluate(
        &self,
        entry_price: Decimal,
        price: Decimal,
        held: chrono::Duration,
    ) -> Option<ExitReason> {
        if entry_price > Decimal::ZERO {
            let profit_pct = (price - entry_price) / entry_price * Decimal::ONE_HUNDRED;
            if profit_pct <= -self.stop_loss_pct {
                return Some(ExitReason::StopLoss);
            }
            if profit_pct >= self.take_profit_pct {
                return Some(ExitReason::TakeProfit);
            }
        }
        if self.max_holding_minutes > 0 && held.num_minutes() >= self.max_holding_minutes {
            return Some(ExitReason::Timeout);
        }
        None
    }
}
