//! Breakout strategy
//!
//! Buys when the latest close clears the highest high of the preceding
//! `lookback` candles. A fresh exit starts a cooldown during which no new
//! signals are produced.

use super::{MarketContext, Signal, Strategy};
use crate::position::PositionKey;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

const DEFAULT_LOOKBACK: usize = 20;
const DEFAULT_COOLDOWN_MINUTES: i64 = 5;

pub struct Breakout {
    lookback: usize,
    cooldown: Duration,
    last_exit: Mutex<Option<DateTime<Utc>>>,
}

impl Breakout {
    pub fn new(lookback: usize, cooldown: Duration) -> Self {
        Self {
            lookback: lookback.max(1),
            cooldown,
            last_exit: Mutex::new(None),
        }
    }

    /// Build from config params `lookback` and `cooldown_minutes`
    pub fn from_params(params: &HashMap<String, f64>) -> anyhow::Result<Self> {
        let lookback = match params.get("lookback") {
            Some(v) if *v >= 1.0 => *v as usize,
            Some(v) => anyhow::bail!("breakout: lookback must be at least 1, got {}", v),
            None => DEFAULT_LOOKBACK,
        };
        let cooldown = match params.get("cooldown_minutes") {
            Some(v) if *v >= 0.0 => *v as i64,
            Some(v) => anyhow::bail!("breakout: cooldown_minutes must not be negative, got {}", v),
            None => DEFAULT_COOLDOWN_MINUTES,
        };
        Ok(Self::new(lookback, Duration::minutes(cooldown)))
    }

    fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.last_exit
            .lock()
            .ok()
            .and_then(|last| *last)
            .is_some_and(|at| now - at < self.cooldown)
    }
}

impl Strategy for Breakout {
    fn name(&self) -> &str {
        "breakout"
    }

    fn can_generate_signal(&self, ctx: &MarketContext) -> bool {
        ctx.candles.len() > self.lookback && !self.cooling_down(ctx.now)
    }

    fn generate_signal(&self, ctx: &MarketContext) -> Signal {
        let Some((latest, prior)) = ctx.candles.split_last() else {
            return Signal::hold("no candles");
        };
        let window = &prior[prior.len().saturating_sub(self.lookback)..];
        let Some(high) = window.iter().map(|c| c.high).max() else {
            return Signal::hold("no history");
        };
        if ctx.position.is_some() {
            return Signal::hold("position open");
        }
        if latest.close <= high || high <= Decimal::ZERO {
            return Signal::hold(format!("close {} within {}-candle high {}", latest.close, self.lookback, high));
        }

        // 1% through the high is full confidence
        let pct = ((latest.close - high) / high * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0);
        Signal::buy(
            0.5 + pct / 2.0,
            format!("close {} broke {}-candle high {}", latest.close, self.lookback, high),
        )
    }

    fn on_entry(&self, key: &PositionKey, quantity: u64, price: Decimal) {
        tracing::info!(key = %key, quantity, price = %price, "Breakout entry");
    }

    fn on_exit(&self, key: &PositionKey, reason: &str) {
        tracing::info!(key = %key, reason, cooldown_min = self.cooldown.num_minutes(), "Breakout exit");
        if let Ok(mut last) = self.last_exit.lock() {
            *last = Some(Utc::now());
        }
    }
}
