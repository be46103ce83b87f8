//! Strategies
//!
//! A strategy turns a [`MarketContext`] into a BUY/SELL/HOLD [`Signal`].
//! Execution and exits are handled elsewhere; the hooks only let a strategy
//! observe its own entries and exits.

mod breakout;
mod registry;
mod types;

pub use breakout::Breakout;
pub use registry::{StrategyConstructor, StrategyRegistry};
pub use types::{MarketContext, Signal, SignalAction};

use crate::position::PositionKey;
use rust_decimal::Decimal;

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the context is usable at all (history, cooldowns)
    fn can_generate_signal(&self, _ctx: &MarketContext) -> bool {
        true
    }

    fn generate_signal(&self, ctx: &MarketContext) -> Signal;

    fn on_entry(&self, _key: &PositionKey, _quantity: u64, _price: Decimal) {}

    fn on_exit(&self, _key: &PositionKey, _reason: &str) {}
}
