//! KRX ETF tick grid and chase re-pricing

use crate::broker::OrderSide;
use crate::config::ChaseStep;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Tick size for an ETF price level
pub fn tick_size(price: Decimal) -> Decimal {
    if price < dec!(2000) {
        dec!(1)
    } else {
        dec!(5)
    }
}

/// Snap a price onto the tick grid: down for buys, up for sells
pub fn round_to_tick(price: Decimal, side: OrderSide) -> Decimal {
    let tick = tick_size(price);
    let steps = price / tick;
    let steps = match side {
        OrderSide::Buy => steps.floor(),
        OrderSide::Sell => steps.ceil(),
    };
    (steps * tick).normalize()
}

/// Next, more aggressive price for a chase
///
/// Buys move up and sells move down. The result is always at least one
/// tick away from `price` so a chase never resubmits at the same level.
pub fn chase_price(price: Decimal, side: OrderSide, step: ChaseStep) -> Decimal {
    let tick = tick_size(price);
    let delta = match step {
        ChaseStep::Ticks { count } => tick * Decimal::from(count.max(1)),
        ChaseStep::Percent { pct } => (price * pct / dec!(100)).max(tick),
    };
    let raw = match side {
        OrderSide::Buy => price + delta,
        OrderSide::Sell => (price - delta).max(tick),
    };
    // Round away from the previous price so the move is never lost
    let snapped = match side {
        OrderSide::Buy => round_to_tick(raw, OrderSide::Sell),
        OrderSide::Sell => round_to_tick(raw, OrderSide::Buy),
    };
    snapped.normalize()
}
