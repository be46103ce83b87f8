//! End-of-day close-out

use crate::support::{Harness, STRATEGY, SYMBOL};
use leverage_worker::broker::{BrokerError, OrderKind, OrderSide};
use leverage_worker::config::LiquidationConfig;
use leverage_worker::notify::TradeEvent;
use leverage_worker::order::{BuyRequest, ExecutionStatus, SellRequest};
use leverage_worker::position::PositionKey;
use leverage_worker::safety::DailyLiquidationManager;
use rust_decimal_macros::dec;

fn liquidation(h: &Harness) -> DailyLiquidationManager {
    DailyLiquidationManager::new(
        h.orders.clone(),
        h.notifier.clone(),
        &LiquidationConfig {
            retry_delay_ms: 1,
            settle_timeout_secs: 1,
            ..Default::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_cancels_resting_buy_and_closes_positions() {
    let h = Harness::new();
    h.open(STRATEGY, 10, dec!(10000)).await;
    h.open("scalper", 5, dec!(10000)).await;

    // A resting entry from another strategy, left live by a failed cancel
    h.broker.set_price("252670", dec!(9000));
    h.broker.set_fill_marketable_limits(false);
    h.broker.set_cancel_fails(true);
    let outcome = h
        .orders
        .place_buy_with_chase(BuyRequest {
            symbol: "252670".into(),
            strategy: STRATEGY.into(),
            quantity: 3,
            reference_price: dec!(8900),
        })
        .await
        .unwrap();
    assert!(!outcome.is_filled());
    assert_eq!(h.broker.live_orders("252670"), 1);
    h.broker.set_cancel_fails(false);

    let result = liquidation(&h).execute().await;
    assert_eq!(result.closed.len(), 2);
    assert!(result.failures.is_empty());
    assert_eq!(h.broker.holding(SYMBOL), 0);
    assert_eq!(h.orders.positions().open_count().await, 0);
    assert!(!h.orders.entries_blocked());

    let market_sells = h
        .broker
        .placed_orders()
        .into_iter()
        .filter(|o| o.side == OrderSide::Sell && o.kind == OrderKind::Market)
        .count();
    assert_eq!(market_sells, 2);
    assert!(h
        .notifier
        .events()
        .iter()
        .any(|e| matches!(e, TradeEvent::LiquidationSummary { closed: 2, failed: 0 })));
}

#[tokio::test]
async fn test_rejected_close_needs_manual_attention() {
    let h = Harness::new();
    h.open(STRATEGY, 10, dec!(10000)).await;
    // Every placement attempt is rejected
    for _ in 0..3 {
        h.broker
            .fail_next(BrokerError::rejected("APBK0013", "market closed"));
    }

    let result = liquidation(&h).execute().await;
    assert!(!result.is_clean());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].quantity, 10);
    assert!(result.failures[0].reason.contains("market closed"));
    assert!(!h.orders.entries_blocked());
}

#[tokio::test]
async fn test_exit_in_flight_is_not_sold_twice() {
    let h = Harness::new();
    h.open(STRATEGY, 10, dec!(10000)).await;
    let liquidation = liquidation(&h);

    // The exit's limit sits above the market and falls back to market
    let exit = h.orders.place_sell_with_fallback(SellRequest {
        symbol: SYMBOL.into(),
        strategy: STRATEGY.into(),
        quantity: 10,
        target_price: dec!(10100),
    });
    let (outcome, result) = tokio::join!(exit, liquidation.execute());

    let outcome = outcome.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Filled);
    assert_eq!(result.closed, vec![PositionKey::new(SYMBOL, STRATEGY)]);
    assert!(result.failures.is_empty());
    assert_eq!(h.broker.holding(SYMBOL), 0);

    let market_sells = h
        .broker
        .placed_orders()
        .into_iter()
        .filter(|o| o.side == OrderSide::Sell && o.kind == OrderKind::Market)
        .count();
    assert_eq!(market_sells, 1);
}
