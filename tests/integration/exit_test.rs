//! Exit monitoring driven by a polling feed

use crate::support::{eventually, Harness, STRATEGY, SYMBOL};
use leverage_worker::exit::{ExitMonitor, ExitReason};
use leverage_worker::feed::{PollingFeed, TickFeed};
use leverage_worker::notify::TradeEvent;
use leverage_worker::position::PositionKey;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn start_monitor(h: &Harness, shutdown: &CancellationToken) {
    let feed = PollingFeed::new(h.broker.clone(), Duration::from_millis(10));
    let events = feed
        .subscribe(&[SYMBOL.to_string()], shutdown.clone())
        .await
        .unwrap();
    let monitor = Arc::new(ExitMonitor::new(
        h.orders.clone(),
        h.notifier.clone(),
        Duration::from_secs(5),
    ));
    monitor.start(events, shutdown.clone());
}

#[tokio::test]
async fn test_stop_loss_closes_position() {
    let h = Harness::new();
    h.open(STRATEGY, 10, dec!(10000)).await;
    let shutdown = CancellationToken::new();
    start_monitor(&h, &shutdown).await;

    h.broker.set_price(SYMBOL, dec!(9790));
    let orders = h.orders.clone();
    let closed = eventually(Duration::from_secs(2), || {
        let orders = orders.clone();
        async move { orders.positions().open_count().await == 0 }
    })
    .await;
    shutdown.cancel();

    assert!(closed);
    assert_eq!(h.broker.holding(SYMBOL), 0);
    assert!(h.notifier.events().iter().any(|e| matches!(
        e,
        TradeEvent::PositionClosed { reason, quantity: 10, .. } if reason == &format!("{:?}", ExitReason::StopLoss)
    )));
}

#[tokio::test]
async fn test_repeated_ticks_place_one_sell() {
    let h = Harness::new();
    h.open(STRATEGY, 10, dec!(10000)).await;
    // Sells rest, so the position stays open while ticks keep arriving
    h.broker.set_fill_marketable_limits(false);
    h.broker.set_fill_market_orders(false);
    let shutdown = CancellationToken::new();
    start_monitor(&h, &shutdown).await;

    h.broker.set_price(SYMBOL, dec!(10400));
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown.cancel();

    let sells: Vec<_> = h
        .broker
        .placed_orders()
        .into_iter()
        .filter(|o| o.side == leverage_worker::broker::OrderSide::Sell)
        .collect();
    // One limit, then its market fallback
    assert!(!sells.is_empty() && sells.len() <= 2);
    assert_eq!(h.broker.max_live_orders(SYMBOL), 1);
}

#[tokio::test]
async fn test_two_strategies_tracked_separately() {
    let h = Harness::new();
    h.open("breakout", 10, dec!(10000)).await;
    h.open("scalper", 5, dec!(10000)).await;
    let shutdown = CancellationToken::new();
    start_monitor(&h, &shutdown).await;

    h.broker.set_price(SYMBOL, dec!(10310));
    let orders = h.orders.clone();
    let closed = eventually(Duration::from_secs(2), || {
        let orders = orders.clone();
        async move { orders.positions().open_count().await == 0 }
    })
    .await;
    shutdown.cancel();

    assert!(closed);
    for strategy in ["breakout", "scalper"] {
        let key = PositionKey::new(SYMBOL, strategy);
        assert!(h.orders.positions().get(&key).await.is_none());
    }
    assert_eq!(h.broker.holding(SYMBOL), 0);
    assert!(h.orders.active_orders().await.is_empty());
}
