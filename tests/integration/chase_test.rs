//! Entry chase against a market that sits above the first limit

use crate::support::{fast_orders, Harness, STRATEGY, SYMBOL};
use leverage_worker::broker::{OrderKind, SimulatedBroker};
use leverage_worker::config::{ExhaustedPolicy, OrderConfig};
use leverage_worker::notify::TradeEvent;
use leverage_worker::order::{BuyRequest, ExecutionStatus, OrderState};
use leverage_worker::position::PositionKey;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn request(quantity: u64) -> BuyRequest {
    BuyRequest {
        symbol: SYMBOL.into(),
        strategy: STRATEGY.into(),
        quantity,
        reference_price: dec!(10000),
    }
}

#[tokio::test]
async fn test_chase_walks_up_to_market() {
    let h = Harness::new();
    h.broker.set_price(SYMBOL, dec!(10010));

    let outcome = h.orders.place_buy_with_chase(request(10)).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Filled);
    assert_eq!(outcome.filled_quantity, 10);
    assert_eq!(outcome.avg_price, Some(dec!(10010)));
    assert_eq!(outcome.order_ids.len(), 3);

    let prices: Vec<_> = h.broker.placed_orders().iter().map(|o| o.price).collect();
    assert_eq!(prices, vec![Some(dec!(10000)), Some(dec!(10005)), Some(dec!(10010))]);
    assert_eq!(h.broker.max_live_orders(SYMBOL), 1);

    // Lineage runs through the chain
    let second = h.orders.get(outcome.order_ids[1]).await.unwrap();
    assert_eq!(second.parent_id, Some(outcome.order_ids[0]));
    assert_eq!(second.state, OrderState::Chased);

    let position = h
        .orders
        .positions()
        .get(&PositionKey::new(SYMBOL, STRATEGY))
        .await
        .unwrap();
    assert_eq!(position.quantity, 10);
    assert_eq!(position.avg_price, dec!(10010));
    assert!(h
        .notifier
        .events()
        .iter()
        .any(|e| matches!(e, TradeEvent::OrderFilled { quantity: 10, .. })));
}

#[tokio::test]
async fn test_partial_fill_then_market_conversion() {
    let h = Harness::new();
    h.broker.set_price(SYMBOL, dec!(10100));
    h.broker.fill_on_next_cancel(4);

    let outcome = h.orders.place_buy_with_chase(request(10)).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Filled);
    assert_eq!(outcome.filled_quantity, 10);
    assert_eq!(outcome.avg_price, Some(dec!(10060)));

    let placed = h.broker.placed_orders();
    let last = placed.last().unwrap();
    assert_eq!(last.kind, OrderKind::Market);
    assert_eq!(last.quantity, 6);
    assert!(placed[1..].iter().all(|o| o.quantity == 6));
    assert_eq!(h.broker.max_live_orders(SYMBOL), 1);

    let position = h
        .orders
        .positions()
        .get(&PositionKey::new(SYMBOL, STRATEGY))
        .await
        .unwrap();
    assert_eq!(position.quantity, 10);
    assert_eq!(position.avg_price, dec!(10060));
}

#[tokio::test]
async fn test_exhausted_chase_abandons_cleanly() {
    let h = Harness::with_broker(
        Arc::new(SimulatedBroker::default()),
        OrderConfig {
            on_exhausted: ExhaustedPolicy::Abandon,
            max_chase_attempts: 1,
            ..fast_orders()
        },
    );
    h.broker.set_price(SYMBOL, dec!(10500));

    let outcome = h.orders.place_buy_with_chase(request(10)).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Abandoned);
    assert_eq!(outcome.filled_quantity, 0);
    assert_eq!(h.broker.live_orders(SYMBOL), 0);
    assert!(h.orders.active_orders().await.is_empty());
    assert_eq!(h.orders.positions().open_count().await, 0);

    let last = h.orders.get(*outcome.order_ids.last().unwrap()).await.unwrap();
    assert_eq!(last.state, OrderState::Failed);
}

#[tokio::test]
async fn test_rejection_surfaces_to_caller() {
    let h = Harness::new();
    h.broker.set_price(SYMBOL, dec!(10000));
    h.broker.reject_next("APBK0952", "insufficient buying power");

    let err = h.orders.place_buy_with_chase(request(10)).await.unwrap_err();
    assert!(err.to_string().contains("insufficient buying power"));
    assert!(h
        .notifier
        .events()
        .iter()
        .any(|e| matches!(e, TradeEvent::OrderFailed { .. })));
}
