//! Crash recovery from persisted session state

use crate::support::{Harness, STRATEGY, SYMBOL};
use chrono::Utc;
use leverage_worker::broker::{Broker, BrokerError, OrderKind, OrderSide};
use leverage_worker::exit::ExitThresholds;
use leverage_worker::order::{
    BuyRequest, ExecutionStatus, Order, OrderError, OrderState, SellRequest,
};
use leverage_worker::position::{Position, PositionKey};
use leverage_worker::recovery::{
    GapKind, RecoveryError, RecoveryManager, SessionCheckpointer, SessionState, SessionStatus,
    SessionStore,
};
use leverage_worker::safety::{HaltRecord, HaltSource};
use rust_decimal_macros::dec;
use std::time::Duration;
use uuid::Uuid;

fn manager(h: &Harness, store: &SessionStore) -> RecoveryManager {
    RecoveryManager::new(
        store.clone(),
        h.orders.clone(),
        h.emergency.clone(),
        h.notifier.clone(),
    )
}

fn submitted(broker_order_id: Option<String>, symbol: &str) -> Order {
    let mut order = Order::new(
        symbol,
        STRATEGY,
        OrderSide::Buy,
        OrderKind::Limit,
        10,
        Some(dec!(10000)),
        None,
    )
    .unwrap();
    if broker_order_id.is_some() {
        order.state = OrderState::Submitted;
    }
    order.broker_order_id = broker_order_id;
    order
}

#[tokio::test]
async fn test_crash_with_resting_partial_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    let h = Harness::new();
    h.broker.set_price(SYMBOL, dec!(10100));

    // The crashed process had a buy resting at the broker with 4 shares filled
    let ack = h
        .broker
        .place_limit_order(SYMBOL, OrderSide::Buy, 10, dec!(10000))
        .await
        .unwrap();
    h.broker.fill_order(&ack.broker_order_id, 4, dec!(10000));

    let resting = submitted(Some(ack.broker_order_id.clone()), SYMBOL);
    let unacknowledged = submitted(None, "252670");
    let mut state = SessionState::new(Uuid::new_v4());
    state.active_orders = vec![resting.clone(), unacknowledged.clone()];
    state.positions = vec![Position {
        key: PositionKey::new("233740", STRATEGY),
        quantity: 5,
        avg_price: dec!(8000),
        opened_at: Utc::now(),
        thresholds: ExitThresholds::default(),
    }];
    store.save(&state).unwrap();

    let report = manager(&h, &store).recover().await.unwrap();
    assert!(report.crashed);
    assert_eq!(report.previous_session, Some(state.session_id));
    assert_eq!(report.still_open, vec![resting.id]);
    assert_eq!(
        h.orders.get(unacknowledged.id).await.unwrap().state,
        OrderState::Failed
    );

    let kinds: Vec<GapKind> = report.gaps.iter().map(|g| g.kind).collect();
    assert!(kinds.contains(&GapKind::OrderWithoutBrokerId));
    assert!(kinds.contains(&GapKind::PositionMissing));
    assert_eq!(store.crash_log(10).unwrap().len(), 1);

    // Partial fill applied; the phantom position is gone
    let key = PositionKey::new(SYMBOL, STRATEGY);
    assert_eq!(h.orders.positions().get(&key).await.unwrap().quantity, 4);
    assert!(h
        .orders
        .positions()
        .get(&PositionKey::new("233740", STRATEGY))
        .await
        .is_none());
    let order = h.orders.get(resting.id).await.unwrap();
    assert_eq!(order.state, OrderState::PartiallyFilled);

    // The adopted order keeps being tracked
    h.broker.fill_order(&ack.broker_order_id, 6, dec!(10000));
    h.orders.check_fills().await;
    assert!(h.orders.get(resting.id).await.unwrap().is_filled());
    assert_eq!(h.orders.positions().get(&key).await.unwrap().quantity, 10);
}

#[tokio::test]
async fn test_persisted_halt_blocks_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    let mut state = SessionState::new(Uuid::new_v4());
    state.status = SessionStatus::Stopped;
    state.halt = Some(HaltRecord {
        source: HaltSource::Operator,
        reason: "manual".into(),
        at: Utc::now(),
    });
    store.save(&state).unwrap();

    let h = Harness::new();
    h.broker.set_price(SYMBOL, dec!(10000));
    let report = manager(&h, &store).recover().await.unwrap();
    assert!(!report.crashed);
    assert!(report.halt_restored);
    assert!(h.emergency.is_halted());

    let calls = h.broker.call_count();
    let err = h
        .orders
        .place_buy_with_chase(BuyRequest {
            symbol: SYMBOL.into(),
            strategy: STRATEGY.into(),
            quantity: 10,
            reference_price: dec!(10000),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::EmergencyHalt(_)));
    assert_eq!(h.broker.call_count(), calls);
}

#[tokio::test]
async fn test_checkpoint_then_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());

    let first = Harness::new();
    first.open(STRATEGY, 10, dec!(10000)).await;
    let checkpointer = SessionCheckpointer::new(
        store.clone(),
        first.orders.clone(),
        first.emergency.clone(),
        first.changed.clone(),
        Duration::from_secs(30),
        vec![],
    );
    assert!(checkpointer.save(SessionStatus::Running).await);

    // Same broker account, fresh process
    let second = Harness::with_broker(first.broker.clone(), crate::support::fast_orders());
    let report = manager(&second, &store).recover().await.unwrap();
    assert!(report.crashed);
    assert!(report.gaps.is_empty());
    assert!(report.sync.unwrap().is_clean());

    let position = second
        .orders
        .positions()
        .get(&PositionKey::new(SYMBOL, STRATEGY))
        .await
        .unwrap();
    assert_eq!(position.quantity, 10);
    assert_eq!(position.avg_price, dec!(10000));
}

#[tokio::test]
async fn test_sell_left_live_by_failed_cancel_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());

    let first = Harness::new();
    first.open(STRATEGY, 10, dec!(10000)).await;
    first.broker.set_cancel_fails(true);
    let outcome = first
        .orders
        .place_sell_with_fallback(SellRequest {
            symbol: SYMBOL.into(),
            strategy: STRATEGY.into(),
            quantity: 10,
            target_price: dec!(10100),
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    let sell_id = outcome.order_ids[0];
    let broker_id = first
        .orders
        .get(sell_id)
        .await
        .unwrap()
        .broker_order_id
        .unwrap();

    let checkpointer = SessionCheckpointer::new(
        store.clone(),
        first.orders.clone(),
        first.emergency.clone(),
        first.changed.clone(),
        Duration::from_secs(30),
        vec![],
    );
    assert!(checkpointer.save(SessionStatus::Running).await);
    assert_eq!(store.load().unwrap().unwrap().watched_orders.len(), 1);

    let second = Harness::with_broker(first.broker.clone(), crate::support::fast_orders());
    let report = manager(&second, &store).recover().await.unwrap();
    assert_eq!(report.still_open, vec![sell_id]);
    assert!(second.orders.is_watched(sell_id));

    // The resting limit fills after the restart
    second.broker.fill_order(&broker_id, 10, dec!(10100));
    let events = second.orders.check_fills().await;
    assert_eq!(events.len(), 1);

    let key = PositionKey::new(SYMBOL, STRATEGY);
    assert!(second.orders.positions().get(&key).await.is_none());
    assert_eq!(second.broker.holding(SYMBOL), 0);
    let order = second.orders.get(sell_id).await.unwrap();
    assert_eq!(order.filled_quantity, 10);
    assert!(!second.orders.is_watched(sell_id));
}

#[tokio::test]
async fn test_clean_shutdown_is_not_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    let h = Harness::new();
    let checkpointer = SessionCheckpointer::new(
        store.clone(),
        h.orders.clone(),
        h.emergency.clone(),
        h.changed.clone(),
        Duration::from_secs(30),
        vec![],
    );
    checkpointer.finish().await;

    let report = manager(&Harness::new(), &store).recover().await.unwrap();
    assert!(!report.crashed);
    assert_eq!(report.previous_session, Some(checkpointer.session_id()));
    assert!(store.crash_log(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_corrupt_state_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    std::fs::write(store.state_path(), b"{\"session_id\": ").unwrap();

    let h = Harness::new();
    let err = manager(&h, &store).recover().await.unwrap_err();
    assert!(matches!(err, RecoveryError::Corrupt { .. }));
    assert_eq!(h.broker.call_count(), 0);
}

#[tokio::test]
async fn test_unreachable_broker_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    let h = Harness::new();
    h.broker.set_price(SYMBOL, dec!(10100));
    let ack = h
        .broker
        .place_limit_order(SYMBOL, OrderSide::Buy, 10, dec!(10000))
        .await
        .unwrap();

    let mut state = SessionState::new(Uuid::new_v4());
    state.active_orders = vec![submitted(Some(ack.broker_order_id), SYMBOL)];
    store.save(&state).unwrap();

    h.broker.fail_next(BrokerError::Timeout);
    let err = manager(&h, &store).recover().await.unwrap_err();
    assert!(matches!(err, RecoveryError::BrokerUnavailable(BrokerError::Timeout)));
}
