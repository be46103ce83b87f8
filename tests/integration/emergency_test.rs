//! Emergency stop sources and their effect on order flow

use crate::support::{eventually, Harness, STRATEGY, SYMBOL};
use leverage_worker::broker::{Broker, BrokerError};
use leverage_worker::config::HealthConfig;
use leverage_worker::order::{BuyRequest, OrderError, SellRequest};
use leverage_worker::safety::{
    ApiCheck, HaltSource, HealthCheck, HealthChecker, HealthStatus, StopFileWatcher,
};
use rust_decimal_macros::dec;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn buy() -> BuyRequest {
    BuyRequest {
        symbol: SYMBOL.into(),
        strategy: STRATEGY.into(),
        quantity: 10,
        reference_price: dec!(10000),
    }
}

#[tokio::test]
async fn test_stop_file_halts_entries_but_not_exits() {
    let dir = tempfile::tempdir().unwrap();
    let stop_file = dir.path().join("EMERGENCY_STOP");
    let h = Harness::new();
    h.open(STRATEGY, 10, dec!(10000)).await;

    let shutdown = CancellationToken::new();
    StopFileWatcher::new(h.emergency.clone(), &stop_file, Duration::from_millis(10))
        .start(shutdown.clone());
    std::fs::write(&stop_file, "broker maintenance").unwrap();

    let emergency = h.emergency.clone();
    assert!(
        eventually(Duration::from_secs(1), || {
            let emergency = emergency.clone();
            async move { emergency.is_halted() }
        })
        .await
    );
    shutdown.cancel();
    let record = h.emergency.halt_record().unwrap();
    assert_eq!(record.source, HaltSource::StopFile);
    assert_eq!(record.reason, "broker maintenance");

    let calls = h.broker.call_count();
    let err = assert_err!(
        h.orders
            .place_buy_with_chase(BuyRequest {
                strategy: "scalper".into(),
                ..buy()
            })
            .await
    );
    assert!(matches!(err, OrderError::EmergencyHalt(_)));
    assert_eq!(h.broker.call_count(), calls);

    // Closing existing exposure is still allowed
    let outcome = assert_ok!(
        h.orders
            .place_sell_with_fallback(SellRequest {
                symbol: SYMBOL.into(),
                strategy: STRATEGY.into(),
                quantity: 10,
                target_price: dec!(10000),
            })
            .await
    );
    assert!(outcome.is_filled());
}

#[tokio::test]
async fn test_api_failures_trip_health_halt() {
    let h = Harness::new();
    h.broker.set_price(SYMBOL, dec!(10000));
    let config = HealthConfig {
        failure_threshold: 2,
        api_degraded_after: 1,
        api_unhealthy_after: 3,
        ..Default::default()
    };
    let checks: Vec<Box<dyn HealthCheck>> =
        vec![Box::new(ApiCheck::new(h.broker.stats(), 1, 3))];
    let checker = HealthChecker::new(&config, checks, h.emergency.clone());

    for _ in 0..3 {
        h.broker.fail_next(BrokerError::Timeout);
        assert!(h.broker.get_price(SYMBOL).await.is_err());
    }
    assert_eq!(checker.run_once().await.overall, HealthStatus::Unhealthy);
    assert!(!h.emergency.is_halted());
    assert_eq!(checker.run_once().await.overall, HealthStatus::Unhealthy);
    assert!(h.emergency.is_halted());
    assert_eq!(h.emergency.halt_record().unwrap().source, HaltSource::HealthCheck);

    // Recovered connectivity does not lift the halt
    assert!(h.broker.get_price(SYMBOL).await.is_ok());
    assert_eq!(checker.run_once().await.overall, HealthStatus::Healthy);
    assert!(h.emergency.is_halted());
    assert!(matches!(
        h.orders.place_buy_with_chase(buy()).await,
        Err(OrderError::EmergencyHalt(_))
    ));

    h.emergency.clear("ops");
    assert_ok!(h.orders.place_buy_with_chase(buy()).await);
}
