//! Full engine lifecycle against the simulated broker

use crate::support::{RecordingNotifier, SYMBOL, STRATEGY};
use chrono::Utc;
use leverage_worker::broker::{Candle, SimulatedBroker};
use leverage_worker::config::{Config, TargetConfig};
use leverage_worker::engine::TradingEngine;
use leverage_worker::feed::PollingFeed;
use leverage_worker::position::PositionKey;
use leverage_worker::recovery::{SessionStatus, SessionStore};
use leverage_worker::strategy::StrategyRegistry;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.recovery.state_dir = dir.join("state");
    config.emergency.stop_file = dir.join("EMERGENCY_STOP");
    config.liquidation.enabled = false;
    config.engine.cycle_interval_secs = 1;
    config.orders.poll_interval_ms = 5;
    config.orders.chase_interval_ms = 30;
    config.engine.targets = vec![TargetConfig {
        symbol: SYMBOL.into(),
        strategy: STRATEGY.into(),
        max_quantity: 10,
        params: HashMap::from([("lookback".to_string(), 3.0)]),
    }];
    config
}

fn broker() -> Arc<SimulatedBroker> {
    let broker = Arc::new(SimulatedBroker::default());
    broker.set_price(SYMBOL, dec!(10100));
    let candles = [dec!(10000), dec!(10050), dec!(10020), dec!(10100)]
        .iter()
        .map(|p| Candle {
            time: Utc::now(),
            open: *p - dec!(10),
            high: *p,
            low: *p - dec!(20),
            close: *p,
            volume: 1000,
        })
        .collect();
    broker.set_candles(SYMBOL, candles);
    broker
}

async fn run_for(config: Config, broker: Arc<SimulatedBroker>, duration: Duration) -> anyhow::Result<()> {
    let feed = Arc::new(PollingFeed::new(broker.clone(), Duration::from_millis(50)));
    let engine = TradingEngine::new(
        config,
        broker,
        feed,
        Arc::new(RecordingNotifier::default()),
        &StrategyRegistry::builtin(),
    )?;
    let shutdown = CancellationToken::new();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        stopper.cancel();
    });
    engine.run(shutdown).await
}

#[tokio::test]
async fn test_run_stop_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker();

    run_for(config(dir.path()), broker.clone(), Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(broker.holding(SYMBOL), 10);
    assert_eq!(broker.placed_orders().len(), 1);

    let store = SessionStore::new(dir.path().join("state"));
    let state = store.load().unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Stopped);
    assert_eq!(state.positions.len(), 1);
    assert_eq!(state.positions[0].key, PositionKey::new(SYMBOL, STRATEGY));
    assert!(state.active_orders.is_empty());

    // The restored position keeps the breakout from entering twice
    run_for(config(dir.path()), broker.clone(), Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(broker.placed_orders().len(), 1);
    let restarted = store.load().unwrap().unwrap();
    assert_ne!(restarted.session_id, state.session_id);
    assert_eq!(restarted.status, SessionStatus::Stopped);
    assert_eq!(restarted.positions.len(), 1);
    assert!(store.crash_log(5).unwrap().is_empty());
}

#[tokio::test]
async fn test_corrupt_state_refuses_to_trade() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker();
    let state_dir = dir.path().join("state");
    std::fs::create_dir_all(&state_dir).unwrap();
    std::fs::write(SessionStore::new(&state_dir).state_path(), "{ not json").unwrap();

    let err = run_for(config(dir.path()), broker.clone(), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("corrupt"));
    assert!(broker.placed_orders().is_empty());
}

#[tokio::test]
async fn test_unknown_strategy_rejected_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.engine.targets[0].strategy = "martingale".into();
    let broker = broker();
    let feed = Arc::new(PollingFeed::new(broker.clone(), Duration::from_millis(50)));
    let result = TradingEngine::new(
        config,
        broker,
        feed,
        Arc::new(RecordingNotifier::default()),
        &StrategyRegistry::builtin(),
    );
    assert!(result.is_err());
}
