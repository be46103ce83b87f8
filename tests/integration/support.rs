//! Shared fixtures

use leverage_worker::broker::SimulatedBroker;
use leverage_worker::config::OrderConfig;
use leverage_worker::exit::ExitThresholds;
use leverage_worker::notify::{Notifier, TradeEvent};
use leverage_worker::order::{BuyRequest, OrderManager};
use leverage_worker::position::PositionManager;
use leverage_worker::safety::EmergencyStop;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const SYMBOL: &str = "122630";
pub const STRATEGY: &str = "breakout";

/// Notifier that keeps every event for assertions
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<TradeEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<TradeEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: TradeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn fast_orders() -> OrderConfig {
    OrderConfig {
        poll_interval_ms: 5,
        chase_interval_ms: 30,
        sell_fallback_timeout_ms: 30,
        market_fill_timeout_ms: 50,
        ..Default::default()
    }
}

pub struct Harness {
    pub broker: Arc<SimulatedBroker>,
    pub orders: Arc<OrderManager>,
    pub emergency: Arc<EmergencyStop>,
    pub changed: Arc<Notify>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_broker(Arc::new(SimulatedBroker::default()), fast_orders())
    }

    pub fn with_broker(broker: Arc<SimulatedBroker>, config: OrderConfig) -> Self {
        let changed = Arc::new(Notify::new());
        let positions = Arc::new(PositionManager::new(ExitThresholds::default(), changed.clone()));
        let emergency = Arc::new(EmergencyStop::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let orders = Arc::new(OrderManager::new(
            broker.clone(),
            positions,
            emergency.clone(),
            notifier.clone(),
            config,
            changed.clone(),
        ));
        Self {
            broker,
            orders,
            emergency,
            changed,
            notifier,
        }
    }

    /// Open a filled position at `price`
    pub async fn open(&self, strategy: &str, quantity: u64, price: Decimal) {
        self.broker.set_price(SYMBOL, price);
        let outcome = self
            .orders
            .place_buy_with_chase(BuyRequest {
                symbol: SYMBOL.into(),
                strategy: strategy.into(),
                quantity,
                reference_price: price,
            })
            .await
            .unwrap();
        assert!(outcome.is_filled());
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
