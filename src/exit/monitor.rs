//! Exit monitor
//!
//! Consumes the stream. Ticks are checked against every open position of
//! the symbol; order notices are routed to fill reconciliation.

use super::ExitReason;
use crate::feed::{PriceTick, StreamEvent};
use crate::notify::{Notifier, TradeEvent};
use crate::order::{ExecutionOutcome, ExecutionStatus, OrderError, OrderManager, SellRequest};
use crate::position::PositionKey;
use crate::telemetry::{incr, CounterMetric};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A threshold breach that should close a position
#[derive(Debug, Clone, PartialEq)]
pub struct ExitTrigger {
    pub key: PositionKey,
    pub reason: ExitReason,
    pub price: Decimal,
    pub quantity: u64,
}

pub struct ExitMonitor {
    orders: Arc<OrderManager>,
    notifier: Arc<dyn Notifier>,
    dedup_window: Duration,
    recent: Mutex<HashMap<(PositionKey, ExitReason), Instant>>,
}

impl ExitMonitor {
    pub fn new(orders: Arc<OrderManager>, notifier: Arc<dyn Notifier>, dedup_window: Duration) -> Self {
        Self {
            orders,
            notifier,
            dedup_window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate a tick and return the triggers that pass de-duplication
    ///
    /// Returned triggers are recorded, so a second call inside the window for
    /// the same position and reason yields nothing.
    pub async fn evaluate_tick(&self, tick: &PriceTick) -> Vec<ExitTrigger> {
        let positions = self.orders.positions().for_symbol(&tick.symbol).await;
        if positions.is_empty() {
            return vec![];
        }

        let now = Utc::now();
        let mut triggers = Vec::new();
        for position in positions {
            let held = position.holding_time(now);
            let Some(reason) = position
                .thresholds
                .evaluate(position.avg_price, tick.price, held)
            else {
                continue;
            };
            if self.orders.sell_in_flight(&position.key)
                || self.orders.has_pending_sell(&position.key).await
            {
                tracing::debug!(key = %position.key, ?reason, "Sell already in flight");
                continue;
            }
            if !self.claim(&position.key, reason) {
                tracing::debug!(key = %position.key, ?reason, "Suppressed duplicate trigger");
                continue;
            }

            tracing::info!(
                key = %position.key,
                ?reason,
                price = %tick.price,
                entry = %position.avg_price,
                profit_pct = %position.profit_pct(tick.price).round_dp(2),
                "Exit triggered"
            );
            incr(CounterMetric::ExitTriggers);
            triggers.push(ExitTrigger {
                key: position.key,
                reason,
                price: tick.price,
                quantity: position.quantity,
            });
        }
        triggers
    }

    /// Record a trigger unless one for the same position and reason is recent
    fn claim(&self, key: &PositionKey, reason: ExitReason) -> bool {
        let Ok(mut recent) = self.recent.lock() else {
            return true;
        };
        let now = Instant::now();
        recent.retain(|_, at| now.duration_since(*at) < self.dedup_window);
        let slot = (key.clone(), reason);
        if recent.contains_key(&slot) {
            return false;
        }
        recent.insert(slot, now);
        true
    }

    /// Close the position behind a trigger
    pub async fn execute(&self, trigger: ExitTrigger) -> Result<ExecutionOutcome, OrderError> {
        let outcome = self
            .orders
            .place_sell_with_fallback(SellRequest {
                symbol: trigger.key.symbol.clone(),
                strategy: trigger.key.strategy.clone(),
                quantity: trigger.quantity,
                target_price: trigger.price,
            })
            .await?;

        if outcome.status == ExecutionStatus::Filled {
            self.notifier
                .notify(TradeEvent::PositionClosed {
                    symbol: trigger.key.symbol,
                    strategy: trigger.key.strategy,
                    reason: format!("{:?}", trigger.reason),
                    quantity: outcome.filled_quantity,
                    avg_price: outcome.avg_price,
                })
                .await;
        }
        Ok(outcome)
    }

    /// Handle one stream event; sells run on their own tasks
    pub async fn handle_event(self: &Arc<Self>, event: StreamEvent) {
        match event {
            StreamEvent::Tick(tick) => {
                for trigger in self.evaluate_tick(&tick).await {
                    let monitor = self.clone();
                    tokio::spawn(async move {
                        let key = trigger.key.clone();
                        match monitor.execute(trigger).await {
                            Ok(_) => {}
                            Err(OrderError::DuplicateOrder(_)) => {
                                tracing::info!(key = %key, "Another sell owns the position");
                            }
                            Err(e) => tracing::error!(key = %key, error = %e, "Exit order failed"),
                        }
                    });
                }
            }
            StreamEvent::OrderNotice { broker_order_id } => match broker_order_id {
                Some(id) => {
                    if let Err(e) = self.orders.reconcile_broker_order(&id).await {
                        tracing::warn!(broker_order_id = %id, error = %e, "Notice reconcile failed");
                    }
                }
                None => {
                    self.orders.check_fills().await;
                }
            },
            StreamEvent::Connected => tracing::info!("Exit monitor stream connected"),
            StreamEvent::Disconnected => tracing::warn!("Exit monitor stream disconnected"),
        }
    }

    pub fn start(
        self: Arc<Self>,
        mut events: mpsc::Receiver<StreamEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(dedup_ms = self.dedup_window.as_millis() as u64, "Exit monitor started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::warn!("Event stream closed");
                            break;
                        }
                    },
                }
            }
            tracing::info!("Exit monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimulatedBroker;
    use crate::config::OrderConfig;
    use crate::exit::ExitThresholds;
    use crate::notify::LogNotifier;
    use crate::order::BuyRequest;
    use crate::position::PositionManager;
    use crate::safety::EmergencyStop;
    use rust_decimal_macros::dec;
    use tokio::sync::Notify;

    async fn setup() -> (Arc<SimulatedBroker>, Arc<OrderManager>) {
        let broker = Arc::new(SimulatedBroker::default());
        let changed = Arc::new(Notify::new());
        let positions = Arc::new(PositionManager::new(ExitThresholds::default(), changed.clone()));
        let orders = Arc::new(OrderManager::new(
            broker.clone(),
            positions,
            Arc::new(EmergencyStop::new()),
            Arc::new(LogNotifier),
            OrderConfig {
                poll_interval_ms: 5,
                sell_fallback_timeout_ms: 30,
                market_fill_timeout_ms: 30,
                ..Default::default()
            },
            changed,
        ));
        broker.set_price("122630", dec!(10000));
        orders
            .place_buy_with_chase(BuyRequest {
                symbol: "122630".into(),
                strategy: "breakout".into(),
                quantity: 10,
                reference_price: dec!(10000),
            })
            .await
            .unwrap();
        (broker, orders)
    }

    fn tick(price: Decimal) -> PriceTick {
        PriceTick {
            symbol: "122630".into(),
            price,
            volume: 1,
            timestamp: Utc::now(),
            exchange_ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_no_trigger_inside_band() {
        let (_broker, orders) = setup().await;
        let monitor = ExitMonitor::new(orders, Arc::new(LogNotifier), Duration::from_secs(5));
        assert!(monitor.evaluate_tick(&tick(dec!(10100))).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_deduplicated() {
        let (_broker, orders) = setup().await;
        let monitor = ExitMonitor::new(orders, Arc::new(LogNotifier), Duration::from_secs(5));

        let first = monitor.evaluate_tick(&tick(dec!(9790))).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].reason, ExitReason::StopLoss);
        assert_eq!(first[0].quantity, 10);

        assert!(monitor.evaluate_tick(&tick(dec!(9780))).await.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_again_after_window() {
        let (_broker, orders) = setup().await;
        let monitor = ExitMonitor::new(orders, Arc::new(LogNotifier), Duration::from_millis(20));

        assert_eq!(monitor.evaluate_tick(&tick(dec!(9790))).await.len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(monitor.evaluate_tick(&tick(dec!(9790))).await.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_closes_position() {
        let (broker, orders) = setup().await;
        let monitor = ExitMonitor::new(orders.clone(), Arc::new(LogNotifier), Duration::from_secs(5));
        broker.set_price("122630", dec!(10400));

        let trigger = monitor.evaluate_tick(&tick(dec!(10400))).await.remove(0);
        assert_eq!(trigger.reason, ExitReason::TakeProfit);
        let outcome = monitor.execute(trigger).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        assert_eq!(orders.positions().open_count().await, 0);
    }

    #[tokio::test]
    async fn test_notice_with_order_number_reconciles() {
        let (broker, orders) = setup().await;
        let monitor = Arc::new(ExitMonitor::new(
            orders.clone(),
            Arc::new(LogNotifier),
            Duration::from_secs(5),
        ));
        // The simulator fills the market sell on submission; only the notice tells us
        let id = orders
            .place_market_sell("122630", "breakout", 10)
            .await
            .unwrap();
        let order = orders.get(id).await.unwrap();
        assert_eq!(order.filled_quantity, 0);
        let broker_id = order.broker_order_id.unwrap();
        assert_eq!(broker.holding("122630"), 0);

        monitor
            .handle_event(StreamEvent::OrderNotice {
                broker_order_id: Some(broker_id),
            })
            .await;
        assert!(orders.get(id).await.unwrap().is_filled());
        assert_eq!(orders.positions().open_count().await, 0);
    }
}
