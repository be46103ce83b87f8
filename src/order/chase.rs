//! Limit-order chase for entries
//!
//! A buy starts as a limit at the reference price. Each attempt that does
//! not fill within the chase interval is cancelled, settled against the
//! broker, and resubmitted for the remainder one step higher. At most one
//! order of the chain is live at any time.

use super::pricing::{chase_price, round_to_tick};
use super::{ExecutionOutcome, ExecutionStatus, OrderError, OrderManager, OrderState};
use crate::broker::{OrderKind, OrderSide};
use crate::config::ExhaustedPolicy;
use crate::position::PositionKey;
use crate::telemetry::{incr, record_latency, CounterMetric, LatencyMetric};
use rust_decimal::Decimal;
use std::time::Instant;

/// Entry request for [`OrderManager::place_buy_with_chase`]
#[derive(Debug, Clone)]
pub struct BuyRequest {
    pub symbol: String,
    pub strategy: String,
    pub quantity: u64,
    pub reference_price: Decimal,
}

impl OrderManager {
    /// Buy `quantity` with a chasing limit order
    ///
    /// Gated on the emergency stop, the entry block, duplicate orders for the
    /// same key, and a positive quantity, in that order. The emergency stop is
    /// checked again before every resubmission.
    pub async fn place_buy_with_chase(
        &self,
        request: BuyRequest,
    ) -> Result<ExecutionOutcome, OrderError> {
        let key = PositionKey::new(&request.symbol, &request.strategy);
        self.check_entry(&key, request.quantity).await?;
        let _claim = self.claim(&key, OrderSide::Buy)?;

        let started = Instant::now();
        let outcome = self.run_chase(&key, &request).await;
        record_latency(LatencyMetric::OrderExecution, started.elapsed());

        if let Ok(outcome) = &outcome {
            tracing::info!(
                key = %key,
                status = ?outcome.status,
                requested = outcome.requested_quantity,
                filled = outcome.filled_quantity,
                avg_price = ?outcome.avg_price,
                orders = outcome.order_ids.len(),
                "Buy execution finished"
            );
        }
        outcome
    }

    async fn run_chase(
        &self,
        key: &PositionKey,
        request: &BuyRequest,
    ) -> Result<ExecutionOutcome, OrderError> {
        let quantity = request.quantity;
        let max_attempts = self.config.max_chase_attempts;
        let mut price = round_to_tick(request.reference_price, OrderSide::Buy);
        let mut chain = Vec::new();
        let mut parent = None;

        for attempt in 0..=max_attempts {
            let (filled, _) = self.chain_fills(&chain).await;
            let remaining = quantity.saturating_sub(filled);
            if remaining == 0 {
                return Ok(self
                    .outcome(ExecutionStatus::Filled, chain, quantity, None)
                    .await);
            }

            if attempt > 0 {
                if let Some(stop) = self.stop_reason() {
                    return Ok(self
                        .outcome(ExecutionStatus::Abandoned, chain, quantity, Some(stop))
                        .await);
                }
                incr(CounterMetric::ChaseResubmits);
                tracing::info!(key = %key, attempt, price = %price, remaining, "Chasing entry");
            }

            let id = self
                .submit(key, OrderSide::Buy, OrderKind::Limit, remaining, Some(price), parent)
                .await?;
            chain.push(id);
            parent = Some(id);

            let order = self.wait_for_fill(id, self.config.chase_interval()).await?;
            if order.is_filled() {
                return Ok(self
                    .outcome(ExecutionStatus::Filled, chain, quantity, None)
                    .await);
            }

            if self.cancel_and_settle(id).await? {
                tracing::error!(order_id = %id, key = %key, "Cancel did not take, stopping chase");
                self.watch(id);
                return Ok(self
                    .outcome(
                        ExecutionStatus::Abandoned,
                        chain,
                        quantity,
                        Some("cancel failed; order may still be live".into()),
                    )
                    .await);
            }

            let (filled, _) = self.chain_fills(&chain).await;
            if filled >= quantity {
                self.finalize(id, OrderState::Filled, None).await;
                return Ok(self
                    .outcome(ExecutionStatus::Filled, chain, quantity, None)
                    .await);
            }

            if attempt < max_attempts {
                self.finalize(id, OrderState::Chased, None).await;
                price = chase_price(price, OrderSide::Buy, self.config.chase_step);
                continue;
            }

            match self.config.on_exhausted {
                ExhaustedPolicy::Abandon => {
                    self.finalize(id, OrderState::Failed, Some("chase attempts exhausted".into()))
                        .await;
                    return Ok(self
                        .outcome(
                            ExecutionStatus::Abandoned,
                            chain,
                            quantity,
                            Some("chase attempts exhausted".into()),
                        )
                        .await);
                }
                ExhaustedPolicy::Market => {
                    self.finalize(id, OrderState::Chased, None).await;
                }
            }
        }

        self.convert_to_market(key, quantity, chain).await
    }

    /// Submit the unfilled remainder of a chase as a market order
    async fn convert_to_market(
        &self,
        key: &PositionKey,
        quantity: u64,
        mut chain: Vec<super::OrderId>,
    ) -> Result<ExecutionOutcome, OrderError> {
        if let Some(stop) = self.stop_reason() {
            return Ok(self
                .outcome(ExecutionStatus::Abandoned, chain, quantity, Some(stop))
                .await);
        }

        let (filled, _) = self.chain_fills(&chain).await;
        let remaining = quantity.saturating_sub(filled);
        incr(CounterMetric::MarketFallbacks);
        tracing::info!(key = %key, remaining, "Chase exhausted, converting to market");

        let parent = chain.last().copied();
        let id = self
            .submit(key, OrderSide::Buy, OrderKind::Market, remaining, None, parent)
            .await?;
        chain.push(id);

        let order = self
            .wait_for_fill(id, self.config.market_fill_timeout())
            .await?;
        if order.is_filled() {
            return Ok(self
                .outcome(ExecutionStatus::Filled, chain, quantity, None)
                .await);
        }

        let live = self.cancel_and_settle(id).await?;
        if live {
            self.watch(id);
        }
        self.finalize(
            id,
            OrderState::Failed,
            Some("market order not filled within timeout".into()),
        )
        .await;
        let (filled, _) = self.chain_fills(&chain).await;
        let status = if filled >= quantity {
            ExecutionStatus::Filled
        } else {
            ExecutionStatus::Failed
        };
        Ok(self.outcome(status, chain, quantity, None).await)
    }

    fn stop_reason(&self) -> Option<String> {
        if let Some(reason) = self.emergency.halt_reason() {
            return Some(format!("emergency stop: {}", reason));
        }
        self.entries_blocked()
            .then(|| "entries blocked".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimulatedBroker;
    use crate::config::{ChaseStep, OrderConfig};
    use crate::exit::ExitThresholds;
    use crate::notify::LogNotifier;
    use crate::position::PositionManager;
    use crate::safety::{EmergencyStop, HaltSource};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn setup(config: OrderConfig) -> (Arc<SimulatedBroker>, OrderManager) {
        let broker = Arc::new(SimulatedBroker::default());
        let changed = Arc::new(Notify::new());
        let positions = Arc::new(PositionManager::new(ExitThresholds::default(), changed.clone()));
        let manager = OrderManager::new(
            broker.clone(),
            positions,
            Arc::new(EmergencyStop::new()),
            Arc::new(LogNotifier),
            config,
            changed,
        );
        (broker, manager)
    }

    fn fast(max_chase_attempts: u32, on_exhausted: ExhaustedPolicy) -> OrderConfig {
        OrderConfig {
            poll_interval_ms: 5,
            chase_interval_ms: 30,
            market_fill_timeout_ms: 30,
            max_chase_attempts,
            chase_step: ChaseStep::Ticks { count: 2 },
            on_exhausted,
            ..Default::default()
        }
    }

    fn buy(quantity: u64, price: Decimal) -> BuyRequest {
        BuyRequest {
            symbol: "122630".into(),
            strategy: "breakout".into(),
            quantity,
            reference_price: price,
        }
    }

    #[tokio::test]
    async fn test_immediate_fill() {
        let (broker, om) = setup(fast(3, ExhaustedPolicy::Market));
        broker.set_price("122630", dec!(10000));

        let outcome = om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        assert_eq!(outcome.filled_quantity, 10);
        assert_eq!(outcome.order_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_chase_steps_up_two_ticks() {
        let (broker, om) = setup(fast(3, ExhaustedPolicy::Market));
        broker.set_price("122630", dec!(10010));

        let outcome = om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        assert_eq!(outcome.order_ids.len(), 2);

        let prices: Vec<_> = broker.placed_orders().iter().map(|o| o.price).collect();
        assert_eq!(prices, vec![Some(dec!(10000)), Some(dec!(10010))]);
        assert_eq!(
            om.get(outcome.order_ids[0]).await.unwrap().state,
            OrderState::Chased
        );
        assert_eq!(broker.max_live_orders("122630"), 1);

        let position = om
            .positions()
            .get(&PositionKey::new("122630", "breakout"))
            .await
            .unwrap();
        assert_eq!(position.quantity, 10);
        assert_eq!(position.avg_price, dec!(10010));
    }

    #[tokio::test]
    async fn test_exhausted_abandon_fails_last_order() {
        let (broker, om) = setup(fast(1, ExhaustedPolicy::Abandon));
        broker.set_price("122630", dec!(11000));

        let outcome = om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Abandoned);
        assert_eq!(outcome.order_ids.len(), 2);
        let last = om.get(outcome.order_ids[1]).await.unwrap();
        assert_eq!(last.state, OrderState::Failed);
        assert_eq!(broker.live_orders("122630"), 0);
    }

    #[tokio::test]
    async fn test_exhausted_converts_to_market() {
        let (broker, om) = setup(fast(1, ExhaustedPolicy::Market));
        broker.set_price("122630", dec!(11000));

        let outcome = om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        assert_eq!(outcome.order_ids.len(), 3);
        assert_eq!(broker.placed_orders()[2].kind, OrderKind::Market);
    }

    #[tokio::test]
    async fn test_partial_fill_chases_remainder() {
        let (broker, om) = setup(fast(3, ExhaustedPolicy::Market));
        broker.set_price("122630", dec!(10010));
        broker.fill_on_next_cancel(4);

        let outcome = om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        assert_eq!(outcome.filled_quantity, 10);
        assert_eq!(broker.placed_orders()[1].quantity, 6);
    }

    #[tokio::test]
    async fn test_failed_cancel_stops_chase() {
        let (broker, om) = setup(fast(3, ExhaustedPolicy::Market));
        broker.set_price("122630", dec!(11000));
        broker.set_cancel_fails(true);

        let outcome = om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Abandoned);
        assert_eq!(broker.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_emergency_rejects_before_network() {
        let (broker, om) = setup(fast(3, ExhaustedPolicy::Market));
        broker.set_price("122630", dec!(10000));
        om.emergency.trigger(HaltSource::Operator, "test");

        let err = om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap_err();
        assert!(matches!(err, OrderError::EmergencyHalt(_)));
        assert_eq!(broker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_entries_for_one_key() {
        let (broker, om) = setup(fast(0, ExhaustedPolicy::Abandon));
        broker.set_price("122630", dec!(11000));

        let (first, second) = tokio::join!(
            om.place_buy_with_chase(buy(10, dec!(10000))),
            om.place_buy_with_chase(buy(10, dec!(10000)))
        );
        let refused = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(OrderError::DuplicateOrder(_))))
            .count();
        assert_eq!(refused, 1);
        assert_eq!(broker.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected() {
        let (broker, om) = setup(fast(3, ExhaustedPolicy::Market));
        let err = om.place_buy_with_chase(buy(0, dec!(10000))).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidQuantity(0)));
        assert_eq!(broker.call_count(), 0);
    }
}
