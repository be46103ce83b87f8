//! Limit sell with market fallback

use super::pricing::round_to_tick;
use super::{ExecutionOutcome, ExecutionStatus, OrderError, OrderId, OrderManager, OrderState};
use crate::broker::{OrderKind, OrderSide};
use crate::position::PositionKey;
use crate::telemetry::{incr, record_latency, CounterMetric, LatencyMetric};
use rust_decimal::Decimal;
use std::time::Instant;

/// Exit request for [`OrderManager::place_sell_with_fallback`]
#[derive(Debug, Clone)]
pub struct SellRequest {
    pub symbol: String,
    pub strategy: String,
    pub quantity: u64,
    pub target_price: Decimal,
}

impl OrderManager {
    /// Sell at a limit, falling back to market for whatever is left
    ///
    /// Sells are not gated by the emergency stop. Every order in the chain
    /// ends terminal. The outcome is FILLED or FAILED, or ABANDONED when the
    /// position was already closed by another order before the fallback.
    /// Only one sell chain per key runs at a time.
    pub async fn place_sell_with_fallback(
        &self,
        request: SellRequest,
    ) -> Result<ExecutionOutcome, OrderError> {
        let key = PositionKey::new(&request.symbol, &request.strategy);
        if request.quantity == 0 {
            return Err(OrderError::InvalidQuantity(0));
        }
        let _claim = self.claim(&key, OrderSide::Sell)?;

        let started = Instant::now();
        let outcome = self.run_fallback(&key, &request).await;
        record_latency(LatencyMetric::OrderExecution, started.elapsed());

        if let Ok(outcome) = &outcome {
            tracing::info!(
                key = %key,
                status = ?outcome.status,
                requested = outcome.requested_quantity,
                filled = outcome.filled_quantity,
                avg_price = ?outcome.avg_price,
                "Sell execution finished"
            );
        }
        outcome
    }

    async fn run_fallback(
        &self,
        key: &PositionKey,
        request: &SellRequest,
    ) -> Result<ExecutionOutcome, OrderError> {
        let quantity = request.quantity;
        let price = round_to_tick(request.target_price, OrderSide::Sell);

        let id = self
            .submit(key, OrderSide::Sell, OrderKind::Limit, quantity, Some(price), None)
            .await?;
        let mut chain: Vec<OrderId> = vec![id];

        let order = self
            .wait_for_fill(id, self.config.sell_fallback_timeout())
            .await?;
        if order.is_filled() {
            return Ok(self
                .outcome(ExecutionStatus::Filled, chain, quantity, None)
                .await);
        }

        if self.cancel_and_settle(id).await? {
            // Selling the remainder at market could oversell
            self.watch(id);
            self.finalize(
                id,
                OrderState::Failed,
                Some("cancel failed; limit sell may still be live".into()),
            )
            .await;
            return Ok(self
                .outcome(
                    ExecutionStatus::Failed,
                    chain,
                    quantity,
                    Some("limit sell could not be cancelled".into()),
                )
                .await);
        }
        self.finalize(id, OrderState::Cancelled, None).await;

        let (filled, _) = self.chain_fills(&chain).await;
        if filled >= quantity {
            return Ok(self
                .outcome(ExecutionStatus::Filled, chain, quantity, None)
                .await);
        }

        // Another close may have reduced the position meanwhile
        let held = self.positions.get(key).await.map(|p| p.quantity).unwrap_or(0);
        let remaining = (quantity - filled).min(held);
        if remaining == 0 {
            tracing::info!(key = %key, filled, "Position already closed, skipping market fallback");
            return Ok(self
                .outcome(
                    ExecutionStatus::Abandoned,
                    chain,
                    quantity,
                    Some("position closed by another order".into()),
                )
                .await);
        }
        incr(CounterMetric::MarketFallbacks);
        tracing::info!(key = %key, remaining, "Limit sell timed out, falling back to market");

        let market_id = match self
            .submit(key, OrderSide::Sell, OrderKind::Market, remaining, None, Some(id))
            .await
        {
            Ok(market_id) => market_id,
            Err(e) => {
                return Ok(self
                    .outcome(
                        ExecutionStatus::Failed,
                        chain,
                        quantity,
                        Some(format!("market fallback failed: {}", e)),
                    )
                    .await);
            }
        };
        chain.push(market_id);

        let order = self
            .wait_for_fill(market_id, self.config.market_fill_timeout())
            .await?;
        if order.is_filled() {
            return Ok(self
                .outcome(ExecutionStatus::Filled, chain, quantity, None)
                .await);
        }

        if self.cancel_and_settle(market_id).await? {
            self.watch(market_id);
        }
        self.finalize(
            market_id,
            OrderState::Failed,
            Some("market sell not filled within timeout".into()),
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

    /// Submit a market sell without waiting for the fill
    ///
    /// Used by liquidation, which settles orders itself. Refused while a
    /// sell chain owns the key or a sell for it is still open.
    pub async fn place_market_sell(
        &self,
        symbol: &str,
        strategy: &str,
        quantity: u64,
    ) -> Result<OrderId, OrderError> {
        let key = PositionKey::new(symbol, strategy);
        let _claim = self.claim(&key, OrderSide::Sell)?;
        self.submit(&key, OrderSide::Sell, OrderKind::Market, quantity, None, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimulatedBroker;
    use crate::config::OrderConfig;
    use crate::exit::ExitThresholds;
    use crate::notify::LogNotifier;
    use crate::order::chase::BuyRequest;
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

    fn fast() -> OrderConfig {
        OrderConfig {
            poll_interval_ms: 5,
            chase_interval_ms: 30,
            sell_fallback_timeout_ms: 30,
            market_fill_timeout_ms: 30,
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

    fn sell(quantity: u64, price: Decimal) -> SellRequest {
        SellRequest {
            symbol: "122630".into(),
            strategy: "breakout".into(),
            quantity,
            target_price: price,
        }
    }

    #[tokio::test]
    async fn test_sell_fills_at_limit() {
        let (broker, om) = setup(fast());
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();

        let outcome = om.place_sell_with_fallback(sell(10, dec!(10000))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        assert_eq!(outcome.order_ids.len(), 1);
        assert!(om.positions().get(&PositionKey::new("122630", "breakout")).await.is_none());
    }

    #[tokio::test]
    async fn test_sell_falls_back_to_market() {
        let (broker, om) = setup(fast());
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();

        // Limit above the market rests until the fallback timer expires
        let outcome = om.place_sell_with_fallback(sell(10, dec!(10100))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        assert_eq!(outcome.order_ids.len(), 2);
        let placed = broker.placed_orders();
        assert_eq!(placed.last().unwrap().kind, OrderKind::Market);
        assert_eq!(broker.holding("122630"), 0);

        let limit = om.get(outcome.order_ids[0]).await.unwrap();
        assert_eq!(limit.state, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn test_sell_partial_limit_then_market_remainder() {
        let (broker, om) = setup(fast());
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();

        broker.fill_on_next_cancel(4);
        let outcome = om.place_sell_with_fallback(sell(10, dec!(10100))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
        let market = broker.placed_orders().last().cloned().unwrap();
        assert_eq!(market.kind, OrderKind::Market);
        assert_eq!(market.quantity, 6);
        assert_eq!(broker.holding("122630"), 0);
    }

    #[tokio::test]
    async fn test_sell_skips_market_when_cancel_fails() {
        let (broker, om) = setup(fast());
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();

        broker.set_cancel_fails(true);
        let outcome = om.place_sell_with_fallback(sell(10, dec!(10100))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.order_ids.len(), 1);
        assert!(broker
            .placed_orders()
            .iter()
            .all(|o| o.kind == OrderKind::Limit || o.side == OrderSide::Buy));
        assert!(om.get(outcome.order_ids[0]).await.unwrap().state.is_terminal());
    }

    #[tokio::test]
    async fn test_sell_unfilled_market_ends_failed() {
        let (broker, om) = setup(fast());
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();

        broker.set_fill_market_orders(false);
        let outcome = om.place_sell_with_fallback(sell(10, dec!(10100))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        for id in &outcome.order_ids {
            assert!(om.get(*id).await.unwrap().state.is_terminal());
        }
    }

    #[tokio::test]
    async fn test_one_sell_chain_per_key() {
        let (broker, om) = setup(OrderConfig {
            sell_fallback_timeout_ms: 200,
            ..fast()
        });
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();

        let key = PositionKey::new("122630", "breakout");
        let (first, second) = tokio::join!(
            om.place_sell_with_fallback(sell(10, dec!(10100))),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                assert!(om.sell_in_flight(&key));
                let direct = om.place_market_sell("122630", "breakout", 10).await;
                let chained = om.place_sell_with_fallback(sell(10, dec!(10000))).await;
                (direct, chained)
            }
        );
        assert_eq!(first.unwrap().status, ExecutionStatus::Filled);
        assert!(matches!(second.0, Err(OrderError::DuplicateOrder(_))));
        assert!(matches!(second.1, Err(OrderError::DuplicateOrder(_))));
        assert!(!om.sell_in_flight(&key));
        assert_eq!(
            broker
                .placed_orders()
                .iter()
                .filter(|o| o.side == OrderSide::Sell)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_open_sell_blocks_second_submission() {
        let (broker, om) = setup(fast());
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();
        broker.set_fill_market_orders(false);

        let key = PositionKey::new("122630", "breakout");
        let first = om.place_market_sell("122630", "breakout", 10).await.unwrap();
        assert!(om.has_pending_sell(&key).await);
        let err = om.place_market_sell("122630", "breakout", 10).await.unwrap_err();
        assert!(matches!(err, OrderError::DuplicateOrder(_)));
        assert!(!om.get(first).await.unwrap().state.is_terminal());
    }

    #[tokio::test]
    async fn test_no_market_fallback_once_position_is_gone() {
        let (broker, om) = setup(fast());
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();

        // The broker no longer reports the holding and a sync drops it while
        // the limit rests
        let key = PositionKey::new("122630", "breakout");
        let (outcome, _) = tokio::join!(
            om.place_sell_with_fallback(sell(10, dec!(10100))),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                let empty = SimulatedBroker::default();
                om.positions().sync_with_broker(&empty).await.unwrap();
                assert!(om.positions().get(&key).await.is_none());
            }
        );
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Abandoned);
        assert_eq!(outcome.order_ids.len(), 1);
        assert!(broker.placed_orders().iter().all(|o| o.kind == OrderKind::Limit));
    }

    #[tokio::test]
    async fn test_sell_allowed_during_emergency() {
        let (broker, om) = setup(fast());
        broker.set_price("122630", dec!(10000));
        om.place_buy_with_chase(buy(10, dec!(10000))).await.unwrap();

        om.emergency.trigger(HaltSource::Operator, "test");
        let outcome = om.place_sell_with_fallback(sell(10, dec!(10000))).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Filled);
    }
}
