//! One pass of the decision loop

use super::{Target, TradingEngine};
use crate::notify::TradeEvent;
use crate::order::{BuyRequest, ExecutionStatus, OrderError, SellRequest};
use crate::strategy::{MarketContext, SignalAction};
use chrono::Utc;

impl TradingEngine {
    /// Reconcile fills, then let every target decide
    pub async fn run_cycle(&self) {
        let events = self.orders.check_fills().await;
        if !events.is_empty() {
            tracing::debug!(fills = events.len(), "Fills observed by polling");
        }
        for target in &self.targets {
            if let Err(e) = self.evaluate_target(target).await {
                tracing::warn!(key = %target.key(), error = %e, "Target evaluation failed");
            }
        }
        self.heartbeat.beat();
    }

    /// Bring local positions in line with broker holdings
    ///
    /// Symbols with an order or sell chain in flight are left for the next
    /// pass.
    pub async fn sync_positions(&self) {
        match self.orders.sync_positions().await {
            Ok(report) => {
                if !report.is_clean() || !report.skipped.is_empty() {
                    tracing::info!(
                        open_positions = report.open_positions,
                        mismatches = report.mismatches.len(),
                        skipped = report.skipped.len(),
                        "Periodic position sync"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Periodic position sync failed"),
        }
    }

    async fn evaluate_target(&self, target: &Target) -> anyhow::Result<()> {
        let key = target.key();
        let symbol = &target.config.symbol;
        let position = self.orders.positions().get(&key).await;
        self.track_exit(target, position.is_some());

        let price = self.broker.get_price(symbol).await?;
        let candles = self
            .broker
            .get_candles(symbol, self.config.engine.candle_count)
            .await?;
        let ctx = MarketContext {
            symbol: symbol.clone(),
            price,
            candles,
            position: position.clone(),
            now: Utc::now(),
        };
        if !target.strategy.can_generate_signal(&ctx) {
            return Ok(());
        }

        let signal = target.strategy.generate_signal(&ctx);
        if signal.action == SignalAction::Hold {
            tracing::debug!(key = %key, reason = %signal.reason, "Hold");
            return Ok(());
        }
        if signal.confidence < self.config.engine.min_confidence {
            tracing::debug!(
                key = %key,
                action = ?signal.action,
                confidence = signal.confidence,
                "Signal below confidence floor"
            );
            return Ok(());
        }
        tracing::info!(
            key = %key,
            action = ?signal.action,
            confidence = signal.confidence,
            reason = %signal.reason,
            price = %price,
            "Signal"
        );

        match signal.action {
            SignalAction::Buy => {
                if position.is_some() || self.orders.has_pending(&key).await {
                    return Ok(());
                }
                if self.emergency.is_halted() || self.orders.entries_blocked() {
                    tracing::info!(key = %key, "Entry skipped while halted or blocked");
                    return Ok(());
                }
                let buyable = self.broker.get_buyable_quantity(symbol, price).await?;
                let quantity = target.config.max_quantity.min(buyable);
                if quantity == 0 {
                    tracing::info!(key = %key, buyable, "Nothing buyable");
                    return Ok(());
                }

                let request = BuyRequest {
                    symbol: symbol.clone(),
                    strategy: key.strategy.clone(),
                    quantity,
                    reference_price: price,
                };
                match self.orders.place_buy_with_chase(request).await {
                    Ok(outcome) if outcome.filled_quantity > 0 => {
                        target.strategy.on_entry(
                            &key,
                            outcome.filled_quantity,
                            outcome.avg_price.unwrap_or(price),
                        );
                        if let Ok(mut held) = self.held.lock() {
                            held.insert(key);
                        }
                    }
                    Ok(outcome) => {
                        tracing::info!(key = %key, status = ?outcome.status, "Entry not filled");
                    }
                    Err(OrderError::EmergencyHalt(reason)) => {
                        tracing::info!(key = %key, reason = %reason, "Entry refused by emergency stop");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            SignalAction::Sell => {
                let Some(position) = position else {
                    return Ok(());
                };
                if self.orders.has_pending_sell(&key).await {
                    return Ok(());
                }
                let outcome = self
                    .orders
                    .place_sell_with_fallback(SellRequest {
                        symbol: symbol.clone(),
                        strategy: key.strategy.clone(),
                        quantity: position.quantity,
                        target_price: price,
                    })
                    .await?;
                if outcome.status == ExecutionStatus::Filled {
                    self.notifier
                        .notify(TradeEvent::PositionClosed {
                            symbol: symbol.clone(),
                            strategy: key.strategy.clone(),
                            reason: signal.reason,
                            quantity: outcome.filled_quantity,
                            avg_price: outcome.avg_price,
                        })
                        .await;
                }
            }
            SignalAction::Hold => {}
        }
        Ok(())
    }

    /// Fire `on_exit` once when a held position has gone away
    fn track_exit(&self, target: &Target, open: bool) {
        let key = target.key();
        let closed = match self.held.lock() {
            Ok(mut held) if open => {
                held.insert(key.clone());
                false
            }
            Ok(mut held) => held.remove(&key),
            Err(_) => false,
        };
        if closed {
            target.strategy.on_exit(&key, "position closed");
        }
    }
}
