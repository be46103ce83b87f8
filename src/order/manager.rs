//! Order manager
//!
//! Sole owner of order records. Every observed fill, whether found by
//! polling or announced by the real-time stream, goes through
//! [`OrderManager::apply_fill`], which updates the order and the position
//! cache under one lock (orders first, then positions).

use super::{ExecutionOutcome, ExecutionStatus, FillEvent, Order, OrderError, OrderId, OrderState};
use crate::broker::{Broker, BrokerError, BrokerOrderState, BrokerOrderStatus, OrderKind, OrderSide};
use crate::config::OrderConfig;
use crate::notify::{Notifier, TradeEvent};
use crate::position::{PositionKey, PositionManager, SyncReport};
use crate::safety::EmergencyStop;
use crate::telemetry::{incr, set_gauge, CounterMetric, GaugeMetric};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep, Instant};

/// Result of a bulk cancellation
#[derive(Debug, Clone, Default, Serialize)]
pub struct CancelReport {
    pub requested: usize,
    pub cancelled: usize,
    /// Orders that could not be confirmed cancelled, with the reason
    pub failed: Vec<(OrderId, String)>,
}

/// Exclusive right to run a chain for one side of a key
pub(super) struct ExecutionClaim<'a> {
    manager: &'a OrderManager,
    slot: (PositionKey, OrderSide),
}

impl Drop for ExecutionClaim<'_> {
    fn drop(&mut self) {
        self.manager
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.slot);
    }
}

/// Owns the order lifecycle
pub struct OrderManager {
    pub(super) broker: Arc<dyn Broker>,
    pub(super) positions: Arc<PositionManager>,
    pub(super) emergency: Arc<EmergencyStop>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) config: OrderConfig,
    orders: RwLock<HashMap<OrderId, Order>>,
    /// Orders whose broker side may still be live after a failed cancel
    watch: Mutex<HashSet<OrderId>>,
    /// Keys with a chase or sell chain running, per side
    claims: Mutex<HashSet<(PositionKey, OrderSide)>>,
    entries_blocked: AtomicBool,
    changed: Arc<Notify>,
}

impl OrderManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        positions: Arc<PositionManager>,
        emergency: Arc<EmergencyStop>,
        notifier: Arc<dyn Notifier>,
        config: OrderConfig,
        changed: Arc<Notify>,
    ) -> Self {
        Self {
            broker,
            positions,
            emergency,
            notifier,
            config,
            orders: RwLock::new(HashMap::new()),
            watch: Mutex::new(HashSet::new()),
            claims: Mutex::new(HashSet::new()),
            entries_blocked: AtomicBool::new(false),
            changed,
        }
    }

    pub fn positions(&self) -> &Arc<PositionManager> {
        &self.positions
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval()
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Refuse new entries until [`unblock_entries`](Self::unblock_entries)
    pub fn block_entries(&self) {
        self.entries_blocked.store(true, Ordering::SeqCst);
    }

    pub fn unblock_entries(&self) {
        self.entries_blocked.store(false, Ordering::SeqCst);
    }

    pub fn entries_blocked(&self) -> bool {
        self.entries_blocked.load(Ordering::SeqCst)
    }

    /// Entry gate, evaluated before any network call
    pub(super) async fn check_entry(&self, key: &PositionKey, quantity: u64) -> Result<(), OrderError> {
        if let Some(reason) = self.emergency.halt_reason() {
            return Err(OrderError::EmergencyHalt(reason));
        }
        if self.entries_blocked() {
            return Err(OrderError::EntryBlocked);
        }
        if self.has_pending(key).await {
            return Err(OrderError::DuplicateOrder(key.clone()));
        }
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        Ok(())
    }

    /// Whether any non-terminal order exists for the key
    pub async fn has_pending(&self, key: &PositionKey) -> bool {
        self.orders
            .read()
            .await
            .values()
            .any(|o| !o.state.is_terminal() && o.symbol == key.symbol && o.strategy == key.strategy)
    }

    /// Whether a non-terminal sell exists for the key
    pub async fn has_pending_sell(&self, key: &PositionKey) -> bool {
        self.orders.read().await.values().any(|o| {
            !o.state.is_terminal()
                && o.side == OrderSide::Sell
                && o.symbol == key.symbol
                && o.strategy == key.strategy
        })
    }

    /// Whether a sell chain currently owns the key
    pub fn sell_in_flight(&self, key: &PositionKey) -> bool {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(key.clone(), OrderSide::Sell))
    }

    /// Take exclusive ownership of one side of a key until the claim drops
    pub(super) fn claim(
        &self,
        key: &PositionKey,
        side: OrderSide,
    ) -> Result<ExecutionClaim<'_>, OrderError> {
        let slot = (key.clone(), side);
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if !claims.insert(slot.clone()) {
            return Err(OrderError::DuplicateOrder(key.clone()));
        }
        Ok(ExecutionClaim { manager: self, slot })
    }

    pub async fn get(&self, id: OrderId) -> Option<Order> {
        self.orders.read().await.get(&id).cloned()
    }

    /// Non-terminal orders, oldest first
    pub async fn active_orders(&self) -> Vec<Order> {
        let mut active: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|o| o.created_at);
        active
    }

    /// Terminal orders that may still be live at the broker
    pub async fn watched_orders(&self) -> Vec<Order> {
        let ids = self.watched_ids();
        let orders = self.orders.read().await;
        let mut watched: Vec<Order> = ids
            .iter()
            .filter_map(|id| orders.get(id))
            .filter(|o| o.state.is_terminal())
            .cloned()
            .collect();
        watched.sort_by_key(|o| o.created_at);
        watched
    }

    pub fn is_watched(&self, id: OrderId) -> bool {
        self.watch
            .lock()
            .map(|watch| watch.contains(&id))
            .unwrap_or(false)
    }

    /// Hand a persisted order back to the manager
    pub async fn adopt_order(&self, order: Order) {
        tracing::info!(order_id = %order.id, state = ?order.state, "Adopting persisted order");
        self.orders.write().await.insert(order.id, order);
        self.publish_active().await;
    }

    /// Hand back a persisted order that may still be live despite its state
    pub async fn adopt_watched(&self, order: Order) {
        let id = order.id;
        self.adopt_order(order).await;
        self.watch(id);
    }

    /// Create an order locally and submit it to the broker
    pub(super) async fn submit(
        &self,
        key: &PositionKey,
        side: OrderSide,
        kind: OrderKind,
        quantity: u64,
        limit_price: Option<Decimal>,
        parent_id: Option<OrderId>,
    ) -> Result<OrderId, OrderError> {
        let order = Order::new(
            &key.symbol,
            &key.strategy,
            side,
            kind,
            quantity,
            limit_price,
            parent_id,
        )?;
        let id = order.id;
        {
            let mut orders = self.orders.write().await;
            let sell_live = side == OrderSide::Sell
                && orders.values().any(|o| {
                    !o.state.is_terminal()
                        && o.side == OrderSide::Sell
                        && o.symbol == key.symbol
                        && o.strategy == key.strategy
                });
            if sell_live {
                return Err(OrderError::DuplicateOrder(key.clone()));
            }
            orders.insert(id, order);
        }

        let result = match (kind, limit_price) {
            (OrderKind::Limit, Some(price)) => {
                self.broker
                    .place_limit_order(&key.symbol, side, quantity, price)
                    .await
            }
            _ => {
                self.broker
                    .place_market_order(&key.symbol, side, quantity)
                    .await
            }
        };

        match result {
            Ok(ack) => {
                {
                    let mut orders = self.orders.write().await;
                    let order = orders.get_mut(&id).ok_or(OrderError::UnknownOrder(id))?;
                    order.broker_order_id = Some(ack.broker_order_id.clone());
                    order.transition(OrderState::Submitted)?;
                }
                incr(CounterMetric::OrdersSubmitted);
                tracing::info!(
                    order_id = %id,
                    broker_order_id = %ack.broker_order_id,
                    key = %key,
                    ?side,
                    ?kind,
                    quantity,
                    price = ?limit_price,
                    "Order submitted"
                );
                self.publish_active().await;
                self.changed.notify_one();
                Ok(id)
            }
            Err(BrokerError::Rejected { code, message }) => {
                let reason = format!("[{}] {}", code, message);
                self.finalize(id, OrderState::Failed, Some(reason.clone()))
                    .await;
                Err(OrderError::Rejected { id, reason })
            }
            Err(e) => {
                if e.is_timeout() {
                    tracing::warn!(order_id = %id, key = %key, "Submission timed out; broker outcome unknown until next sync");
                }
                self.finalize(id, OrderState::Failed, Some(format!("submission failed: {}", e)))
                    .await;
                Err(OrderError::Broker(e))
            }
        }
    }

    /// Record a cumulative fill for an order
    ///
    /// Idempotent: a cumulative quantity at or below what is already
    /// recorded is a no-op. Quantities above the requested size are clamped.
    /// Late fills on terminal orders are still recorded; the state label is
    /// left alone.
    pub async fn apply_fill(
        &self,
        id: OrderId,
        cumulative: u64,
        avg_price: Option<Decimal>,
    ) -> Result<Option<FillEvent>, OrderError> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(OrderError::UnknownOrder(id))?;

        let cumulative = if cumulative > order.quantity {
            tracing::warn!(
                order_id = %id,
                reported = cumulative,
                requested = order.quantity,
                "Broker reported more filled than requested, clamping"
            );
            order.quantity
        } else {
            cumulative
        };
        if cumulative <= order.filled_quantity {
            return Ok(None);
        }

        let delta = cumulative - order.filled_quantity;
        let price = delta_price(order, cumulative, avg_price);
        let prev_cost = order.avg_fill_price.unwrap_or_default() * Decimal::from(order.filled_quantity);
        let new_avg = avg_price
            .unwrap_or_else(|| (prev_cost + price * Decimal::from(delta)) / Decimal::from(cumulative));

        order.filled_quantity = cumulative;
        order.avg_fill_price = Some(new_avg);
        order.updated_at = Utc::now();

        let mut completed = false;
        if order.state.is_terminal() {
            tracing::warn!(order_id = %id, state = ?order.state, delta, "Late fill on terminal order");
        } else {
            if order.state == OrderState::Pending {
                order.transition(OrderState::Submitted)?;
            }
            if order.is_filled() {
                order.transition(OrderState::Filled)?;
                completed = true;
            } else {
                order.transition(OrderState::PartiallyFilled)?;
            }
        }

        let event = FillEvent {
            order_id: id,
            cumulative_quantity: cumulative,
            quantity: delta,
            price,
            side: order.side,
            key: order.key(),
            timestamp: Utc::now(),
        };
        let filled_summary = (order.side, order.filled_quantity, new_avg);

        self.positions.apply_fill(&event).await;
        drop(orders);

        tracing::info!(
            order_id = %id,
            key = %event.key,
            side = ?event.side,
            quantity = delta,
            cumulative,
            price = %price,
            "Fill applied"
        );

        if completed {
            incr(CounterMetric::OrdersFilled);
            let (side, quantity, avg_price) = filled_summary;
            self.notifier
                .notify(TradeEvent::OrderFilled {
                    symbol: event.key.symbol.clone(),
                    strategy: event.key.strategy.clone(),
                    side,
                    quantity,
                    avg_price,
                })
                .await;
            self.publish_active().await;
        }
        self.changed.notify_one();
        Ok(Some(event))
    }

    /// Query the broker and apply any new fill, without adopting its state
    pub(super) async fn sync_fills(
        &self,
        id: OrderId,
    ) -> Result<(BrokerOrderStatus, Option<FillEvent>), OrderError> {
        let broker_order_id = self
            .get(id)
            .await
            .ok_or(OrderError::UnknownOrder(id))?
            .broker_order_id
            .ok_or(OrderError::NotSubmitted(id))?;

        let status = self.broker.get_order_status(&broker_order_id).await?;
        let event = if status.filled_quantity > 0 {
            self.apply_fill(id, status.filled_quantity, status.avg_fill_price)
                .await?
        } else {
            None
        };
        Ok((status, event))
    }

    /// Reconcile one order against authoritative broker status
    pub async fn reconcile_order(&self, id: OrderId) -> Result<Option<FillEvent>, OrderError> {
        let (status, event) = self.sync_fills(id).await?;
        match status.state {
            BrokerOrderState::Open | BrokerOrderState::Filled => {}
            BrokerOrderState::Cancelled => {
                self.finalize(id, OrderState::Cancelled, None).await;
            }
            BrokerOrderState::Rejected => {
                self.finalize(id, OrderState::Failed, Some("rejected by broker".into()))
                    .await;
            }
        }
        if status.state != BrokerOrderState::Open {
            self.unwatch(id);
        }
        Ok(event)
    }

    /// Reconcile a broker order id announced by the real-time stream
    pub async fn reconcile_broker_order(
        &self,
        broker_order_id: &str,
    ) -> Result<Option<FillEvent>, OrderError> {
        let id = self
            .orders
            .read()
            .await
            .values()
            .find(|o| o.broker_order_id.as_deref() == Some(broker_order_id))
            .map(|o| o.id);
        match id {
            Some(id) => self.reconcile_order(id).await,
            None => {
                tracing::debug!(broker_order_id, "Notice for an order this session does not track");
                Ok(None)
            }
        }
    }

    /// Reconcile every non-terminal or watched order against the broker
    ///
    /// Errors are logged per order; one failing query does not stop the rest.
    pub async fn check_fills(&self) -> Vec<FillEvent> {
        let mut ids: Vec<OrderId> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| !o.state.is_terminal() && o.broker_order_id.is_some())
            .map(|o| o.id)
            .collect();
        let extra: Vec<OrderId> = self
            .watched_ids()
            .into_iter()
            .filter(|id| !ids.contains(id))
            .collect();
        ids.extend(extra);

        let mut events = Vec::new();
        for id in ids {
            match self.reconcile_order(id).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => tracing::warn!(order_id = %id, error = %e, "Fill check failed"),
            }
        }
        events
    }

    /// Broker sync that leaves symbols with orders in flight alone
    pub async fn sync_positions(&self) -> Result<SyncReport, BrokerError> {
        let watched = self.watched_ids();
        let mut busy: HashSet<String> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| !o.state.is_terminal() || watched.contains(&o.id))
            .map(|o| o.symbol.clone())
            .collect();
        busy.extend(
            self.claims
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(key, _)| key.symbol.clone()),
        );
        self.positions
            .sync_with_broker_except(self.broker.as_ref(), &busy)
            .await
    }

    /// Forget terminal orders no chain or watch still needs
    ///
    /// Their fill keys go too; a removed order can no longer be filled.
    pub async fn prune_terminal(&self) -> usize {
        let watched = self.watched_ids();
        let claimed: HashSet<(PositionKey, OrderSide)> = self
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut orders = self.orders.write().await;
        let removed: HashSet<OrderId> = orders
            .values()
            .filter(|o| {
                o.state.is_terminal()
                    && !watched.contains(&o.id)
                    && !claimed.contains(&(o.key(), o.side))
            })
            .map(|o| o.id)
            .collect();
        orders.retain(|id, _| !removed.contains(id));
        let fills = self.positions.forget_fills(&removed).await;
        drop(orders);

        if !removed.is_empty() {
            tracing::info!(orders = removed.len(), fills, "Pruned finished orders");
        }
        removed.len()
    }

    /// Cancel every non-terminal order, best effort
    pub async fn cancel_all_pending(&self) -> CancelReport {
        let active = self.active_orders().await;
        let mut report = CancelReport {
            requested: active.len(),
            ..Default::default()
        };

        for order in active {
            if order.broker_order_id.is_none() {
                self.finalize(order.id, OrderState::Cancelled, None).await;
                report.cancelled += 1;
                continue;
            }
            match self.cancel_and_settle(order.id).await {
                Ok(false) => {
                    self.finalize(order.id, OrderState::Cancelled, None).await;
                    report.cancelled += 1;
                }
                Ok(true) => {
                    tracing::error!(order_id = %order.id, "Order still live after cancel attempt");
                    self.watch(order.id);
                    report.failed.push((order.id, "still live after cancel".into()));
                }
                Err(e) => {
                    tracing::error!(order_id = %order.id, error = %e, "Cancel failed");
                    report.failed.push((order.id, e.to_string()));
                }
            }
        }

        tracing::info!(
            requested = report.requested,
            cancelled = report.cancelled,
            failed = report.failed.len(),
            "Cancelled pending orders"
        );
        report
    }

    /// Cancel an order and re-query it to catch racing fills
    ///
    /// Returns whether the order may still be live at the broker. A failed
    /// cancel is followed by a status query; if that fails too the order is
    /// treated as live.
    pub(super) async fn cancel_and_settle(&self, id: OrderId) -> Result<bool, OrderError> {
        let broker_order_id = self
            .get(id)
            .await
            .ok_or(OrderError::UnknownOrder(id))?
            .broker_order_id
            .ok_or(OrderError::NotSubmitted(id))?;

        let cancel = self.broker.cancel_order(&broker_order_id).await;
        if let Err(e) = &cancel {
            tracing::warn!(order_id = %id, error = %e, "Cancel request failed, re-querying status");
        }

        match self.sync_fills(id).await {
            Ok((status, _)) => Ok(status.state == BrokerOrderState::Open),
            Err(e) => {
                tracing::warn!(order_id = %id, error = %e, "Status re-query after cancel failed");
                Ok(cancel.is_err())
            }
        }
    }

    /// Poll the broker until the order leaves the open state or time runs out
    pub(super) async fn wait_for_fill(&self, id: OrderId, timeout: Duration) -> Result<Order, OrderError> {
        let deadline = Instant::now() + timeout;
        let poll = self.config.poll_interval();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(poll.min(deadline - now)).await;
            match self.sync_fills(id).await {
                Ok((status, _)) if status.state != BrokerOrderState::Open => break,
                Ok(_) => {}
                Err(e) => tracing::warn!(order_id = %id, error = %e, "Status poll failed"),
            }
        }

        self.get(id).await.ok_or(OrderError::UnknownOrder(id))
    }

    /// Move an order to a terminal state unless it already is terminal
    ///
    /// A fully filled order always ends FILLED regardless of `state`.
    pub async fn finalize(&self, id: OrderId, state: OrderState, reason: Option<String>) {
        let failed = {
            let mut orders = self.orders.write().await;
            let Some(order) = orders.get_mut(&id) else {
                return;
            };
            if order.state.is_terminal() {
                return;
            }
            let target = if order.is_filled() { OrderState::Filled } else { state };
            if let Err(e) = order.transition(target) {
                tracing::error!(order_id = %id, error = %e, "Cannot finalize order");
                return;
            }
            if reason.is_some() {
                order.reject_reason = reason.clone();
            }
            (target == OrderState::Failed).then(|| (order.key(), order.side))
        };

        if let Some((key, side)) = failed {
            incr(CounterMetric::OrdersFailed);
            let reason = reason.unwrap_or_else(|| "unknown".to_string());
            tracing::warn!(order_id = %id, key = %key, reason = %reason, "Order failed");
            self.notifier
                .notify(TradeEvent::OrderFailed {
                    symbol: key.symbol,
                    strategy: key.strategy,
                    side,
                    reason,
                })
                .await;
        }
        self.publish_active().await;
        self.changed.notify_one();
    }

    /// Summarize an order chain
    pub(super) async fn outcome(
        &self,
        status: ExecutionStatus,
        chain: Vec<OrderId>,
        requested_quantity: u64,
        detail: Option<String>,
    ) -> ExecutionOutcome {
        let (filled_quantity, avg_price) = self.chain_fills(&chain).await;
        ExecutionOutcome {
            status,
            order_ids: chain,
            requested_quantity,
            filled_quantity,
            avg_price,
            detail,
        }
    }

    /// Total filled quantity and average price over a chain
    pub(super) async fn chain_fills(&self, chain: &[OrderId]) -> (u64, Option<Decimal>) {
        let orders = self.orders.read().await;
        let mut filled = 0u64;
        let mut cost = Decimal::ZERO;
        for id in chain {
            if let Some(order) = orders.get(id) {
                filled += order.filled_quantity;
                cost += order.avg_fill_price.unwrap_or_default() * Decimal::from(order.filled_quantity);
            }
        }
        let avg = (filled > 0).then(|| cost / Decimal::from(filled));
        (filled, avg)
    }

    pub(super) fn watch(&self, id: OrderId) {
        if let Ok(mut watch) = self.watch.lock() {
            watch.insert(id);
        }
    }

    pub(crate) fn unwatch(&self, id: OrderId) {
        if let Ok(mut watch) = self.watch.lock() {
            watch.remove(&id);
        }
    }

    fn watched_ids(&self) -> HashSet<OrderId> {
        self.watch.lock().map(|w| w.clone()).unwrap_or_default()
    }

    async fn publish_active(&self) {
        let active = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| !o.state.is_terminal())
            .count();
        set_gauge(GaugeMetric::ActiveOrders, active as f64);
    }
}

/// Price of the quantity added by a cumulative update
fn delta_price(order: &Order, cumulative: u64, avg_price: Option<Decimal>) -> Decimal {
    let delta = Decimal::from(cumulative - order.filled_quantity);
    let prev_cost = order.avg_fill_price.unwrap_or_default() * Decimal::from(order.filled_quantity);
    match avg_price {
        Some(avg) => {
            let price = (avg * Decimal::from(cumulative) - prev_cost) / delta;
            if price > Decimal::ZERO {
                price
            } else {
                avg
            }
        }
        None => order
            .limit_price
            .or(order.avg_fill_price)
            .unwrap_or_default(),
    }
}
