//! Startup reconciliation of persisted state against the broker

use super::{GapKind, RecoveryError, RecoveryGap, SessionStatus, SessionStore};
use crate::broker::BrokerError;
use crate::notify::{Notifier, TradeEvent};
use crate::order::{OrderError, OrderId, OrderManager, OrderState};
use crate::position::SyncReport;
use crate::safety::EmergencyStop;
use crate::telemetry::{incr, CounterMetric};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// What recovery found and did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub previous_session: Option<Uuid>,
    pub crashed: bool,
    pub halt_restored: bool,
    /// Persisted orders resolved to a terminal state
    pub resolved: Vec<(OrderId, OrderState)>,
    /// Persisted orders the broker confirms still open
    pub still_open: Vec<OrderId>,
    /// Carried-forward and newly found gaps
    pub gaps: Vec<RecoveryGap>,
    pub sync: Option<SyncReport>,
}

pub struct RecoveryManager {
    store: SessionStore,
    orders: Arc<OrderManager>,
    emergency: Arc<EmergencyStop>,
    notifier: Arc<dyn Notifier>,
}

impl RecoveryManager {
    pub fn new(
        store: SessionStore,
        orders: Arc<OrderManager>,
        emergency: Arc<EmergencyStop>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            orders,
            emergency,
            notifier,
        }
    }

    /// Load the last session and reconcile it against the broker
    ///
    /// Fails on corrupt state or when the broker cannot be reached; both
    /// leave the process without a consistent starting point.
    pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
        let mut report = RecoveryReport::default();
        let positions = self.orders.positions();

        let Some(state) = self.store.load()? else {
            tracing::info!("No previous session state, starting fresh");
            report.sync = Some(self.sync_positions().await?);
            return Ok(report);
        };

        report.previous_session = Some(state.session_id);
        if state.status == SessionStatus::Running {
            report.crashed = true;
            tracing::warn!(
                session_id = %state.session_id,
                pid = state.pid,
                last_heartbeat = %state.last_heartbeat,
                active_orders = state.active_orders.len(),
                watched_orders = state.watched_orders.len(),
                positions = state.positions.len(),
                "Previous session crashed"
            );
            if let Err(e) = self.store.append_crash(&state) {
                tracing::error!(error = %e, "Failed to append crash log");
            }
        }

        if let Some(halt) = state.halt.clone() {
            self.emergency.restore(halt);
            report.halt_restored = true;
        }
        report.gaps = state.gaps.clone();

        positions.restore(state.positions.clone()).await;

        let mut new_gaps = Vec::new();
        for order in state.active_orders.iter().filter(|o| !o.state.is_terminal()) {
            let id = order.id;
            let symbol = order.symbol.clone();
            let has_broker_id = order.broker_order_id.is_some();
            self.orders.adopt_order(order.clone()).await;

            if !has_broker_id {
                self.orders
                    .finalize(id, OrderState::Failed, Some("no broker id after restart".into()))
                    .await;
                new_gaps.push(RecoveryGap::new(
                    GapKind::OrderWithoutBrokerId,
                    symbol,
                    Some(id),
                    "order was never acknowledged; check the broker manually",
                ));
                continue;
            }

            match self.orders.reconcile_order(id).await {
                Ok(_) => {
                    let current = self.orders.get(id).await.map(|o| o.state);
                    match current {
                        Some(state) if state.is_terminal() => report.resolved.push((id, state)),
                        _ => report.still_open.push(id),
                    }
                }
                Err(OrderError::Broker(BrokerError::NotFound(detail))) => {
                    self.orders
                        .finalize(id, OrderState::Failed, Some("not found at broker".into()))
                        .await;
                    new_gaps.push(RecoveryGap::new(GapKind::OrderNotFound, symbol, Some(id), detail));
                }
                Err(OrderError::Broker(e)) => return Err(RecoveryError::BrokerUnavailable(e)),
                Err(e) => {
                    tracing::error!(order_id = %id, error = %e, "Unexpected error reconciling order");
                    new_gaps.push(RecoveryGap::new(GapKind::OrderNotFound, symbol, Some(id), e.to_string()));
                }
            }
        }

        // Terminal locally, possibly live at the broker: keep following them
        for order in &state.watched_orders {
            let id = order.id;
            let symbol = order.symbol.clone();
            if order.broker_order_id.is_none() {
                continue;
            }
            self.orders.adopt_watched(order.clone()).await;

            match self.orders.reconcile_order(id).await {
                Ok(_) if self.orders.is_watched(id) => report.still_open.push(id),
                Ok(_) => {
                    if let Some(current) = self.orders.get(id).await {
                        report.resolved.push((id, current.state));
                    }
                }
                Err(OrderError::Broker(BrokerError::NotFound(detail))) => {
                    self.orders.unwatch(id);
                    new_gaps.push(RecoveryGap::new(GapKind::OrderNotFound, symbol, Some(id), detail));
                }
                Err(OrderError::Broker(e)) => return Err(RecoveryError::BrokerUnavailable(e)),
                Err(e) => {
                    tracing::error!(order_id = %id, error = %e, "Unexpected error reconciling watched order");
                    new_gaps.push(RecoveryGap::new(GapKind::OrderNotFound, symbol, Some(id), e.to_string()));
                }
            }
        }

        let sync = self.sync_positions().await?;
        for position in &state.positions {
            if sync.missing_at_broker().any(|s| s == position.key.symbol) {
                new_gaps.push(RecoveryGap::new(
                    GapKind::PositionMissing,
                    &position.key.symbol,
                    None,
                    format!(
                        "{} x{} for {} not held at broker",
                        position.key.symbol, position.quantity, position.key.strategy
                    ),
                ));
            }
        }
        report.sync = Some(sync);

        for gap in &new_gaps {
            tracing::warn!(gap = %gap, "Recovery gap");
            incr(CounterMetric::RecoveryGaps);
            self.notifier
                .notify(TradeEvent::RecoveryGap {
                    detail: gap.to_string(),
                })
                .await;
        }
        report.gaps.extend(new_gaps);

        tracing::info!(
            crashed = report.crashed,
            resolved = report.resolved.len(),
            still_open = report.still_open.len(),
            gaps = report.gaps.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    async fn sync_positions(&self) -> Result<SyncReport, RecoveryError> {
        self.orders
            .positions()
            .sync_with_broker(self.orders.broker().as_ref())
            .await
            .map_err(RecoveryError::BrokerUnavailable)
    }
}
