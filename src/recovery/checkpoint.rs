//! Background session checkpointing

use super::{RecoveryGap, SessionState, SessionStatus, SessionStore};
use crate::order::OrderManager;
use crate::safety::EmergencyStop;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Persists a fresh snapshot on every change and on a heartbeat
pub struct SessionCheckpointer {
    store: SessionStore,
    orders: Arc<OrderManager>,
    emergency: Arc<EmergencyStop>,
    changed: Arc<Notify>,
    heartbeat: Duration,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    gaps: Vec<RecoveryGap>,
}

impl SessionCheckpointer {
    pub fn new(
        store: SessionStore,
        orders: Arc<OrderManager>,
        emergency: Arc<EmergencyStop>,
        changed: Arc<Notify>,
        heartbeat: Duration,
        gaps: Vec<RecoveryGap>,
    ) -> Self {
        Self {
            store,
            orders,
            emergency,
            changed,
            heartbeat,
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            gaps,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn snapshot(&self, status: SessionStatus) -> SessionState {
        SessionState {
            session_id: self.session_id,
            pid: std::process::id(),
            status,
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
            active_orders: self.orders.active_orders().await,
            watched_orders: self.orders.watched_orders().await,
            positions: self.orders.positions().snapshot().await,
            halt: self.emergency.halt_record(),
            gaps: self.gaps.clone(),
        }
    }

    /// Write a snapshot; failures are logged
    pub async fn save(&self, status: SessionStatus) -> bool {
        let state = self.snapshot(status).await;
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.save(&state)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to persist session state");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Checkpoint task panicked");
                false
            }
        }
    }

    /// Final snapshot marking a clean shutdown
    pub async fn finish(&self) {
        if self.save(SessionStatus::Stopped).await {
            tracing::info!(session_id = %self.session_id, "Session state saved as stopped");
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut halts = self.emergency.subscribe();
            let mut heartbeat = tokio::time::interval(self.heartbeat);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(session_id = %self.session_id, "Checkpointer started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.changed.notified() => {}
                    _ = heartbeat.tick() => {}
                    changed = halts.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                self.save(SessionStatus::Running).await;
            }
            tracing::debug!("Checkpointer stopped");
        })
    }
}
