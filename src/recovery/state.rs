//! Persisted session state

use crate::order::{Order, OrderId};
use crate::position::Position;
use crate::safety::HaltRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Process is live; finding this on startup means it crashed
    Running,
    Stopped,
}

/// Snapshot written on every change and heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Uuid,
    pub pid: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Non-terminal orders
    pub active_orders: Vec<Order>,
    /// Terminal orders that may still be live at the broker after a failed cancel
    #[serde(default)]
    pub watched_orders: Vec<Order>,
    pub positions: Vec<Position>,
    #[serde(default)]
    pub halt: Option<HaltRecord>,
    /// Unresolved reconciliation gaps, carried until an operator clears them
    #[serde(default)]
    pub gaps: Vec<RecoveryGap>,
}

impl SessionState {
    pub fn new(session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            pid: std::process::id(),
            status: SessionStatus::Running,
            started_at: now,
            last_heartbeat: now,
            active_orders: vec![],
            watched_orders: vec![],
            positions: vec![],
            halt: None,
            gaps: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// Order was persisted before the broker acknowledged it
    OrderWithoutBrokerId,
    /// Broker has no record of the order number
    OrderNotFound,
    /// Persisted position is absent from broker holdings
    PositionMissing,
}

/// A persisted record with no broker counterpart, flagged for review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryGap {
    pub kind: GapKind,
    pub symbol: String,
    pub order_id: Option<OrderId>,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

impl RecoveryGap {
    pub fn new(kind: GapKind, symbol: impl Into<String>, order_id: Option<OrderId>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            order_id,
            detail: detail.into(),
            detected_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for RecoveryGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.order_id {
            Some(id) => write!(f, "{:?} {} order {}: {}", self.kind, self.symbol, id, self.detail),
            None => write!(f, "{:?} {}: {}", self.kind, self.symbol, self.detail),
        }
    }
}

/// Entry in the crash log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashEntry {
    pub detected_at: DateTime<Utc>,
    pub session: SessionState,
}
