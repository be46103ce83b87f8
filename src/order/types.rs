//! Order records and fill events

use crate::broker::{OrderKind, OrderSide};
use crate::position::PositionKey;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Local order identifier
pub type OrderId = Uuid;

/// Order lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Created locally, not yet acknowledged
    Pending,
    /// Acknowledged by the broker
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    /// Cancelled and replaced by a re-priced order
    Chased,
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Chased | OrderState::Failed
        )
    }

    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, PartiallyFilled)
                | (Submitted, Filled)
                | (Submitted, Chased)
                | (Submitted, Failed)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Chased)
                | (PartiallyFilled, Failed)
        )
    }
}

/// A single broker order tracked by the order manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: u64,
    pub limit_price: Option<Decimal>,
    pub filled_quantity: u64,
    pub avg_fill_price: Option<Decimal>,
    pub state: OrderState,
    pub strategy: String,
    /// Previous order in a chase or fallback chain
    pub parent_id: Option<OrderId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reject_reason: Option<String>,
}

impl Order {
    /// Create a PENDING order
    pub fn new(
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        side: OrderSide,
        kind: OrderKind,
        quantity: u64,
        limit_price: Option<Decimal>,
        parent_id: Option<OrderId>,
    ) -> Result<Self, OrderError> {
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            broker_order_id: None,
            symbol: symbol.into(),
            side,
            kind,
            quantity,
            limit_price,
            filled_quantity: 0,
            avg_fill_price: None,
            state: OrderState::Pending,
            strategy: strategy.into(),
            parent_id,
            created_at: now,
            updated_at: now,
            reject_reason: None,
        })
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(&self.symbol, &self.strategy)
    }

    pub fn remaining(&self) -> u64 {
        self.quantity - self.filled_quantity
    }

    pub fn is_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: OrderState) -> Result<(), OrderError> {
        if self.state == next && !self.state.is_terminal() {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A newly observed fill, the unit of cross-component update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: OrderId,
    /// Cumulative filled quantity after this fill
    pub cumulative_quantity: u64,
    /// Quantity added by this fill
    pub quantity: u64,
    /// Price of the added quantity
    pub price: Decimal,
    pub side: OrderSide,
    pub key: PositionKey,
    pub timestamp: DateTime<Utc>,
}

impl FillEvent {
    /// Idempotency key: one order never reports the same cumulative twice
    pub fn fill_id(&self) -> (OrderId, u64) {
        (self.order_id, self.cumulative_quantity)
    }
}

/// Final result of a chase or fallback execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Filled,
    /// Chase gave up; any partial fills are kept
    Abandoned,
    Failed,
}

/// Summary of an order chain
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Every order in the chain, oldest first
    pub order_ids: Vec<OrderId>,
    pub requested_quantity: u64,
    pub filled_quantity: u64,
    pub avg_price: Option<Decimal>,
    pub detail: Option<String>,
}

impl ExecutionOutcome {
    pub fn is_filled(&self) -> bool {
        self.status == ExecutionStatus::Filled
    }
}

/// Order manager errors
#[derive(Debug, Error)]
pub enum OrderError {
    /// Emergency stop is set; new entries are refused
    #[error("Emergency stop active: {0}")]
    EmergencyHalt(String),
    /// Entries are blocked, e.g. during liquidation
    #[error("New entries are blocked")]
    EntryBlocked,
    /// A non-terminal order already exists for this key
    #[error("Order already pending for {0}")]
    DuplicateOrder(PositionKey),
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u64),
    /// Broker refused the order; it is marked FAILED
    #[error("Order {id} rejected: {reason}")]
    Rejected { id: OrderId, reason: String },
    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),
    /// Order has no broker id, so the broker cannot be asked about it
    #[error("Order {0} was never acknowledged by the broker")]
    NotSubmitted(OrderId),
    #[error("Invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: OrderId,
        from: OrderState,
        to: OrderState,
    },
    #[error("Broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),
}
