//! Position module
//!
//! Local cache of open positions, reconciled against the broker

mod manager;
mod types;

pub use manager::{PositionManager, UNMANAGED_STRATEGY};
pub use types::{AuditEvent, MismatchKind, Position, PositionKey, SyncReport};
