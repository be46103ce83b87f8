//! Crash recovery: session persistence and startup reconciliation

mod checkpoint;
mod manager;
mod state;
mod store;

pub use checkpoint::SessionCheckpointer;
pub use manager::{RecoveryManager, RecoveryReport};
pub use state::{CrashEntry, GapKind, RecoveryGap, SessionState, SessionStatus};
pub use store::SessionStore;

use crate::broker::BrokerError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Session state at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("Broker unreachable during recovery: {0}")]
    BrokerUnavailable(BrokerError),
    #[error("State I/O error: {0}")]
    Io(#[from] std::io::Error),
}
