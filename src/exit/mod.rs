//! Position exits: threshold evaluation and the tick-driven monitor

mod monitor;
mod thresholds;

pub use monitor::{ExitMonitor, ExitTrigger};
pub use thresholds::{ExitReason, ExitThresholds};
