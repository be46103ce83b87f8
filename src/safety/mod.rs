//! Safety controls: emergency stop, health probing, end-of-day close-out

mod emergency;
mod health;
mod liquidation;

pub use emergency::{EmergencyStop, HaltRecord, HaltSource, StopFileWatcher};
pub use health::{
    ApiCheck, CheckResult, HealthCheck, HealthChecker, HealthStatus, LoopHeartbeat,
    SchedulerCheck, StorageCheck, SystemHealth,
};
pub use liquidation::{next_run, DailyLiquidationManager, LiquidationFailure, LiquidationResult};
