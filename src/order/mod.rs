//! Order lifecycle: state machine, chase entries, fallback exits

mod chase;
mod fallback;
mod manager;
pub mod pricing;
mod types;

pub use chase::BuyRequest;
pub use fallback::SellRequest;
pub use manager::{CancelReport, OrderManager};
pub use pricing::{chase_price, round_to_tick, tick_size};
pub use types::{
    ExecutionOutcome, ExecutionStatus, FillEvent, Order, OrderError, OrderId, OrderState,
};
