//! Reconnecting WebSocket client used by the real-time feed

mod client;
mod types;

pub use client::WsClient;
pub use types::{WsConfig, WsError, WsMessage};
