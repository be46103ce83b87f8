//! Price feed module
//!
//! Real-time ticks and order notices, from the KIS WebSocket or from REST
//! polling when streaming is off.

mod kis;
mod polling;
mod types;

pub use kis::KisFeed;
pub use polling::PollingFeed;
pub use types::{PriceTick, StreamEvent};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Trait for price feed implementations
#[async_trait]
pub trait TickFeed: Send + Sync {
    /// Subscribe to events for the given symbols until `shutdown`
    async fn subscribe(
        &self,
        symbols: &[String],
        shutdown: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<StreamEvent>>;
}
