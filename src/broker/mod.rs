//! Broker adapter module
//!
//! The single boundary to the brokerage. Every call is rate limited and
//! retried with bounded backoff by the adapter itself.

mod error;
mod kis;
mod rate_limit;
mod retry;
mod simulated;
mod stats;
mod types;

pub use error::BrokerError;
pub(crate) use kis::kst;
pub use kis::KisClient;
pub use rate_limit::RateLimiter;
pub use retry::{is_retryable_status, Backoff, RetryPolicy};
pub use simulated::{PlacedOrder, SimulatedBroker};
pub use stats::{ApiStats, ApiStatsSnapshot};
pub use types::{
    Balance, BrokerOrderState, BrokerOrderStatus, Candle, Holding, OrderAck, OrderKind,
    OrderSide,
};

use async_trait::async_trait;
use rust_decimal::Decimal;

/// Trait for brokerage implementations
#[async_trait]
pub trait Broker: Send + Sync {
    /// Current traded price
    async fn get_price(&self, symbol: &str) -> Result<Decimal, BrokerError>;
    /// Holdings and cash
    async fn get_balance(&self) -> Result<Balance, BrokerError>;
    /// Shares purchasable at the given price with available cash
    async fn get_buyable_quantity(&self, symbol: &str, price: Decimal)
        -> Result<u64, BrokerError>;
    /// Submit a market order
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
    ) -> Result<OrderAck, BrokerError>;
    /// Submit a limit order
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        price: Decimal,
    ) -> Result<OrderAck, BrokerError>;
    /// Cancel the unfilled remainder of an order
    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;
    /// Authoritative status of an order
    async fn get_order_status(&self, broker_order_id: &str)
        -> Result<BrokerOrderStatus, BrokerError>;
    /// Most recent intraday candles, oldest first
    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, BrokerError>;
    /// Call statistics for health probing
    fn stats(&self) -> std::sync::Arc<ApiStats>;
}
