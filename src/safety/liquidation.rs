//! Daily liquidation
//!
//! Closes every position with market orders once a day so no leveraged
//! exposure is carried overnight. Entries stay blocked for the duration.

use crate::config::LiquidationConfig;
use crate::notify::{Notifier, TradeEvent};
use crate::order::{CancelReport, OrderId, OrderManager};
use crate::position::{PositionKey, SyncReport};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveTime, Utc, Weekday};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// A position liquidation could not close
#[derive(Debug, Clone, Serialize)]
pub struct LiquidationFailure {
    pub key: PositionKey,
    /// Shares still held as far as we know
    pub quantity: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiquidationResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancel: CancelReport,
    pub closed: Vec<PositionKey>,
    pub failures: Vec<LiquidationFailure>,
    pub sync: Option<SyncReport>,
}

impl LiquidationResult {
    /// Nothing needs manual attention
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.cancel.failed.is_empty()
    }
}

pub struct DailyLiquidationManager {
    orders: Arc<OrderManager>,
    notifier: Arc<dyn Notifier>,
    at: NaiveTime,
    offset: FixedOffset,
    retries: u32,
    retry_delay: Duration,
    settle_timeout: Duration,
}

impl DailyLiquidationManager {
    pub fn new(
        orders: Arc<OrderManager>,
        notifier: Arc<dyn Notifier>,
        config: &LiquidationConfig,
    ) -> anyhow::Result<Self> {
        let at = NaiveTime::parse_from_str(&config.time, "%H:%M")?;
        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600)
            .ok_or_else(|| anyhow::anyhow!("invalid utc offset: {}", config.utc_offset_hours))?;
        Ok(Self {
            orders,
            notifier,
            at,
            offset,
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            settle_timeout: Duration::from_secs(config.settle_timeout_secs),
        })
    }

    /// Run the close-out now
    pub async fn execute(&self) -> LiquidationResult {
        let started_at = Utc::now();
        tracing::warn!("Daily liquidation starting");
        self.orders.block_entries();

        let cancel = self.orders.cancel_all_pending().await;

        let positions = self.orders.positions().snapshot().await;
        let mut placed: Vec<(PositionKey, u64, OrderId)> = Vec::new();
        let mut failures = Vec::new();
        let mut closed = Vec::new();
        for position in positions {
            match self.close(&position.key).await {
                Ok(Some((id, quantity))) => placed.push((position.key, quantity, id)),
                Ok(None) => closed.push(position.key),
                Err(reason) => failures.push(LiquidationFailure {
                    key: position.key,
                    quantity: position.quantity,
                    reason,
                }),
            }
        }

        self.settle(&placed).await;

        for (key, quantity, id) in placed {
            match self.orders.get(id).await {
                Some(order) if order.is_filled() => closed.push(key),
                Some(order) => failures.push(LiquidationFailure {
                    key,
                    quantity: order.remaining(),
                    reason: format!(
                        "close order {:?} with {} of {} filled",
                        order.state, order.filled_quantity, order.quantity
                    ),
                }),
                None => failures.push(LiquidationFailure {
                    key,
                    quantity,
                    reason: "close order record missing".into(),
                }),
            }
        }

        let sync = match self.orders.sync_positions().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Post-liquidation sync failed");
                None
            }
        };

        self.orders.prune_terminal().await;
        self.orders.unblock_entries();

        let result = LiquidationResult {
            started_at,
            finished_at: Utc::now(),
            cancel,
            closed,
            failures,
            sync,
        };
        for failure in &result.failures {
            tracing::error!(
                key = %failure.key,
                quantity = failure.quantity,
                reason = %failure.reason,
                "Position needs manual close"
            );
        }
        tracing::warn!(
            closed = result.closed.len(),
            failed = result.failures.len(),
            cancel_failures = result.cancel.failed.len(),
            "Daily liquidation finished"
        );
        self.notifier
            .notify(TradeEvent::LiquidationSummary {
                closed: result.closed.len(),
                failed: result.failures.len() + result.cancel.failed.len(),
            })
            .await;
        result
    }

    /// Submit a market close for whatever the key still holds
    ///
    /// Waits out a sell chain already working the key, then closes the
    /// remainder. `None` means nothing was left to sell.
    async fn close(&self, key: &PositionKey) -> Result<Option<(OrderId, u64)>, String> {
        let mut last = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                sleep(self.retry_delay).await;
            }
            if !self.wait_for_sell_chain(key).await {
                tracing::warn!(key = %key, attempt, "Sell chain still working the position");
                last = "sell chain still in flight".into();
                continue;
            }
            let quantity = match self.orders.positions().get(key).await {
                Some(position) if position.quantity > 0 => position.quantity,
                _ => {
                    tracing::info!(key = %key, "Position already closed");
                    return Ok(None);
                }
            };
            match self
                .orders
                .place_market_sell(&key.symbol, &key.strategy, quantity)
                .await
            {
                Ok(id) => return Ok(Some((id, quantity))),
                Err(e) => {
                    tracing::warn!(key = %key, attempt, error = %e, "Liquidation sell failed");
                    last = e.to_string();
                }
            }
        }
        Err(last)
    }

    /// Wait until no sell chain owns the key; false on timeout
    async fn wait_for_sell_chain(&self, key: &PositionKey) -> bool {
        let deadline = Instant::now() + self.settle_timeout;
        let poll = self.orders.poll_interval();
        while self.orders.sell_in_flight(key) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(poll.min(deadline - now)).await;
        }
        true
    }

    /// Poll fills until every close order is terminal or time runs out
    async fn settle(&self, placed: &[(PositionKey, u64, OrderId)]) {
        if placed.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.settle_timeout;
        let poll = self.orders.poll_interval();
        loop {
            self.orders.check_fills().await;
            let mut open = 0;
            for (_, _, id) in placed {
                if let Some(order) = self.orders.get(*id).await {
                    if !order.state.is_terminal() {
                        open += 1;
                    }
                }
            }
            if open == 0 {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(open, "Liquidation settle timed out");
                return;
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    /// Next scheduled run strictly after `now`
    pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_run(now, self.at, self.offset)
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = self.next_run(now);
                let wait = (next - now).to_std().unwrap_or_default();
                tracing::info!(next = %next.with_timezone(&self.offset), "Liquidation scheduled");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(wait) => {
                        self.execute().await;
                    }
                }
            }
            tracing::debug!("Liquidation scheduler stopped");
        })
    }
}

/// Next weekday occurrence of local `at` strictly after `now`
pub fn next_run(now: DateTime<Utc>, at: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    let mut date = local.date_naive();
    loop {
        let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        if !weekend {
            if let Some(candidate) = date.and_time(at).and_local_timezone(offset).single() {
                if candidate > local {
                    return candidate.with_timezone(&Utc);
                }
            }
        }
        date += ChronoDuration::days(1);
    }
}
