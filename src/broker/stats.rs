//! Shared broker call statistics, read by the API health check

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Counters updated after every broker call
#[derive(Debug, Default)]
pub struct ApiStats {
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_timeouts: AtomicU32,
    last_success_ms: AtomicI64,
}

/// Point-in-time copy of [`ApiStats`]
#[derive(Debug, Clone, Copy)]
pub struct ApiStatsSnapshot {
    pub total_calls: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub consecutive_timeouts: u32,
    pub last_success: Option<DateTime<Utc>>,
}

impl ApiStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
        self.last_success_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_failure(&self, timeout: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_timeouts.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ApiStatsSnapshot {
        let last = self.last_success_ms.load(Ordering::Relaxed);
        ApiStatsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            consecutive_timeouts: self.consecutive_timeouts.load(Ordering::Relaxed),
            last_success: (last > 0)
                .then(|| Utc.timestamp_millis_opt(last).single())
                .flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_counts_reset_on_success() {
        let stats = ApiStats::new();
        stats.record_failure(true);
        stats.record_failure(true);
        assert_eq!(stats.snapshot().consecutive_timeouts, 2);

        stats.record_success();
        let snap = stats.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.consecutive_timeouts, 0);
        assert_eq!(snap.total_calls, 3);
        assert_eq!(snap.total_failures, 2);
        assert!(snap.last_success.is_some());
    }

    #[test]
    fn test_non_timeout_failure_breaks_timeout_streak() {
        let stats = ApiStats::new();
        stats.record_failure(true);
        stats.record_failure(false);
        let snap = stats.snapshot();
        assert_eq!(snap.consecutive_timeouts, 0);
        assert_eq!(snap.consecutive_failures, 2);
        assert!(snap.last_success.is_none());
    }
}
