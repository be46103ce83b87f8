//! Retry policy with exponential backoff for broker calls
//!
//! | Retryable | Non-Retryable |
//! |-----------|---------------|
//! | Network errors and timeouts | Order rejected |
//! | HTTP 408/500/502/503/504 | HTTP 400/404/422 |
//! | Rate limited (HTTP 429, EGW00201) | Auth errors (re-auth handled separately) |

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Retry policy for broker calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Jitter factor (0.2 = ±20%)
    pub jitter_factor: f64,
    /// Minimum wait after a rate-limit response
    pub rate_limit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting, for tests and simulations
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            rate_limit_backoff: Duration::ZERO,
        }
    }
}

/// Calculator for exponential backoff with jitter
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts,
            initial_ms: policy.initial_backoff.as_millis() as u64,
            max_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.backoff_multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }

    /// Delay before the next retry, `None` once the attempt cap is reached
    ///
    /// The first attempt is not a retry, so at most `max_attempts - 1`
    /// delays are handed out.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt + 1 >= self.max_attempts {
            return None;
        }

        let base = self.initial_ms as f64 * self.multiplier.powi(self.attempt as i32);
        let base = (base as u64).min(self.max_ms);
        self.attempt += 1;

        Some(Duration::from_millis(self.apply_jitter(base).min(self.max_ms)))
    }

    fn apply_jitter(&self, backoff_ms: u64) -> u64 {
        if backoff_ms == 0 || self.jitter_factor <= 0.0 {
            return backoff_ms;
        }
        let range = backoff_ms as f64 * self.jitter_factor;
        let min = (backoff_ms as f64 - range).max(0.0);
        let max = backoff_ms as f64 + range;
        rand::rng().random_range(min..=max) as u64
    }

    /// Retries handed out so far
    pub fn retries(&self) -> u32 {
        self.attempt
    }
}

/// Whether an HTTP status should be retried
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}
