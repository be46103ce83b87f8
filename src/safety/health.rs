//! Health checking
//!
//! Named checks run on a fixed interval. A check listed in `halt_on` that
//! reports unhealthy `failure_threshold` times in a row raises the
//! emergency stop.

use super::{EmergencyStop, HaltSource};
use crate::broker::ApiStats;
use crate::config::HealthConfig;
use crate::recovery::SessionStore;
use crate::telemetry::{set_gauge, GaugeMetric};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn gauge(self) -> f64 {
        match self {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Degraded => 1.0,
            HealthStatus::Unhealthy => 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate of one round of checks
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> (HealthStatus, String);
}

/// Broker reachability from consecutive failure and timeout counts
pub struct ApiCheck {
    stats: Arc<ApiStats>,
    degraded_after: u32,
    unhealthy_after: u32,
}

impl ApiCheck {
    pub fn new(stats: Arc<ApiStats>, degraded_after: u32, unhealthy_after: u32) -> Self {
        Self {
            stats,
            degraded_after,
            unhealthy_after,
        }
    }
}

#[async_trait]
impl HealthCheck for ApiCheck {
    fn name(&self) -> &str {
        "api"
    }

    async fn check(&self) -> (HealthStatus, String) {
        let snapshot = self.stats.snapshot();
        let worst = snapshot
            .consecutive_failures
            .max(snapshot.consecutive_timeouts);
        let detail = format!(
            "{} consecutive failures, {} consecutive timeouts, {}/{} calls failed",
            snapshot.consecutive_failures,
            snapshot.consecutive_timeouts,
            snapshot.total_failures,
            snapshot.total_calls
        );
        let status = if worst >= self.unhealthy_after {
            HealthStatus::Unhealthy
        } else if worst >= self.degraded_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        (status, detail)
    }
}

/// State directory writability
pub struct StorageCheck {
    store: SessionStore,
}

impl StorageCheck {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for StorageCheck {
    fn name(&self) -> &str {
        "storage"
    }

    async fn check(&self) -> (HealthStatus, String) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.probe()).await {
            Ok(Ok(())) => (
                HealthStatus::Healthy,
                format!("{} writable", self.store.dir().display()),
            ),
            Ok(Err(e)) => (HealthStatus::Unhealthy, e.to_string()),
            Err(e) => (HealthStatus::Unhealthy, format!("probe task failed: {}", e)),
        }
    }
}

/// Last time the main loop completed a cycle
#[derive(Debug)]
pub struct LoopHeartbeat {
    last_millis: AtomicI64,
}

impl Default for LoopHeartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHeartbeat {
    pub fn new() -> Self {
        Self {
            last_millis: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn beat(&self) {
        self.last_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.last_millis.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

/// Main-loop liveness
pub struct SchedulerCheck {
    heartbeat: Arc<LoopHeartbeat>,
    stale_after: Duration,
}

impl SchedulerCheck {
    pub fn new(heartbeat: Arc<LoopHeartbeat>, stale_after: Duration) -> Self {
        Self {
            heartbeat,
            stale_after,
        }
    }
}

#[async_trait]
impl HealthCheck for SchedulerCheck {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn check(&self) -> (HealthStatus, String) {
        let age = self.heartbeat.age();
        let detail = format!("last cycle {}s ago", age.as_secs());
        if age >= self.stale_after {
            (HealthStatus::Unhealthy, detail)
        } else if age >= self.stale_after / 2 {
            (HealthStatus::Degraded, detail)
        } else {
            (HealthStatus::Healthy, detail)
        }
    }
}

pub struct HealthChecker {
    checks: Vec<Box<dyn HealthCheck>>,
    emergency: Arc<EmergencyStop>,
    interval: Duration,
    failure_threshold: u32,
    halt_on: HashSet<String>,
    consecutive: Mutex<HashMap<String, u32>>,
    latest: Mutex<Option<SystemHealth>>,
}

impl HealthChecker {
    pub fn new(
        config: &HealthConfig,
        checks: Vec<Box<dyn HealthCheck>>,
        emergency: Arc<EmergencyStop>,
    ) -> Self {
        Self {
            checks,
            emergency,
            interval: Duration::from_secs(config.interval_secs),
            failure_threshold: config.failure_threshold.max(1),
            halt_on: config.halt_on.iter().cloned().collect(),
            consecutive: Mutex::new(HashMap::new()),
            latest: Mutex::new(None),
        }
    }

    /// Run every check once and apply the halt policy
    pub async fn run_once(&self) -> SystemHealth {
        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let (status, detail) = check.check().await;
            if status != HealthStatus::Healthy {
                tracing::warn!(check = check.name(), ?status, detail = %detail, "Health check not healthy");
            }
            results.push(CheckResult {
                name: check.name().to_string(),
                status,
                detail,
                checked_at: Utc::now(),
            });
        }

        let mut trips = Vec::new();
        if let Ok(mut consecutive) = self.consecutive.lock() {
            for result in &results {
                let count = consecutive.entry(result.name.clone()).or_insert(0);
                if result.status == HealthStatus::Unhealthy {
                    *count += 1;
                } else {
                    *count = 0;
                }
                if *count >= self.failure_threshold && self.halt_on.contains(&result.name) {
                    trips.push(format!(
                        "{} unhealthy {} times in a row: {}",
                        result.name, count, result.detail
                    ));
                }
            }
        }

        for reason in trips {
            self.emergency.trigger(HaltSource::HealthCheck, reason);
        }

        let overall = results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        set_gauge(GaugeMetric::HealthStatus, overall.gauge());

        let health = SystemHealth {
            overall,
            checks: results,
            at: Utc::now(),
        };
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(health.clone());
        }
        health
    }

    pub fn latest(&self) -> Option<SystemHealth> {
        self.latest.lock().ok().and_then(|l| l.clone())
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.interval.as_secs(),
                checks = self.checks.len(),
                "Health checker started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let health = self.run_once().await;
                        tracing::debug!(overall = ?health.overall, "Health round complete");
                    }
                }
            }
        })
    }
}
