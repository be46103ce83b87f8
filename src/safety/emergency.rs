//! Emergency stop
//!
//! Process-wide halt flag. Entry submission checks it with a single atomic
//! load. Only an explicit operator action clears it.

use crate::telemetry::{set_gauge, GaugeMetric};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What raised the halt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltSource {
    HealthCheck,
    Operator,
    RiskLimit,
    StopFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub source: HaltSource,
    pub reason: String,
    pub at: DateTime<Utc>,
}

pub struct EmergencyStop {
    halted: AtomicBool,
    record: watch::Sender<Option<HaltRecord>>,
}

impl Default for EmergencyStop {
    fn default() -> Self {
        Self::new()
    }
}

impl EmergencyStop {
    pub fn new() -> Self {
        let (record, _) = watch::channel(None);
        Self {
            halted: AtomicBool::new(false),
            record,
        }
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn halt_record(&self) -> Option<HaltRecord> {
        if !self.is_halted() {
            return None;
        }
        self.record.borrow().clone()
    }

    /// Reason entries are refused, or `None` when trading is allowed
    ///
    /// Follows the flag, not the record: a halt whose record is still being
    /// published already refuses entries.
    pub fn halt_reason(&self) -> Option<String> {
        if !self.is_halted() {
            return None;
        }
        Some(
            self.record
                .borrow()
                .as_ref()
                .map(|r| r.reason.clone())
                .unwrap_or_else(|| "emergency stop".to_string()),
        )
    }

    /// Raise the halt. Returns false if it was already raised.
    pub fn trigger(&self, source: HaltSource, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.halted.swap(true, Ordering::AcqRel) {
            tracing::debug!(?source, reason = %reason, "Emergency stop already active");
            return false;
        }
        tracing::error!(?source, reason = %reason, "EMERGENCY STOP triggered");
        set_gauge(GaugeMetric::EmergencyHalted, 1.0);
        self.record.send_replace(Some(HaltRecord {
            source,
            reason,
            at: Utc::now(),
        }));
        true
    }

    /// Operator-only
    pub fn clear(&self, operator: &str) {
        if !self.halted.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(operator, "Emergency stop cleared");
        set_gauge(GaugeMetric::EmergencyHalted, 0.0);
        self.record.send_replace(None);
    }

    /// Re-arm from a persisted record
    pub fn restore(&self, record: HaltRecord) {
        tracing::warn!(
            source = ?record.source,
            reason = %record.reason,
            since = %record.at,
            "Re-arming persisted emergency stop"
        );
        self.halted.store(true, Ordering::Release);
        set_gauge(GaugeMetric::EmergencyHalted, 1.0);
        self.record.send_replace(Some(record));
    }

    /// Receiver that observes every halt change
    pub fn subscribe(&self) -> watch::Receiver<Option<HaltRecord>> {
        self.record.subscribe()
    }
}

/// Polls for an operator stop file and halts when it appears
pub struct StopFileWatcher {
    stop: Arc<EmergencyStop>,
    path: PathBuf,
    interval: Duration,
}

impl StopFileWatcher {
    pub fn new(stop: Arc<EmergencyStop>, path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            stop,
            path: path.into(),
            interval,
        }
    }

    /// Check once; returns true if this check raised the halt
    pub fn check(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        let reason = read_reason(&self.path);
        self.stop.trigger(HaltSource::StopFile, reason)
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(path = %self.path.display(), "Stop file watcher started");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check();
                    }
                }
            }
            tracing::debug!("Stop file watcher stopped");
        })
    }
}

fn read_reason(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        _ => format!("stop file present at {}", path.display()),
    }
}
