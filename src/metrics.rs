//! Job Metrics
//!
//! Counters for backup, restore and failover outcomes and per-stage latency.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latency accumulator for one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageLatency {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl StageLatency {
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_ms as f64 / self.count as f64
    }
}

/// Metrics collector
#[derive(Debug, Default)]
pub struct Metrics {
    backups_started: AtomicU64,
    backups_completed: AtomicU64,
    backups_failed: AtomicU64,
    firings_skipped: AtomicU64,
    restores_completed: AtomicU64,
    restores_failed: AtomicU64,
    failovers_completed: AtomicU64,
    failovers_failed: AtomicU64,
    stages: RwLock<BTreeMap<String, StageLatency>>,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub backups_started: u64,
    pub backups_completed: u64,
    pub backups_failed: u64,
    pub firings_skipped: u64,
    pub restores_completed: u64,
    pub restores_failed: u64,
    pub failovers_completed: u64,
    pub failovers_failed: u64,
    pub stages: BTreeMap<String, StageLatency>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_started(&self) {
        self.backups_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backup_finished(&self, success: bool) {
        let counter = if success {
            &self.backups_completed
        } else {
            &self.backups_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn firing_skipped(&self) {
        self.firings_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restore_finished(&self, success: bool) {
        let counter = if success {
            &self.restores_completed
        } else {
            &self.restores_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failover_finished(&self, success: bool) {
        let counter = if success {
            &self.failovers_completed
        } else {
            &self.failovers_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long a stage took
    pub fn record_stage(&self, stage: &str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut stages = self.stages.write();
        let entry = stages.entry(stage.to_string()).or_default();
        entry.count += 1;
        entry.total_ms += ms;
        entry.max_ms = entry.max_ms.max(ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backups_started: self.backups_started.load(Ordering::Relaxed),
            backups_completed: self.backups_completed.load(Ordering::Relaxed),
            backups_failed: self.backups_failed.load(Ordering::Relaxed),
            firings_skipped: self.firings_skipped.load(Ordering::Relaxed),
            restores_completed: self.restores_completed.load(Ordering::Relaxed),
            restores_failed: self.restores_failed.load(Ordering::Relaxed),
            failovers_completed: self.failovers_completed.load(Ordering::Relaxed),
            failovers_failed: self.failovers_failed.load(Ordering::Relaxed),
            stages: self.stages.read().clone(),
        }
    }

    /// Get a summary of metrics
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Backups: {} started, {} completed, {} failed, {} skipped | Restores: {} ok, {} failed | Failovers: {} ok, {} failed",
            s.backups_started,
            s.backups_completed,
            s.backups_failed,
            s.firings_skipped,
            s.restores_completed,
            s.restores_failed,
            s.failovers_completed,
            s.failovers_failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = Metrics::new();

        metrics.backup_started();
        metrics.backup_finished(true);
        metrics.backup_started();
        metrics.backup_finished(false);
        metrics.firing_skipped();

        metrics.record_stage("dumping", Duration::from_millis(100));
        metrics.record_stage("dumping", Duration::from_millis(300));

        let s = metrics.snapshot();
        assert_eq!(s.backups_started, 2);
        assert_eq!(s.backups_completed, 1);
        assert_eq!(s.backups_failed, 1);
        assert_eq!(s.firings_skipped, 1);

        let dumping = s.stages["dumping"];
        assert_eq!(dumping.count, 2);
        assert_eq!(dumping.max_ms, 300);
        assert!((dumping.avg_ms() - 200.0).abs() < 0.1);
        assert!(metrics.summary().contains("2 started"));
    }
}
