//! Replication Monitor
//!
//! Polls each replica's reported positions, computes lag and upserts one
//! status row per replica. Excess lag is a warning only; acting on it is left
//! to an operator or an outer policy.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::PositionMarkers;
use crate::audit::{AuditEvent, AuditEventType};
use crate::catalogue::{ReplicaHealth, ReplicaStatus};
use crate::context::Context;

/// Replication monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub replicas: Vec<String>,
    pub poll_interval: Duration,
    /// Lag above this many seconds marks a replica lagging.
    pub lag_threshold_seconds: f64,
    /// Lag above this many bytes marks a replica lagging.
    pub lag_threshold_bytes: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replicas: Vec::new(),
            poll_interval: Duration::from_secs(30),
            lag_threshold_seconds: 300.0,
            lag_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ReplicationConfig {
    pub fn with_replica(mut self, replica: impl Into<String>) -> Self {
        self.replicas.push(replica.into());
        self
    }

    pub fn with_lag_threshold(mut self, seconds: f64, bytes: u64) -> Self {
        self.lag_threshold_seconds = seconds;
        self.lag_threshold_bytes = bytes;
        self
    }
}

pub struct ReplicationMonitor {
    ctx: Context,
    config: ReplicationConfig,
}

impl ReplicationMonitor {
    pub fn new(ctx: Context, config: ReplicationConfig) -> Self {
        Self { ctx, config }
    }

    /// Poll every replica once and persist the results.
    pub fn poll_once(&self) -> Vec<ReplicaStatus> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(self.config.replicas.len());

        for replica in &self.config.replicas {
            let previous = self.ctx.catalogue.replica(replica);
            let status = match self.ctx.admin.with(|admin| admin.replica_positions(replica)) {
                Ok(markers) => self.assess(replica, markers, now),
                Err(e) => ReplicaStatus {
                    replica_id: replica.clone(),
                    status: ReplicaHealth::Failed,
                    lag_bytes: previous.as_ref().map(|p| p.lag_bytes).unwrap_or(0),
                    lag_seconds: previous.as_ref().map(|p| p.lag_seconds).unwrap_or(0.0),
                    last_sync: previous.as_ref().and_then(|p| p.last_sync),
                    markers: previous.as_ref().map(|p| p.markers).unwrap_or_default(),
                    updated_at: now,
                    error: Some(e.to_string()),
                },
            };

            self.signal(&status, previous.map(|p| p.status));
            if let Err(e) = self.ctx.catalogue.upsert_replica(&status) {
                error!(replica = %replica, "Failed to persist replica status: {}", e);
            }
            out.push(status);
        }
        out
    }

    fn assess(&self, replica: &str, markers: PositionMarkers, now: chrono::DateTime<Utc>) -> ReplicaStatus {
        let lag_bytes = markers.lag_bytes();
        let lag_seconds = markers.lag_seconds(now);
        let lagging = lag_seconds > self.config.lag_threshold_seconds || lag_bytes > self.config.lag_threshold_bytes;
        ReplicaStatus {
            replica_id: replica.to_string(),
            status: if lagging {
                ReplicaHealth::Lagging
            } else {
                ReplicaHealth::Active
            },
            lag_bytes,
            lag_seconds,
            last_sync: markers.last_replay_at,
            markers,
            updated_at: now,
            error: None,
        }
    }

    /// Log every unhealthy poll; audit only on a change of health.
    fn signal(&self, status: &ReplicaStatus, previous: Option<ReplicaHealth>) {
        let changed = previous != Some(status.status);
        match status.status {
            ReplicaHealth::Active => {
                debug!(replica = %status.replica_id, lag_bytes = status.lag_bytes, "Replica healthy");
                if changed && previous.is_some() {
                    info!(replica = %status.replica_id, "Replica recovered");
                }
            }
            ReplicaHealth::Lagging => {
                warn!(
                    replica = %status.replica_id,
                    lag_seconds = status.lag_seconds,
                    lag_bytes = status.lag_bytes,
                    threshold_seconds = self.config.lag_threshold_seconds,
                    "Replica lag above threshold"
                );
                if changed {
                    self.ctx.audit.record(
                        AuditEvent::new(AuditEventType::ReplicaLagging)
                            .with_subject(&status.replica_id)
                            .with_detail("lag_seconds", status.lag_seconds)
                            .with_detail("lag_bytes", status.lag_bytes),
                    );
                }
            }
            ReplicaHealth::Failed => {
                warn!(
                    replica = %status.replica_id,
                    error = status.error.as_deref().unwrap_or_default(),
                    "Replica poll failed"
                );
                if changed {
                    self.ctx.audit.record(
                        AuditEvent::new(AuditEventType::ReplicaFailed)
                            .with_subject(&status.replica_id)
                            .failed()
                            .with_message(status.error.clone().unwrap_or_default()),
                    );
                }
            }
        }
    }

    /// Poll on a fixed interval until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut timer = interval(self.config.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(replicas = self.config.replicas.len(), "Replication monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    let monitor = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || monitor.poll_once()).await {
                        error!("Replica poll task failed: {}", e);
                    }
                }
            }
        }
        info!("Replication monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, TEST_REPLICA};
    use tempfile::tempdir;

    fn monitor(fx: &Fixture) -> ReplicationMonitor {
        ReplicationMonitor::new(
            fx.ctx.clone(),
            ReplicationConfig::default()
                .with_replica(TEST_REPLICA)
                .with_lag_threshold(300.0, u64::MAX),
        )
    }

    #[test]
    fn test_lagging_replica_warns_without_failover() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        fx.cluster.set_catch_up_on_poll(false);
        fx.cluster.set_markers(
            TEST_REPLICA,
            PositionMarkers {
                primary_lsn: 5_000,
                write_lsn: 4_500,
                flush_lsn: 4_200,
                replay_lsn: 4_000,
                last_replay_at: Some(Utc::now() - chrono::Duration::seconds(400)),
            },
        );

        let statuses = monitor(&fx).poll_once();
        assert_eq!(statuses[0].status, ReplicaHealth::Lagging);
        assert_eq!(statuses[0].lag_bytes, 1_000);
        assert!(statuses[0].lag_seconds >= 400.0);

        let row = fx.ctx.catalogue.replica(TEST_REPLICA).unwrap();
        assert_eq!(row.status, ReplicaHealth::Lagging);
        assert!(fx.ctx.catalogue.failovers().is_empty());
        assert!(!fx.cluster.command_log().iter().any(|c| c.starts_with("promote:")));
        assert_eq!(fx.ctx.audit.of_type(AuditEventType::ReplicaLagging).len(), 1);

        // A second poll updates the same row without a second audit entry.
        monitor(&fx).poll_once();
        assert_eq!(fx.ctx.catalogue.replicas().len(), 1);
        assert_eq!(fx.ctx.audit.of_type(AuditEventType::ReplicaLagging).len(), 1);
    }

    #[test]
    fn test_unreachable_replica_is_failed() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        fx.cluster.set_unreachable(TEST_REPLICA, true);
        let statuses = monitor(&fx).poll_once();
        assert_eq!(statuses[0].status, ReplicaHealth::Failed);
        assert!(statuses[0].error.is_some());

        fx.cluster.set_unreachable(TEST_REPLICA, false);
        let statuses = monitor(&fx).poll_once();
        assert_eq!(statuses[0].status, ReplicaHealth::Active);
        assert_eq!(statuses[0].lag_seconds, 0.0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let monitor = Arc::new(monitor(&fx));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        task.await.unwrap();
        assert!(fx.ctx.catalogue.replica(TEST_REPLICA).is_some());
    }
}
