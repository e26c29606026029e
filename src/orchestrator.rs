//! Orchestrator
//!
//! Owns every component wired to one shared [`Context`] and exposes the
//! operator-facing operations. `run` drives the scheduled side: cadence
//! timers, the backup worker pool and the replication monitor.

use chrono::Duration as ChronoDuration;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::admin::{AdminChannel, AdminPool, PsqlAdminChannel};
use crate::audit::{AuditEvent, AuditEventType, AuditRecorder};
use crate::backup::{BackupExecutor, DirectoryRemoteStore, PruneReport, RetentionManager};
use crate::catalogue::{BackupKind, BackupLevel, BackupRecord, Catalogue, FailoverEvent, RecoveryTest, ReplicaStatus};
use crate::config::OrchestratorConfig;
use crate::context::Context;
use crate::crypto::{FieldCipher, KeyManager, KeyRotation, SessionClaims, SessionTokenCodec};
use crate::error::{DrError, Result};
use crate::failover::{FailoverController, FailoverRequest, FailoverState};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::process::{ProcessRunner, SystemProcessRunner};
use crate::replication::ReplicationMonitor;
use crate::restore::{RecoveryTester, RestoreOrchestrator, RestoreReport, RestoreRequest};
use crate::scheduler::{Dispatcher, Scheduler, WorkerPool};

/// Summary for `keepsafe-cli status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub primary: String,
    pub key_version: u32,
    pub failover_state: FailoverState,
    pub latest: Vec<(BackupLevel, Option<BackupRecord>)>,
    pub replicas: Vec<ReplicaStatus>,
    pub recent_failovers: Vec<FailoverEvent>,
    pub metrics: MetricsSnapshot,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "primary: {} (failover {})", self.primary, self.failover_state)?;
        writeln!(f, "key version: {}", self.key_version)?;
        writeln!(f, "latest backups:")?;
        for (level, record) in &self.latest {
            match record {
                Some(r) => writeln!(
                    f,
                    "  {:<8} {} {} {} bytes",
                    level.as_str(),
                    r.id,
                    r.started_at.to_rfc3339(),
                    r.size_bytes
                )?,
                None => writeln!(f, "  {:<8} none", level.as_str())?,
            }
        }
        writeln!(f, "replicas:")?;
        for r in &self.replicas {
            writeln!(
                f,
                "  {:<12} {:?} lag {:.1}s / {} bytes",
                r.replica_id, r.status, r.lag_seconds, r.lag_bytes
            )?;
        }
        writeln!(f, "recent failovers:")?;
        for e in &self.recent_failovers {
            writeln!(
                f,
                "  {} {} -> {} success={}",
                e.started_at.to_rfc3339(),
                e.old_primary,
                e.new_primary,
                e.success
            )?;
        }
        Ok(())
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    ctx: Context,
    keys: Arc<KeyManager>,
    tokens: SessionTokenCodec,
    retention: Arc<RetentionManager>,
    executor: Arc<BackupExecutor>,
    restorer: RestoreOrchestrator,
    tester: RecoveryTester,
    monitor: Arc<ReplicationMonitor>,
    failover: FailoverController,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Open the catalogue and audit log under `config.root` and wire every
    /// component to them.
    pub fn open(
        config: OrchestratorConfig,
        keys: Arc<KeyManager>,
        runner: Arc<dyn ProcessRunner>,
        admin: Arc<dyn AdminChannel>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        std::fs::create_dir_all(layout.root())?;
        let catalogue = Arc::new(Catalogue::open(layout.catalogue_dir())?);
        let audit = Arc::new(AuditRecorder::open(&layout.audit_log(), config.audit_buffer)?);
        let admin = Arc::new(AdminPool::new(admin, config.admin_pool.clone()));
        let cipher = FieldCipher::new(keys.clone());

        let mut ctx = Context::new(layout, catalogue, audit, runner, cipher.clone(), admin)
            .with_primary(config.primary.clone());
        if let Some(dir) = &config.remote_dir {
            ctx = ctx.with_remote(Arc::new(DirectoryRemoteStore::new(dir)));
        }

        let shutdown = CancellationToken::new();
        let retention = Arc::new(RetentionManager::new(ctx.clone(), config.retention.clone()));
        let executor = Arc::new(
            BackupExecutor::new(ctx.clone(), config.backup.clone(), retention.clone()).with_shutdown(shutdown.clone()),
        );
        let restorer = RestoreOrchestrator::new(ctx.clone(), config.backup.clone(), config.restore.clone());
        let tester = RecoveryTester::new(ctx.clone());
        let monitor = Arc::new(ReplicationMonitor::new(ctx.clone(), config.replication.clone()));
        let failover = FailoverController::new(ctx.clone(), config.failover.clone());

        info!(
            root = %config.root.display(),
            primary = %config.primary,
            key_version = keys.version(),
            "Orchestrator opened"
        );
        Ok(Self {
            config,
            ctx,
            keys,
            tokens: SessionTokenCodec::new(cipher),
            retention,
            executor,
            restorer,
            tester,
            monitor,
            failover,
            shutdown,
        })
    }

    /// Open against the host: real dump utilities and a `psql` admin channel.
    pub fn open_system(config: OrchestratorConfig, keys: Arc<KeyManager>) -> Result<Self> {
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner);
        let admin = PsqlAdminChannel::new(
            config.psql.clone(),
            runner.clone(),
            config.layout().root().join("admin"),
            config.primary.clone(),
        )?;
        Self::open(config, keys, runner, Arc::new(admin))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.ctx.cipher
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.metrics.clone()
    }

    /// Token that stops the daemon loops and any running backup stage.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one backup now, outside the schedule. Still subject to the
    /// per-level exclusion.
    pub fn backup(&self, kind: BackupKind, level: BackupLevel) -> Result<BackupRecord> {
        self.executor.execute(kind, level)
    }

    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        self.restorer.restore(request)
    }

    pub fn drill(&self, backup_id: Uuid) -> Result<RecoveryTest> {
        self.tester.run_drill(backup_id)
    }

    /// Apply retention to `level`, or to every level when `None`.
    pub fn prune(&self, level: Option<BackupLevel>) -> Result<Vec<(BackupLevel, PruneReport)>> {
        let levels: Vec<BackupLevel> = match level {
            Some(level) => vec![level],
            None => BackupLevel::ALL.to_vec(),
        };
        levels
            .into_iter()
            .map(|level| Ok((level, self.retention.prune(level)?)))
            .collect()
    }

    pub fn poll_replicas(&self) -> Vec<ReplicaStatus> {
        self.monitor.poll_once()
    }

    pub fn failover(&self, request: &FailoverRequest) -> Result<FailoverEvent> {
        self.failover.perform_failover(request)
    }

    pub fn failover_state(&self) -> FailoverState {
        self.failover.state()
    }

    /// Rotate the master secret. Blobs sealed under the previous key set stay
    /// readable while this process keeps it archived.
    pub fn rotate_keys(&self) -> Result<KeyRotation> {
        let rotation = self.keys.rotate()?;
        self.ctx.audit.record(
            AuditEvent::new(AuditEventType::KeyRotation)
                .with_subject(rotation.current.version)
                .with_detail("previous_version", rotation.previous.version)
                .with_detail("previous_fingerprint", &rotation.previous.master_fingerprint)
                .with_detail("fingerprint", &rotation.current.master_fingerprint),
        );
        Ok(rotation)
    }

    pub fn issue_token(&self, subject: &str, ttl: ChronoDuration) -> Result<String> {
        self.tokens.issue(subject, ttl)
    }

    pub fn verify_token(&self, token: &str) -> Result<SessionClaims> {
        self.tokens.verify(token)
    }

    pub fn status(&self) -> StatusReport {
        let catalogue = &self.ctx.catalogue;
        let mut failovers = catalogue.failovers();
        failovers.sort_by_key(|e| e.started_at);
        let recent_failovers = failovers.into_iter().rev().take(5).collect();
        StatusReport {
            primary: self.ctx.primary(),
            key_version: self.keys.version(),
            failover_state: self.failover.state(),
            latest: BackupLevel::ALL
                .iter()
                .map(|&level| (level, catalogue.latest_completed(None, Some(level))))
                .collect(),
            replicas: catalogue.replicas(),
            recent_failovers,
            metrics: self.ctx.metrics.snapshot(),
        }
    }

    /// Run the scheduler, backup workers and replication monitor until the
    /// shutdown token is cancelled, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut pool = WorkerPool::new(self.config.workers.clone(), self.executor.clone());
        pool.start()?;

        let dispatcher = Arc::new(Dispatcher::new(
            pool.queue().clone(),
            self.ctx.audit.clone(),
            self.ctx.metrics.clone(),
        ));
        let scheduler = Scheduler::spawn(&self.config.schedule, dispatcher, self.shutdown.clone());
        let monitor = tokio::spawn(self.monitor.clone().run(self.shutdown.clone()));
        info!(workers = pool.num_workers(), "Daemon running");

        self.shutdown.cancelled().await;
        info!("Shutting down");

        scheduler.join().await;
        if let Err(e) = monitor.await {
            error!("Replication monitor task failed: {}", e);
        }
        tokio::task::spawn_blocking(move || pool.join())
            .await
            .map_err(|e| DrError::InvalidState(format!("worker pool join failed: {}", e)))?;
        info!("{}", self.ctx.metrics.summary());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{PositionMarkers, SimulatedCluster};
    use crate::backup::BackupConfig;
    use crate::crypto::KdfParams;
    use crate::process::{ScriptedOutcome, ScriptedProcessRunner};
    use crate::testing::{TEST_PRIMARY, TEST_REPLICA};
    use std::time::Duration;
    use tempfile::tempdir;
    use zeroize::Zeroizing;

    struct Setup {
        _dir: tempfile::TempDir,
        orch: Orchestrator,
        runner: Arc<ScriptedProcessRunner>,
    }

    fn setup() -> Setup {
        let dir = tempdir().unwrap();
        let config = OrchestratorConfig::new(dir.path().join("root"))
            .with_primary(TEST_PRIMARY)
            .with_replicas([TEST_REPLICA])
            .with_remote_dir(dir.path().join("remote"))
            .with_backup(BackupConfig::default());
        let keys = Arc::new(KeyManager::new(Zeroizing::new([3u8; 32]), KdfParams::fast()).unwrap());
        let runner = Arc::new(ScriptedProcessRunner::new());
        runner.on("pg_dump", ScriptedOutcome::stdout(vec![1u8; 256]));
        let cluster = Arc::new(SimulatedCluster::new(TEST_PRIMARY));
        cluster.add_replica(TEST_REPLICA, PositionMarkers::default());
        let orch = Orchestrator::open(config, keys, runner.clone(), cluster).unwrap();
        Setup {
            _dir: dir,
            orch,
            runner,
        }
    }

    #[test]
    fn test_backup_and_status() {
        let s = setup();
        let record = s.orch.backup(BackupKind::Full, BackupLevel::Weekly).unwrap();
        assert!(record.remote_location.is_some());

        let status = s.orch.status();
        assert_eq!(status.primary, TEST_PRIMARY);
        let weekly = status.latest.iter().find(|(l, _)| *l == BackupLevel::Weekly).unwrap();
        assert_eq!(weekly.1.as_ref().unwrap().id, record.id);
        assert_eq!(status.metrics.backups_completed, 1);
        assert!(status.to_string().contains("weekly"));
        assert_eq!(s.runner.calls_to("pg_dump"), 1);
    }

    #[test]
    fn test_rotation_keeps_old_tokens_and_blobs_readable() {
        let s = setup();
        let token = s.orch.issue_token("ops", ChronoDuration::minutes(5)).unwrap();
        let blob = s.orch.cipher().encrypt(b"secret", crate::crypto::Purpose::Medical).unwrap();

        let rotation = s.orch.rotate_keys().unwrap();
        assert_eq!(rotation.current.version, 2);
        assert_ne!(rotation.current.master_fingerprint, rotation.previous.master_fingerprint);

        assert_eq!(s.orch.verify_token(&token).unwrap().subject, "ops");
        assert_eq!(s.orch.cipher().decrypt(&blob, crate::crypto::Purpose::Medical).unwrap(), b"secret");
        assert_eq!(s.orch.context().audit.of_type(AuditEventType::KeyRotation).len(), 1);
    }

    #[test]
    fn test_failover_moves_primary() {
        let s = setup();
        let event = s
            .orch
            .failover(&FailoverRequest::manual(TEST_REPLICA, "planned"))
            .unwrap();
        assert!(event.success);
        assert_eq!(s.orch.status().primary, TEST_REPLICA);
        assert_eq!(s.orch.failover_state(), FailoverState::Stable);
    }

    #[test]
    fn test_prune_every_level() {
        let s = setup();
        let reports = s.orch.prune(None).unwrap();
        assert_eq!(reports.len(), BackupLevel::ALL.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_until_shutdown() {
        let s = setup();
        let orch = Arc::new(s.orch);
        let shutdown = orch.shutdown_token();
        let daemon = tokio::spawn(orch.clone().run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        daemon.await.unwrap().unwrap();
        assert_eq!(orch.context().catalogue.replicas().len(), 1);
    }
}
