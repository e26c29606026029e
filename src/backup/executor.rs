//! Backup Executor
//!
//! Drives one backup job through
//! `init -> dumping -> archiving -> checksumming -> encrypting? -> compressing
//! -> uploading? -> complete | failed`. Every stage leaves its output in the
//! job's working directory before the next one starts. A failed job keeps
//! its working directory; only the success path cleans up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::archive::{pack_artifact, tar_paths};
use super::manifest::{ComponentEntry, ComponentKind, Manifest, ENCRYPTED_SUFFIX};
use super::retention::RetentionManager;
use crate::audit::{AuditEvent, AuditEventType};
use crate::catalogue::{BackupKind, BackupLevel, BackupRecord, BackupStage};
use crate::context::Context;
use crate::crypto::Purpose;
use crate::error::{DrError, Result};
use crate::locks::LevelLocks;
use crate::process::Invocation;

/// How the data store is dumped and re-applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseTarget {
    pub dump_program: String,
    pub dump_args: Vec<String>,
    pub restore_program: String,
    pub restore_args: Vec<String>,
    /// Extra environment, e.g. connection settings.
    pub env: BTreeMap<String, String>,
}

impl Default for DatabaseTarget {
    fn default() -> Self {
        Self {
            dump_program: "pg_dump".to_string(),
            dump_args: vec!["--format=plain".into(), "--no-owner".into(), "--clean".into()],
            restore_program: "psql".to_string(),
            restore_args: vec!["--quiet".into(), "--single-transaction".into()],
            env: BTreeMap::new(),
        }
    }
}

impl DatabaseTarget {
    pub fn dump_invocation(&self, stage: &str, out: &Path) -> Invocation {
        let mut inv = Invocation::new(stage, &self.dump_program)
            .args(self.dump_args.iter().cloned())
            .stdout_to(out);
        for (k, v) in &self.env {
            inv = inv.env(k, v);
        }
        inv
    }

    pub fn apply_invocation(&self, stage: &str, input: &Path) -> Invocation {
        let mut inv = Invocation::new(stage, &self.restore_program)
            .args(self.restore_args.iter().cloned())
            .stdin_from(input);
        for (k, v) in &self.env {
            inv = inv.env(k, v);
        }
        inv
    }
}

/// Backup job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// `None` leaves the data store out of backups.
    pub database: Option<DatabaseTarget>,
    /// Directories making up the file store.
    pub file_store_dirs: Vec<PathBuf>,
    /// Configuration files or directories.
    pub config_paths: Vec<PathBuf>,
    pub encrypt: bool,
    pub compress: bool,
    pub stage_timeout: Duration,
    /// Level used when an incremental falls back to a full backup.
    pub default_level: BackupLevel,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            database: Some(DatabaseTarget::default()),
            file_store_dirs: Vec::new(),
            config_paths: Vec::new(),
            encrypt: true,
            compress: true,
            stage_timeout: Duration::from_secs(30 * 60),
            default_level: BackupLevel::Daily,
        }
    }
}

impl BackupConfig {
    pub fn with_database(mut self, database: Option<DatabaseTarget>) -> Self {
        self.database = database;
        self
    }

    pub fn with_file_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_store_dirs.push(dir.into());
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_paths.push(path.into());
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_default_level(mut self, level: BackupLevel) -> Self {
        self.default_level = level;
        self
    }

    fn components(&self) -> Vec<ComponentKind> {
        let mut out = Vec::new();
        if self.database.is_some() {
            out.push(ComponentKind::Database);
        }
        if !self.file_store_dirs.is_empty() {
            out.push(ComponentKind::Files);
        }
        if !self.config_paths.is_empty() {
            out.push(ComponentKind::Config);
        }
        out
    }
}

/// Directory and artifact name for a job: `{timestamp}-{id prefix}`.
pub fn artifact_name(started_at: DateTime<Utc>, id: &Uuid) -> String {
    let id = id.simple().to_string();
    format!("{}-{}", started_at.format("%Y%m%dT%H%M%S%.3fZ"), &id[..8])
}

/// Where the plaintext components and manifest live inside a working directory.
fn payload_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("payload")
}

/// Runs backup jobs. Cheap to share; one executor serves every level.
pub struct BackupExecutor {
    ctx: Context,
    config: BackupConfig,
    retention: Arc<RetentionManager>,
    locks: LevelLocks,
    shutdown: CancellationToken,
}

impl BackupExecutor {
    pub fn new(ctx: Context, config: BackupConfig, retention: Arc<RetentionManager>) -> Self {
        Self {
            ctx,
            config,
            retention,
            locks: LevelLocks::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop scheduling further stages once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn is_running(&self, level: BackupLevel) -> bool {
        self.locks.is_busy(level)
    }

    /// Run one backup to completion. An incremental with no completed full
    /// backup to build on runs as a full backup at the default level.
    pub fn execute(&self, kind: BackupKind, level: BackupLevel) -> Result<BackupRecord> {
        let requested = kind;
        let (kind, level, base) = self.resolve(kind, level);
        let Some(_guard) = self.locks.try_acquire(level) else {
            if kind != requested {
                self.record_skipped_fallback(level);
            }
            return Err(DrError::LevelBusy(level.to_string()));
        };

        let mut record = BackupRecord::new(kind, level);
        record.base_backup_id = base.as_ref().map(|b| b.id);
        record.encrypted = self.config.encrypt;
        record.compressed = self.config.compress;
        let name = artifact_name(record.started_at, &record.id);
        let work_dir = self.ctx.layout.work_dir(level, &name);
        record.work_dir = Some(work_dir.display().to_string());
        self.ctx.catalogue.insert_backup(&record)?;

        self.ctx.metrics.backup_started();
        self.ctx.audit.record(
            AuditEvent::new(AuditEventType::BackupStarted)
                .with_subject(record.id)
                .with_detail("kind", kind)
                .with_detail("level", level),
        );
        info!(backup_id = %record.id, %kind, %level, "Backup started");

        match self.run_stages(&mut record, &work_dir, &name, base.as_ref()) {
            Ok(()) => {
                if let Err(e) = self.retention.cleanup_workdir(&work_dir) {
                    warn!(backup_id = %record.id, "Failed to clean working directory: {}", e);
                }
                self.ctx.metrics.backup_finished(true);
                self.ctx.audit.record(
                    AuditEvent::new(AuditEventType::BackupCompleted)
                        .with_subject(record.id)
                        .with_detail("level", level)
                        .with_detail("size_bytes", record.size_bytes)
                        .with_detail("checksum", record.checksum.as_deref().unwrap_or_default()),
                );
                info!(
                    backup_id = %record.id,
                    size_bytes = record.size_bytes,
                    location = record.location.as_deref().unwrap_or_default(),
                    "Backup completed"
                );
                Ok(record)
            }
            Err(e) => {
                let stage = record.stage;
                let message = format!("{} stage failed: {}", stage, e);
                error!(backup_id = %record.id, %stage, "Backup failed: {}", e);
                if record.fail(&message).is_ok() {
                    record.stage = BackupStage::Failed;
                    if let Err(write_err) = self.ctx.catalogue.update_backup(&record) {
                        error!(backup_id = %record.id, "Failed to record backup failure: {}", write_err);
                    }
                }
                self.ctx.metrics.backup_finished(false);
                self.ctx.audit.record(
                    AuditEvent::new(AuditEventType::BackupFailed)
                        .with_subject(record.id)
                        .failed()
                        .with_message(message)
                        .with_detail("level", level)
                        .with_detail("work_dir", work_dir.display()),
                );
                Err(e)
            }
        }
    }

    /// The full backup standing in for an incremental found its level busy.
    /// Leave a failed row so the skipped run shows in the history.
    fn record_skipped_fallback(&self, level: BackupLevel) {
        let mut record = BackupRecord::new(BackupKind::Full, level);
        let message = format!("incremental fallback skipped: a {} backup is already running", level);
        warn!(backup_id = %record.id, %level, "{}", message);
        if record.fail(&message).is_ok() {
            record.stage = BackupStage::Failed;
            if let Err(e) = self.ctx.catalogue.insert_backup(&record) {
                error!(backup_id = %record.id, "Failed to record skipped backup: {}", e);
            }
        }
        self.ctx.audit.record(
            AuditEvent::new(AuditEventType::BackupFailed)
                .with_subject(record.id)
                .failed()
                .with_message(message)
                .with_detail("level", level),
        );
    }

    fn resolve(&self, kind: BackupKind, level: BackupLevel) -> (BackupKind, BackupLevel, Option<BackupRecord>) {
        if kind == BackupKind::Full {
            return (kind, level, None);
        }
        match self.ctx.catalogue.latest_completed(Some(BackupKind::Full), None) {
            Some(base) => (kind, level, Some(base)),
            None => {
                warn!(
                    %level,
                    fallback = %self.config.default_level,
                    "No completed full backup to build on; running a full backup instead"
                );
                (BackupKind::Full, self.config.default_level, None)
            }
        }
    }

    /// Enter `stage`, persist it, and run `f` under the stage timeout.
    /// External processes are bounded by the runner; an in-process stage
    /// that overran is failed with `StageTimeout` once it returns.
    fn stage<T>(&self, record: &mut BackupRecord, stage: BackupStage, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.shutdown.is_cancelled() {
            return Err(DrError::InvalidState(format!("shutdown requested before {} stage", stage)));
        }
        record.stage = stage;
        self.ctx.catalogue.update_backup(record)?;
        debug!(backup_id = %record.id, %stage, "Entering stage");

        let start = Instant::now();
        let out = f();
        let elapsed = start.elapsed();
        self.ctx.metrics.record_stage(stage.as_str(), elapsed);
        let out = out?;
        if elapsed > self.config.stage_timeout {
            return Err(DrError::StageTimeout {
                stage: stage.to_string(),
                timeout: self.config.stage_timeout,
            });
        }
        Ok(out)
    }

    fn run_stages(
        &self,
        record: &mut BackupRecord,
        work_dir: &Path,
        name: &str,
        base: Option<&BackupRecord>,
    ) -> Result<()> {
        let payload = payload_dir(work_dir);
        fs::create_dir_all(&payload)?;
        let components = self.config.components();
        if components.is_empty() {
            return Err(DrError::Config("backup has no components configured".into()));
        }
        record.components = components.iter().map(|c| c.as_str().to_string()).collect();
        let timeout = self.config.stage_timeout;

        self.stage(record, BackupStage::Dumping, || {
            if let Some(db) = &self.config.database {
                let out = payload.join(ComponentKind::Database.file_name());
                self.ctx.runner.run(&db.dump_invocation("dumping", &out), timeout)?;
            }
            Ok(())
        })?;

        let modified_after = base.map(|b| SystemTime::from(b.started_at));
        self.stage(record, BackupStage::Archiving, || {
            if !self.config.file_store_dirs.is_empty() {
                let n = tar_paths(
                    &payload.join(ComponentKind::Files.file_name()),
                    &self.config.file_store_dirs,
                    modified_after,
                )?;
                debug!(files = n, incremental = modified_after.is_some(), "Archived file store");
            }
            if !self.config.config_paths.is_empty() {
                tar_paths(&payload.join(ComponentKind::Config.file_name()), &self.config.config_paths, None)?;
            }
            Ok(())
        })?;

        let mut manifest = Manifest::new(record.id, record.level, record.kind, record.started_at);
        manifest.base_backup_id = record.base_backup_id;
        self.stage(record, BackupStage::Checksumming, || {
            for kind in &components {
                let file = payload.join(kind.file_name());
                let checksum = self.ctx.verifier.hash_file(&file)?;
                manifest.checksums.insert(kind.file_name().to_string(), checksum);
            }
            Ok(())
        })?;

        if self.config.encrypt {
            let key_version = self.stage(record, BackupStage::Encrypting, || {
                for kind in &components {
                    let plain = payload.join(kind.file_name());
                    let sealed = payload.join(format!("{}{}", kind.file_name(), ENCRYPTED_SUFFIX));
                    self.ctx.cipher.encrypt_file(&plain, &sealed, Purpose::Backup)?;
                    fs::remove_file(&plain)?;
                }
                Ok(self.ctx.cipher.keys().version())
            })?;
            record.key_version = Some(key_version);
            manifest.key_version = Some(key_version);
        }

        for kind in &components {
            let file = if self.config.encrypt {
                format!("{}{}", kind.file_name(), ENCRYPTED_SUFFIX)
            } else {
                kind.file_name().to_string()
            };
            let size_bytes = fs::metadata(payload.join(&file))?.len();
            manifest.components.push(ComponentEntry {
                kind: *kind,
                file,
                size_bytes,
                encrypted: self.config.encrypt,
            });
        }
        manifest.write(&payload)?;

        let extension = if self.config.compress { "tar.gz" } else { "tar" };
        let artifact = self
            .ctx
            .layout
            .artifact_dir(record.level)
            .join(format!("{}.{}", name, extension));
        let (checksum, size) = self.stage(record, BackupStage::Compressing, || {
            pack_artifact(&payload, &artifact, self.config.compress)?;
            let checksum = self.ctx.verifier.hash_file(&artifact)?;
            Ok((checksum, fs::metadata(&artifact)?.len()))
        })?;

        if let Some(remote) = self.ctx.remote.clone() {
            let key = format!("{}/{}.{}", record.level, name, extension);
            let location = self.stage(record, BackupStage::Uploading, || remote.upload(&artifact, &key))?;
            record.remote_location = Some(location);
        }

        record.complete(artifact.display().to_string(), checksum, size)?;
        self.ctx.catalogue.update_backup(record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{DirectoryRemoteStore, RetentionPolicy};
    use crate::catalogue::BackupStatus;
    use crate::process::ScriptedOutcome;
    use crate::testing::Fixture;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    struct Setup {
        _dir: TempDir,
        fx: Fixture,
        files: PathBuf,
    }

    fn setup() -> Setup {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(&dir.path().join("root")).unwrap();
        let files = dir.path().join("uploads");
        fs::create_dir_all(&files).unwrap();
        fs::write(files.join("invoice.pdf"), vec![9u8; 2048]).unwrap();
        fx.runner.on("pg_dump", ScriptedOutcome::stdout(b"CREATE TABLE patients(id int);".to_vec()));
        Setup { _dir: dir, fx, files }
    }

    fn executor(s: &Setup) -> BackupExecutor {
        let config = BackupConfig::default().with_file_store_dir(&s.files);
        let retention = Arc::new(RetentionManager::new(s.fx.ctx.clone(), RetentionPolicy::default()));
        BackupExecutor::new(s.fx.ctx.clone(), config, retention)
    }

    #[test]
    fn test_daily_backup_completes_with_checksum() {
        let s = setup();
        let record = executor(&s).execute(BackupKind::Full, BackupLevel::Daily).unwrap();

        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.stage, BackupStage::Complete);
        let location = record.location.clone().unwrap();
        let stored = s.fx.ctx.catalogue.backup(&record.id).unwrap();
        assert_eq!(stored.checksum, record.checksum);
        s.fx.ctx
            .verifier
            .verify_file(Path::new(&location), record.checksum.as_deref().unwrap())
            .unwrap();
        assert_eq!(record.key_version, Some(1));
        assert!(!Path::new(record.work_dir.as_deref().unwrap()).exists());
        assert_eq!(s.fx.runner.calls_to("pg_dump"), 1);
    }

    #[test]
    fn test_incremental_without_full_falls_back() {
        let s = setup();
        let record = executor(&s).execute(BackupKind::Incremental, BackupLevel::Weekly).unwrap();
        assert_eq!(record.kind, BackupKind::Full);
        assert_eq!(record.level, BackupLevel::Daily);
        assert!(record.base_backup_id.is_none());
    }

    #[test]
    fn test_busy_fallback_level_is_recorded() {
        let s = setup();
        let exec = executor(&s);
        let _daily = exec.locks.try_acquire(BackupLevel::Daily).unwrap();

        let err = exec.execute(BackupKind::Incremental, BackupLevel::Weekly).unwrap_err();
        assert!(matches!(err, DrError::LevelBusy(_)));

        let rows = s.fx.ctx.catalogue.backups(None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, BackupStatus::Failed);
        assert_eq!(rows[0].kind, BackupKind::Full);
        assert_eq!(rows[0].level, BackupLevel::Daily);
        assert!(rows[0].error.as_deref().unwrap().contains("fallback"));
        assert_eq!(s.fx.ctx.audit.of_type(AuditEventType::BackupFailed).len(), 1);
        assert_eq!(s.fx.runner.calls_to("pg_dump"), 0);
    }

    #[test]
    fn test_incremental_references_base() {
        let s = setup();
        let exec = executor(&s);
        let full = exec.execute(BackupKind::Full, BackupLevel::Daily).unwrap();
        let inc = exec.execute(BackupKind::Incremental, BackupLevel::Daily).unwrap();
        assert_eq!(inc.kind, BackupKind::Incremental);
        assert_eq!(inc.base_backup_id, Some(full.id));
    }

    #[test]
    fn test_failed_dump_keeps_work_dir() {
        let s = setup();
        s.fx.runner.once("pg_dump", ScriptedOutcome::fail(1, "connection refused"));
        let err = executor(&s).execute(BackupKind::Full, BackupLevel::Daily).unwrap_err();
        assert!(matches!(err, DrError::ExternalProcess { code: Some(1), .. }));

        let record = s.fx.ctx.catalogue.backups(None).remove(0);
        assert_eq!(record.status, BackupStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("dumping"));
        assert!(record.checksum.is_none());
        assert!(Path::new(record.work_dir.as_deref().unwrap()).exists());
        assert_eq!(s.fx.ctx.audit.of_type(AuditEventType::BackupFailed).len(), 1);
    }

    #[test]
    fn test_hanging_dump_times_out() {
        let s = setup();
        s.fx.runner.once("pg_dump", ScriptedOutcome::Hang);
        let err = executor(&s).execute(BackupKind::Full, BackupLevel::Test).unwrap_err();
        assert!(matches!(err, DrError::StageTimeout { .. }));
    }

    #[test]
    fn test_cancelled_before_first_stage() {
        let s = setup();
        let token = CancellationToken::new();
        token.cancel();
        let exec = executor(&s).with_shutdown(token);
        assert!(exec.execute(BackupKind::Full, BackupLevel::Daily).is_err());
        assert_eq!(s.fx.runner.calls_to("pg_dump"), 0);
    }

    #[test]
    fn test_upload_sets_remote_location() {
        let mut s = setup();
        let remote_dir = tempdir().unwrap();
        s.fx.ctx = s.fx.ctx.clone().with_remote(Arc::new(DirectoryRemoteStore::new(remote_dir.path())));
        let record = executor(&s).execute(BackupKind::Full, BackupLevel::Monthly).unwrap();
        let remote = record.remote_location.unwrap();
        assert!(remote.starts_with("dir://monthly/"));
    }

    #[test]
    fn test_same_level_never_dumps_concurrently() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let runner = Arc::new(crate::process::ScriptedProcessRunner::new().with_delay(Duration::from_millis(200)));
        let mut ctx = fx.ctx.clone();
        ctx.runner = runner.clone();
        let retention = Arc::new(RetentionManager::new(ctx.clone(), RetentionPolicy::default()));
        let exec = Arc::new(BackupExecutor::new(ctx, BackupConfig::default(), retention));

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let exec = exec.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    exec.execute(BackupKind::Full, BackupLevel::Daily)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(DrError::LevelBusy(_)))));
        assert_eq!(runner.calls_to("pg_dump"), 1);
    }
}
