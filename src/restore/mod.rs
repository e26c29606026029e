//! Restore Orchestrator
//!
//! Rebuilds the live store from a catalogued backup. Steps run strictly in
//! order: locate, verify, restore point, extract, decrypt, apply, verify,
//! count. Nothing destructive happens until the artifact checksum and every
//! component's plaintext checksum have been verified. An incremental backup
//! only carries files changed since its base, so restoring its file store
//! first lays down the base full backup's files.

mod drill;
mod snapshot;

pub use drill::RecoveryTester;
pub use snapshot::{RestorePointStore, PRE_RESTORE_KIND};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType};
use crate::backup::archive::{unpack_artifact, untar};
use crate::backup::{BackupConfig, ComponentKind, Manifest};
use crate::catalogue::{BackupKind, BackupRecord, BackupStatus, Snapshot};
use crate::context::Context;
use crate::crypto::Purpose;
use crate::error::{DrError, Result};
use crate::locks::RestoreGuard;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Root the file-store and config archives are extracted under.
    pub target_root: PathBuf,
    /// Scalar queries run against the live store after applying.
    pub verification_queries: Vec<String>,
    pub stage_timeout: Duration,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from("/"),
            verification_queries: vec!["SELECT 1".to_string()],
            stage_timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl RestoreConfig {
    pub fn with_target_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.target_root = root.into();
        self
    }

    pub fn with_verification_query(mut self, sql: impl Into<String>) -> Self {
        self.verification_queries.push(sql.into());
        self
    }
}

/// Which components a restore applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSelection {
    pub database: bool,
    pub files: bool,
    pub config: bool,
}

impl Default for ComponentSelection {
    fn default() -> Self {
        Self {
            database: true,
            files: true,
            config: true,
        }
    }
}

impl ComponentSelection {
    pub fn only(kind: ComponentKind) -> Self {
        Self {
            database: kind == ComponentKind::Database,
            files: kind == ComponentKind::Files,
            config: kind == ComponentKind::Config,
        }
    }

    pub fn includes(&self, kind: ComponentKind) -> bool {
        match kind {
            ComponentKind::Database => self.database,
            ComponentKind::Files => self.files,
            ComponentKind::Config => self.config,
        }
    }

    pub fn kinds(&self) -> Vec<ComponentKind> {
        ComponentKind::ALL.into_iter().filter(|k| self.includes(*k)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub backup_id: Uuid,
    pub components: ComponentSelection,
}

impl RestoreRequest {
    pub fn new(backup_id: Uuid) -> Self {
        Self {
            backup_id,
            components: ComponentSelection::default(),
        }
    }

    pub fn with_components(mut self, components: ComponentSelection) -> Self {
        self.components = components;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub backup_id: Uuid,
    /// Full backup whose file store was applied beneath an incremental.
    pub base_backup_id: Option<Uuid>,
    pub snapshot_id: Uuid,
    pub applied: Vec<ComponentKind>,
    pub connections_terminated: usize,
    pub verification: Vec<(String, i64)>,
    pub duration: Duration,
}

/// Resolve a completed backup's artifact, fetching the remote copy if the
/// local one is gone.
pub(crate) fn locate_artifact(ctx: &Context, record: &BackupRecord, scratch: &Path) -> Result<PathBuf> {
    let location = record
        .location
        .as_deref()
        .ok_or_else(|| DrError::InvalidState(format!("backup {} has no location", record.id)))?;
    let local = PathBuf::from(location);
    if local.exists() {
        return Ok(local);
    }
    match (&ctx.remote, &record.remote_location) {
        (Some(remote), Some(remote_location)) => {
            fs::create_dir_all(scratch)?;
            let fetched = scratch.join("artifact");
            remote.fetch(remote_location, &fetched)?;
            info!(backup_id = %record.id, %remote_location, "Fetched artifact from remote store");
            Ok(fetched)
        }
        _ => Err(DrError::NotFound(format!("artifact {}", location))),
    }
}

/// Decrypt (if needed) one component inside an extracted artifact and check
/// its plaintext against the manifest. Returns the plaintext path.
pub(crate) fn open_component(ctx: &Context, manifest: &Manifest, dir: &Path, kind: ComponentKind) -> Result<PathBuf> {
    let entry = manifest
        .component(kind)
        .ok_or_else(|| DrError::NotFound(format!("component {} in backup {}", kind.as_str(), manifest.backup_id)))?;
    let stored = dir.join(&entry.file);
    let plain = dir.join(kind.file_name());
    if entry.encrypted {
        ctx.cipher.decrypt_file(&stored, &plain, Purpose::Backup)?;
    }
    ctx.verifier.verify_file(&plain, manifest.checksum_for(kind)?)?;
    Ok(plain)
}

pub struct RestoreOrchestrator {
    ctx: Context,
    backup: BackupConfig,
    config: RestoreConfig,
    restore_points: RestorePointStore,
}

impl RestoreOrchestrator {
    pub fn new(ctx: Context, backup: BackupConfig, config: RestoreConfig) -> Self {
        let restore_points = RestorePointStore::new(ctx.clone(), backup.clone());
        Self {
            ctx,
            backup,
            config,
            restore_points,
        }
    }

    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let id = request.backup_id;
        let _op = self.ctx.operation_lock.try_acquire(&format!("restore of backup {}", id))?;
        let _in_use = self.ctx.restores.register(id);
        let start = Instant::now();

        self.ctx.audit.record(
            AuditEvent::new(AuditEventType::RestoreStarted)
                .with_subject(id)
                .with_detail("components", format!("{:?}", request.components.kinds())),
        );
        info!(backup_id = %id, components = ?request.components.kinds(), "Restore started");

        let mut progress = Progress::default();
        let result = self.run(request, &mut progress);
        let result = match result {
            Ok(mut report) => {
                report.duration = start.elapsed();
                let scratch = self.ctx.layout.restore_dir(&id);
                if let Err(e) = fs::remove_dir_all(&scratch) {
                    warn!(backup_id = %id, "Failed to remove restore scratch directory: {}", e);
                }
                Ok(report)
            }
            Err(cause) => Err(self.handle_failure(id, cause, &progress)),
        };

        self.ctx.metrics.restore_finished(result.is_ok());
        match &result {
            Ok(report) => {
                self.ctx.audit.record(
                    AuditEvent::new(AuditEventType::RestoreCompleted)
                        .with_subject(id)
                        .with_detail("snapshot_id", report.snapshot_id)
                        .with_detail("duration_ms", report.duration.as_millis()),
                );
                info!(backup_id = %id, duration_ms = report.duration.as_millis() as u64, "Restore completed");
            }
            Err(e) => {
                self.ctx.audit.record(
                    AuditEvent::new(AuditEventType::RestoreFailed)
                        .with_subject(id)
                        .failed()
                        .with_message(e.to_string()),
                );
            }
        }
        result
    }

    fn run(&self, request: &RestoreRequest, progress: &mut Progress) -> Result<RestoreReport> {
        let id = request.backup_id;
        let timeout = self.config.stage_timeout;

        let mut record = self
            .ctx
            .catalogue
            .backup(&id)
            .ok_or_else(|| DrError::NotFound(format!("backup {}", id)))?;
        if record.status != BackupStatus::Completed {
            return Err(DrError::InvalidState(format!(
                "backup {} is {:?}, only completed backups can be restored",
                id, record.status
            )));
        }
        let expected = record
            .checksum
            .clone()
            .ok_or_else(|| DrError::InvalidState(format!("backup {} has no checksum", id)))?;

        let scratch = self.ctx.layout.restore_dir(&id);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        let artifact = locate_artifact(&self.ctx, &record, &scratch.join("fetch"))?;
        self.ctx.verifier.verify_file(&artifact, &expected)?;

        let base = match (record.kind, record.base_backup_id) {
            (BackupKind::Incremental, Some(base_id)) if request.components.files => {
                Some(self.locate_base(base_id, &scratch)?)
            }
            (BackupKind::Incremental, None) => {
                return Err(DrError::InvalidState(format!("incremental backup {} has no base", id)));
            }
            _ => None,
        };

        let snapshot = self.restore_points.capture(id, &request.components.kinds(), timeout)?;
        progress.snapshot = Some(snapshot.clone());

        let extracted = scratch.join("artifact");
        unpack_artifact(&artifact, &extracted, record.compressed)?;
        let manifest = Manifest::read(&extracted)?;
        if manifest.backup_id != id {
            return Err(DrError::InvalidState(format!(
                "artifact manifest belongs to backup {}",
                manifest.backup_id
            )));
        }

        let mut plaintexts = Vec::new();
        for kind in request.components.kinds() {
            if manifest.component(kind).is_none() {
                warn!(backup_id = %id, component = kind.as_str(), "Requested component not in backup; skipping");
                continue;
            }
            plaintexts.push((kind, open_component(&self.ctx, &manifest, &extracted, kind)?));
        }

        let mut base_files = None;
        if let Some((_, base, base_artifact)) = &base {
            let dir = scratch.join("base");
            unpack_artifact(base_artifact, &dir, base.compressed)?;
            let base_manifest = Manifest::read(&dir)?;
            if base_manifest.backup_id != base.id {
                return Err(DrError::InvalidState(format!(
                    "base artifact manifest belongs to backup {}",
                    base_manifest.backup_id
                )));
            }
            if base_manifest.component(ComponentKind::Files).is_some() {
                base_files = Some(open_component(&self.ctx, &base_manifest, &dir, ComponentKind::Files)?);
            }
        }

        progress.destructive = true;
        let primary = self.ctx.primary();
        let mut terminated = 0;
        let mut applied = Vec::new();
        for (kind, plain) in &plaintexts {
            match kind {
                ComponentKind::Database => {
                    let db = self
                        .backup
                        .database
                        .as_ref()
                        .ok_or_else(|| DrError::Config("no database target configured".into()))?;
                    terminated = self.ctx.admin.with(|admin| admin.terminate_connections(&primary))?;
                    info!(backup_id = %id, %primary, terminated, "Terminated client connections");
                    self.ctx.runner.run(&db.apply_invocation("applying", plain), timeout)?;
                }
                ComponentKind::Files => {
                    if let (Some(base_plain), Some((_, base, _))) = (&base_files, &base) {
                        untar(base_plain, &self.config.target_root)?;
                        info!(backup_id = %id, base_backup_id = %base.id, "Base file store applied");
                    }
                    untar(plain, &self.config.target_root)?;
                }
                ComponentKind::Config => untar(plain, &self.config.target_root)?,
            }
            applied.push(*kind);
            info!(backup_id = %id, component = kind.as_str(), "Component applied");
        }

        let mut verification = Vec::new();
        for sql in &self.config.verification_queries {
            let value = self.ctx.admin.with(|admin| admin.verify_query(sql))?;
            verification.push((sql.clone(), value));
        }

        record.restored_count += 1;
        self.ctx.catalogue.update_backup(&record)?;

        Ok(RestoreReport {
            backup_id: id,
            base_backup_id: base.as_ref().map(|(_, b, _)| b.id),
            snapshot_id: snapshot.id,
            applied,
            connections_terminated: terminated,
            verification,
            duration: Duration::ZERO,
        })
    }

    /// Find, protect and verify the full backup an incremental builds on.
    fn locate_base(&self, base_id: Uuid, scratch: &Path) -> Result<(RestoreGuard, BackupRecord, PathBuf)> {
        let base = self
            .ctx
            .catalogue
            .backup(&base_id)
            .filter(|b| b.status == BackupStatus::Completed)
            .ok_or_else(|| DrError::NotFound(format!("completed base backup {}", base_id)))?;
        let guard = self.ctx.restores.register(base_id);
        let checksum = base
            .checksum
            .clone()
            .ok_or_else(|| DrError::InvalidState(format!("backup {} has no checksum", base_id)))?;
        let artifact = locate_artifact(&self.ctx, &base, &scratch.join("fetch-base"))?;
        self.ctx.verifier.verify_file(&artifact, &checksum)?;
        Ok((guard, base, artifact))
    }

    /// Roll back if anything destructive ran, then produce the error to raise.
    fn handle_failure(&self, id: Uuid, cause: DrError, progress: &Progress) -> DrError {
        error!(backup_id = %id, "Restore failed: {}", cause);
        if !progress.destructive {
            info!(backup_id = %id, "Live store untouched; nothing to roll back");
            return cause;
        }
        let Some(snapshot) = &progress.snapshot else {
            return cause;
        };

        warn!(backup_id = %id, snapshot_id = %snapshot.id, "Attempting rollback to restore point");
        let outcome = self
            .restore_points
            .rollback(snapshot, &self.config.target_root, self.config.stage_timeout);
        let mut event = AuditEvent::new(AuditEventType::RollbackAttempted)
            .with_subject(id)
            .with_detail("snapshot_id", snapshot.id)
            .with_detail("cause", &cause);
        if let Err(e) = &outcome {
            event = event.failed().with_message(e.to_string());
        }
        self.ctx.audit.record(event);

        match outcome {
            Ok(()) => cause,
            Err(e) => {
                error!(backup_id = %id, "Rollback incomplete: {}", e);
                DrError::RollbackIncomplete {
                    cause: cause.to_string(),
                    detail: e.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    snapshot: Option<Snapshot>,
    destructive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupExecutor, RetentionManager, RetentionPolicy};
    use crate::catalogue::{BackupKind, BackupLevel};
    use crate::process::ScriptedOutcome;
    use crate::testing::Fixture;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Setup {
        _dir: TempDir,
        fx: Fixture,
        backup: BackupConfig,
        settings: PathBuf,
    }

    fn setup() -> Setup {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(&dir.path().join("root")).unwrap();
        let settings = dir.path().join("settings");
        fs::create_dir_all(&settings).unwrap();
        fs::write(settings.join("app.toml"), b"version = 1").unwrap();
        let backup = BackupConfig::default().with_config_path(&settings);
        Setup {
            _dir: dir,
            fx,
            backup,
            settings,
        }
    }

    fn take_backup(s: &Setup) -> BackupRecord {
        s.fx.runner.once("pg_dump", ScriptedOutcome::stdout(b"backup-dump".to_vec()));
        let retention = Arc::new(RetentionManager::new(s.fx.ctx.clone(), RetentionPolicy::default()));
        BackupExecutor::new(s.fx.ctx.clone(), s.backup.clone(), retention)
            .execute(BackupKind::Full, BackupLevel::Daily)
            .unwrap()
    }

    fn orchestrator(s: &Setup) -> RestoreOrchestrator {
        RestoreOrchestrator::new(s.fx.ctx.clone(), s.backup.clone(), RestoreConfig::default())
    }

    #[test]
    fn test_restore_applies_components_in_order() {
        let s = setup();
        let record = take_backup(&s);
        fs::write(s.settings.join("app.toml"), b"version = 2").unwrap();
        s.fx.runner.on("pg_dump", ScriptedOutcome::stdout(b"live-dump".to_vec()));

        let report = orchestrator(&s).restore(&RestoreRequest::new(record.id)).unwrap();

        assert_eq!(report.applied, vec![ComponentKind::Database, ComponentKind::Config]);
        assert_eq!(fs::read(s.settings.join("app.toml")).unwrap(), b"version = 1");
        assert_eq!(s.fx.runner.stdin_payloads("psql"), vec![b"backup-dump".to_vec()]);
        assert_eq!(s.fx.ctx.catalogue.backup(&record.id).unwrap().restored_count, 1);
        assert!(s.fx.ctx.catalogue.snapshot(&report.snapshot_id).is_some());

        let log = s.fx.cluster.command_log();
        let terminate = log.iter().position(|c| c.starts_with("terminate:")).unwrap();
        let query = log.iter().position(|c| c.starts_with("query:")).unwrap();
        assert!(terminate < query);
        assert!(s.fx.ctx.operation_lock.holder().is_none());
        assert!(!s.fx.ctx.restores.contains(&record.id));
    }

    #[test]
    fn test_altered_checksum_leaves_live_store_untouched() {
        let s = setup();
        let record = take_backup(&s);
        let mut tampered = record.clone();
        tampered.checksum = Some("00".repeat(32));
        s.fx.ctx.catalogue.update_backup(&tampered).unwrap();
        fs::write(s.settings.join("app.toml"), b"version = 2").unwrap();

        let err = orchestrator(&s).restore(&RestoreRequest::new(record.id)).unwrap_err();

        assert!(matches!(err, DrError::ChecksumMismatch { .. }));
        assert_eq!(fs::read(s.settings.join("app.toml")).unwrap(), b"version = 2");
        assert_eq!(s.fx.runner.calls_to("psql"), 0);
        assert!(s.fx.cluster.command_log().iter().all(|c| !c.starts_with("terminate:")));
        assert!(s.fx.ctx.catalogue.snapshots().is_empty());
    }

    #[test]
    fn test_corrupt_component_is_fatal_before_apply() {
        let s = setup();
        let record = take_backup(&s);
        // Swap in a key set that cannot open the artifact's components.
        let other = crate::crypto::KeyManager::new(
            zeroize::Zeroizing::new([1u8; crate::crypto::KEY_SIZE]),
            crate::crypto::KdfParams::fast(),
        )
        .unwrap();
        let mut ctx = s.fx.ctx.clone();
        ctx.cipher = crate::crypto::FieldCipher::new(Arc::new(other));
        let orchestrator = RestoreOrchestrator::new(ctx, s.backup.clone(), RestoreConfig::default());

        let err = orchestrator.restore(&RestoreRequest::new(record.id)).unwrap_err();
        assert!(matches!(err, DrError::Decryption(_)));
        assert_eq!(s.fx.runner.calls_to("psql"), 0);
    }

    #[test]
    fn test_failed_apply_rolls_back() {
        let s = setup();
        let record = take_backup(&s);
        fs::write(s.settings.join("app.toml"), b"version = 2").unwrap();
        s.fx.runner.on("pg_dump", ScriptedOutcome::stdout(b"live-dump".to_vec()));
        s.fx.cluster.fail_query("SELECT 1");

        let err = orchestrator(&s).restore(&RestoreRequest::new(record.id)).unwrap_err();

        assert!(matches!(err, DrError::InvalidState(_)));
        assert_eq!(fs::read(s.settings.join("app.toml")).unwrap(), b"version = 2");
        let applied = s.fx.runner.stdin_payloads("psql");
        assert_eq!(applied, vec![b"backup-dump".to_vec(), b"live-dump".to_vec()]);
        assert_eq!(s.fx.ctx.audit.of_type(AuditEventType::RollbackAttempted).len(), 1);
        assert_eq!(s.fx.ctx.catalogue.backup(&record.id).unwrap().restored_count, 0);
    }

    #[test]
    fn test_failed_rollback_is_reported() {
        let s = setup();
        let record = take_backup(&s);
        s.fx.runner.on("psql", ScriptedOutcome::fail(3, "relation exists"));

        let err = orchestrator(&s).restore(&RestoreRequest::new(record.id)).unwrap_err();
        assert!(matches!(err, DrError::RollbackIncomplete { .. }));
    }

    #[test]
    fn test_selective_restore_and_lock() {
        let s = setup();
        let record = take_backup(&s);
        let held = s.fx.ctx.operation_lock.try_acquire("failover").unwrap();
        let request = RestoreRequest::new(record.id).with_components(ComponentSelection::only(ComponentKind::Config));
        assert!(matches!(
            orchestrator(&s).restore(&request),
            Err(DrError::OperationInProgress(_))
        ));
        drop(held);

        let report = orchestrator(&s).restore(&request).unwrap();
        assert_eq!(report.applied, vec![ComponentKind::Config]);
        assert_eq!(s.fx.runner.calls_to("psql"), 0);
    }
}
