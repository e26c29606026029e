//! Recovery Drills
//!
//! Proves a backup is restorable without touching the live store: verify,
//! extract, decrypt and re-check every component in a scratch directory,
//! then record the outcome as an immutable recovery-test row.

use chrono::Utc;
use serde_json::json;
use std::fs;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use super::{locate_artifact, open_component};
use crate::audit::{AuditEvent, AuditEventType};
use crate::backup::archive::unpack_artifact;
use crate::backup::Manifest;
use crate::catalogue::{BackupStatus, RecoveryTest};
use crate::context::Context;
use crate::error::{DrError, Result};

pub const DRILL_KIND: &str = "restore_drill";

pub struct RecoveryTester {
    ctx: Context,
}

impl RecoveryTester {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Run a drill against `backup_id`. Problems found are recorded as issues
    /// on the returned row; only an unknown backup is an error.
    pub fn run_drill(&self, backup_id: Uuid) -> Result<RecoveryTest> {
        let record = self
            .ctx
            .catalogue
            .backup(&backup_id)
            .ok_or_else(|| DrError::NotFound(format!("backup {}", backup_id)))?;
        let _in_use = self.ctx.restores.register(backup_id);

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let scratch = self.ctx.layout.drill_dir(&id);
        let mut issues = Vec::new();
        let mut integrity_verified = false;
        let mut components_checked = 0usize;
        let mut plaintext_bytes = 0u64;

        let verify_start = Instant::now();
        let artifact = match (&record.status, &record.checksum) {
            (BackupStatus::Completed, Some(checksum)) => {
                match locate_artifact(&self.ctx, &record, &scratch.join("fetch")) {
                    Ok(artifact) => match self.ctx.verifier.verify_file(&artifact, checksum) {
                        Ok(()) => {
                            integrity_verified = true;
                            Some(artifact)
                        }
                        Err(e) => {
                            issues.push(format!("artifact integrity: {}", e));
                            None
                        }
                    },
                    Err(e) => {
                        issues.push(format!("artifact unavailable: {}", e));
                        None
                    }
                }
            }
            (status, _) => {
                issues.push(format!("backup is {:?}, not completed", status));
                None
            }
        };
        let verify_ms = verify_start.elapsed().as_millis() as u64;

        let extract_start = Instant::now();
        if let Some(artifact) = artifact {
            let extracted = scratch.join("artifact");
            let manifest = unpack_artifact(&artifact, &extracted, record.compressed)
                .and_then(|()| Manifest::read(&extracted));
            match manifest {
                Ok(manifest) => {
                    for entry in &manifest.components {
                        match open_component(&self.ctx, &manifest, &extracted, entry.kind) {
                            Ok(plain) => {
                                components_checked += 1;
                                plaintext_bytes += fs::metadata(&plain).map(|m| m.len()).unwrap_or(0);
                            }
                            Err(e) => issues.push(format!("component {}: {}", entry.kind.as_str(), e)),
                        }
                    }
                }
                Err(e) => issues.push(format!("extraction: {}", e)),
            }
        }
        let extract_ms = extract_start.elapsed().as_millis() as u64;

        if scratch.exists() {
            if let Err(e) = fs::remove_dir_all(&scratch) {
                warn!(test_id = %id, "Failed to remove drill directory: {}", e);
            }
        }

        let test = RecoveryTest {
            id,
            backup_id,
            test_kind: DRILL_KIND.to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: issues.is_empty(),
            issues,
            integrity_verified,
            metrics: json!({
                "components_checked": components_checked,
                "plaintext_bytes": plaintext_bytes,
                "verify_ms": verify_ms,
                "extract_ms": extract_ms,
                "artifact_bytes": record.size_bytes,
            }),
        };
        self.ctx.catalogue.record_recovery_test(&test)?;

        let mut event = AuditEvent::new(AuditEventType::RecoveryTest)
            .with_subject(backup_id)
            .with_detail("test_id", id)
            .with_detail("duration_ms", test.duration_ms);
        if !test.success {
            event = event.failed().with_message(test.issues.join("; "));
        }
        self.ctx.audit.record(event);

        if test.success {
            info!(test_id = %id, %backup_id, duration_ms = test.duration_ms, "Recovery drill passed");
        } else {
            warn!(test_id = %id, %backup_id, issues = ?test.issues, "Recovery drill found problems");
        }
        Ok(test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupConfig, BackupExecutor, RetentionManager, RetentionPolicy};
    use crate::catalogue::{BackupKind, BackupLevel};
    use crate::process::ScriptedOutcome;
    use crate::testing::Fixture;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn backup(fx: &Fixture) -> crate::catalogue::BackupRecord {
        fx.runner.on("pg_dump", ScriptedOutcome::stdout(vec![5u8; 1000]));
        let retention = Arc::new(RetentionManager::new(fx.ctx.clone(), RetentionPolicy::default()));
        BackupExecutor::new(fx.ctx.clone(), BackupConfig::default(), retention)
            .execute(BackupKind::Full, BackupLevel::Test)
            .unwrap()
    }

    #[test]
    fn test_drill_passes_on_good_backup() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let record = backup(&fx);

        let test = RecoveryTester::new(fx.ctx.clone()).run_drill(record.id).unwrap();
        assert!(test.success, "issues: {:?}", test.issues);
        assert!(test.integrity_verified);
        assert_eq!(test.metrics["components_checked"], 1);
        assert_eq!(test.metrics["plaintext_bytes"], 1000);
        assert_eq!(fx.ctx.catalogue.recovery_tests().len(), 1);
        assert_eq!(fx.runner.calls_to("psql"), 0);
        assert!(!fx.ctx.layout.drill_dir(&test.id).exists());
    }

    #[test]
    fn test_drill_records_corruption() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let record = backup(&fx);
        fs::write(record.location.as_deref().unwrap(), b"bitrot").unwrap();

        let test = RecoveryTester::new(fx.ctx.clone()).run_drill(record.id).unwrap();
        assert!(!test.success);
        assert!(!test.integrity_verified);
        assert!(test.issues[0].contains("integrity"));
    }

    #[test]
    fn test_drill_unknown_backup() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let err = RecoveryTester::new(fx.ctx.clone()).run_drill(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DrError::NotFound(_)));
    }
}
