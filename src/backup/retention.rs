//! Retention Manager
//!
//! Prunes expired backups per level. A backup referenced by a running
//! restore is never deleted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType};
use crate::catalogue::{BackupLevel, BackupRecord};
use crate::context::Context;
use crate::error::Result;

/// Retention window per level, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub daily_days: u32,
    pub weekly_days: u32,
    pub monthly_days: u32,
    pub test_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_days: 7,
            weekly_days: 28,
            monthly_days: 365,
            test_days: 1,
        }
    }
}

impl RetentionPolicy {
    pub fn window(&self, level: BackupLevel) -> Duration {
        let days = match level {
            BackupLevel::Daily => self.daily_days,
            BackupLevel::Weekly => self.weekly_days,
            BackupLevel::Monthly => self.monthly_days,
            BackupLevel::Test => self.test_days,
        };
        Duration::days(i64::from(days))
    }

    pub fn with_window(mut self, level: BackupLevel, days: u32) -> Self {
        match level {
            BackupLevel::Daily => self.daily_days = days,
            BackupLevel::Weekly => self.weekly_days = days,
            BackupLevel::Monthly => self.monthly_days = days,
            BackupLevel::Test => self.test_days = days,
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<Uuid>,
    /// Expired but kept: in use by a restore, or still running.
    pub protected: Vec<Uuid>,
    pub freed_bytes: u64,
}

pub struct RetentionManager {
    ctx: Context,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(ctx: Context, policy: RetentionPolicy) -> Self {
        Self { ctx, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn prune(&self, level: BackupLevel) -> Result<PruneReport> {
        self.prune_at(level, Utc::now())
    }

    /// Delete every backup of `level` that started strictly before
    /// `now - window`.
    pub fn prune_at(&self, level: BackupLevel, now: DateTime<Utc>) -> Result<PruneReport> {
        let cutoff = now - self.policy.window(level);
        let mut report = PruneReport::default();

        for record in self.ctx.catalogue.backups(Some(level)) {
            if record.started_at >= cutoff {
                continue;
            }
            if !record.is_terminal() {
                debug!(backup_id = %record.id, "Skipping expired backup that is still running");
                report.protected.push(record.id);
                continue;
            }
            match self.ctx.restores.unless_active(&record.id, || self.remove(&record)) {
                Some(result) => {
                    result?;
                    report.freed_bytes += record.size_bytes;
                    report.deleted.push(record.id);
                }
                None => {
                    info!(backup_id = %record.id, "Expired backup is in use by a restore; keeping it");
                    report.protected.push(record.id);
                }
            }
        }

        if !report.deleted.is_empty() || !report.protected.is_empty() {
            info!(
                %level,
                deleted = report.deleted.len(),
                protected = report.protected.len(),
                freed_bytes = report.freed_bytes,
                "Retention prune finished"
            );
        }
        self.ctx.audit.record(
            AuditEvent::new(AuditEventType::RetentionPrune)
                .with_subject(level)
                .with_detail("deleted", report.deleted.len())
                .with_detail("protected", report.protected.len())
                .with_detail("freed_bytes", report.freed_bytes),
        );
        Ok(report)
    }

    fn remove(&self, record: &BackupRecord) -> Result<()> {
        if let Some(location) = &record.location {
            remove_path(Path::new(location))?;
        }
        if let Some(work_dir) = &record.work_dir {
            remove_path(Path::new(work_dir))?;
        }
        if let (Some(remote), Some(location)) = (&self.ctx.remote, &record.remote_location) {
            if let Err(e) = remote.delete(location) {
                warn!(backup_id = %record.id, %location, "Failed to delete remote copy: {}", e);
            }
        }
        self.ctx.catalogue.delete_backup(&record.id)?;
        debug!(backup_id = %record.id, "Pruned backup");
        Ok(())
    }

    /// Remove a finished job's working directory.
    pub fn cleanup_workdir(&self, work_dir: &Path) -> Result<()> {
        remove_path(work_dir)
    }
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::BackupKind;
    use crate::testing::Fixture;
    use tempfile::tempdir;

    fn completed(fx: &Fixture, level: BackupLevel, age: Duration, now: DateTime<Utc>) -> BackupRecord {
        let mut record = BackupRecord::new(BackupKind::Full, level);
        record.started_at = now - age;
        let artifact = fx.ctx.layout.artifact_dir(level).join(format!("{}.tar.gz", record.id));
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, b"artifact").unwrap();
        record
            .complete(artifact.display().to_string(), "sum".into(), 8)
            .unwrap();
        fx.ctx.catalogue.insert_backup(&record).unwrap();
        record
    }

    #[test]
    fn test_prune_strictly_older_than_window() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let manager = RetentionManager::new(fx.ctx.clone(), RetentionPolicy::default());
        let now = Utc::now();

        let expired = completed(&fx, BackupLevel::Daily, Duration::days(8), now);
        let boundary = completed(&fx, BackupLevel::Daily, Duration::days(7), now);
        let fresh = completed(&fx, BackupLevel::Daily, Duration::days(1), now);
        let other_level = completed(&fx, BackupLevel::Weekly, Duration::days(8), now);

        let report = manager.prune_at(BackupLevel::Daily, now).unwrap();
        assert_eq!(report.deleted, vec![expired.id]);
        assert_eq!(report.freed_bytes, 8);
        assert!(fx.ctx.catalogue.backup(&expired.id).is_none());
        assert!(!Path::new(expired.location.as_deref().unwrap()).exists());
        for kept in [&boundary, &fresh, &other_level] {
            assert!(fx.ctx.catalogue.backup(&kept.id).is_some());
        }
    }

    #[test]
    fn test_prune_skips_backup_under_restore() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let manager = RetentionManager::new(fx.ctx.clone(), RetentionPolicy::default());
        let now = Utc::now();
        let record = completed(&fx, BackupLevel::Test, Duration::days(3), now);

        let guard = fx.ctx.restores.register(record.id);
        let report = manager.prune_at(BackupLevel::Test, now).unwrap();
        assert_eq!(report.protected, vec![record.id]);
        assert!(fx.ctx.catalogue.backup(&record.id).is_some());

        drop(guard);
        let report = manager.prune_at(BackupLevel::Test, now).unwrap();
        assert_eq!(report.deleted, vec![record.id]);
    }

    #[test]
    fn test_policy_windows() {
        let policy = RetentionPolicy::default().with_window(BackupLevel::Weekly, 14);
        assert_eq!(policy.window(BackupLevel::Monthly), Duration::days(365));
        assert_eq!(policy.window(BackupLevel::Weekly), Duration::days(14));
    }
}
