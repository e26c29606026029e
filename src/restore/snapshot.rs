//! Restore Points
//!
//! Before a restore overwrites anything, the live data store, file store and
//! configuration are captured under `restore_points/`. Rollback re-applies
//! that capture. It is best-effort: files the restore added are not removed.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::archive::{pack_artifact, tar_paths, unpack_artifact, untar};
use crate::backup::{BackupConfig, ComponentKind};
use crate::catalogue::Snapshot;
use crate::context::Context;
use crate::error::Result;

pub const PRE_RESTORE_KIND: &str = "pre_restore";

pub struct RestorePointStore {
    ctx: Context,
    backup: BackupConfig,
}

impl RestorePointStore {
    pub fn new(ctx: Context, backup: BackupConfig) -> Self {
        Self { ctx, backup }
    }

    fn archive_path(&self, id: &Uuid) -> PathBuf {
        self.ctx.layout.restore_points_dir().join(format!("{}.tar", id))
    }

    /// Capture the live state of `components` and record the snapshot.
    pub fn capture(&self, backup_id: Uuid, components: &[ComponentKind], timeout: Duration) -> Result<Snapshot> {
        let id = Uuid::new_v4();
        let staging = self.ctx.layout.restore_points_dir().join(id.to_string());
        fs::create_dir_all(&staging)?;

        let mut captured = Vec::new();
        for kind in components {
            let out = staging.join(kind.file_name());
            match kind {
                ComponentKind::Database => {
                    let Some(db) = &self.backup.database else { continue };
                    self.ctx.runner.run(&db.dump_invocation("restore_point", &out), timeout)?;
                }
                ComponentKind::Files | ComponentKind::Config => {
                    let sources: Vec<PathBuf> = self
                        .sources(*kind)
                        .iter()
                        .filter(|p| p.exists())
                        .cloned()
                        .collect();
                    if sources.is_empty() {
                        continue;
                    }
                    tar_paths(&out, &sources, None)?;
                }
            }
            captured.push(*kind);
        }

        let archive = self.archive_path(&id);
        pack_artifact(&staging, &archive, false)?;
        fs::remove_dir_all(&staging)?;
        let checksum = self.ctx.verifier.hash_file(&archive)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("reason".to_string(), format!("before restore of backup {}", backup_id));
        metadata.insert("primary".to_string(), self.ctx.primary());
        let snapshot = Snapshot {
            id,
            kind: PRE_RESTORE_KIND.to_string(),
            backup_id,
            components: captured.iter().map(|c| c.as_str().to_string()).collect(),
            metadata,
            location: archive.display().to_string(),
            checksum,
            created_at: Utc::now(),
        };
        self.ctx.catalogue.insert_snapshot(&snapshot)?;
        info!(snapshot_id = %id, %backup_id, components = ?snapshot.components, "Restore point captured");
        Ok(snapshot)
    }

    /// Re-apply a restore point over the live store.
    pub fn rollback(&self, snapshot: &Snapshot, target_root: &Path, timeout: Duration) -> Result<()> {
        let archive = Path::new(&snapshot.location);
        self.ctx.verifier.verify_file(archive, &snapshot.checksum)?;

        let scratch = self.ctx.layout.restore_points_dir().join(format!("{}.rollback", snapshot.id));
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        unpack_artifact(archive, &scratch, false)?;

        for name in &snapshot.components {
            let kind = match name.as_str() {
                "database" => ComponentKind::Database,
                "files" => ComponentKind::Files,
                "config" => ComponentKind::Config,
                other => {
                    warn!(snapshot_id = %snapshot.id, component = other, "Unknown component in restore point");
                    continue;
                }
            };
            let file = scratch.join(kind.file_name());
            match kind {
                ComponentKind::Database => {
                    if let Some(db) = &self.backup.database {
                        self.ctx.runner.run(&db.apply_invocation("rollback", &file), timeout)?;
                    }
                }
                ComponentKind::Files | ComponentKind::Config => untar(&file, target_root)?,
            }
        }
        fs::remove_dir_all(&scratch)?;
        info!(snapshot_id = %snapshot.id, "Rolled back to restore point");
        Ok(())
    }

    fn sources(&self, kind: ComponentKind) -> &[PathBuf] {
        match kind {
            ComponentKind::Files => &self.backup.file_store_dirs,
            ComponentKind::Config => &self.backup.config_paths,
            ComponentKind::Database => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ScriptedOutcome;
    use crate::testing::Fixture;
    use tempfile::tempdir;

    #[test]
    fn test_capture_and_rollback() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(&dir.path().join("root")).unwrap();
        let settings = dir.path().join("settings");
        fs::create_dir_all(&settings).unwrap();
        fs::write(settings.join("app.toml"), b"mode = 'live'").unwrap();
        fx.runner.on("pg_dump", ScriptedOutcome::stdout(b"live-dump".to_vec()));

        let backup = BackupConfig::default().with_config_path(&settings);
        let store = RestorePointStore::new(fx.ctx.clone(), backup);
        let snapshot = store
            .capture(Uuid::new_v4(), &[ComponentKind::Database, ComponentKind::Config], Duration::from_secs(5))
            .unwrap();
        assert_eq!(snapshot.components, vec!["database", "config"]);
        assert!(fx.ctx.catalogue.snapshot(&snapshot.id).is_some());

        fs::write(settings.join("app.toml"), b"mode = 'broken'").unwrap();
        store.rollback(&snapshot, Path::new("/"), Duration::from_secs(5)).unwrap();

        assert_eq!(fs::read(settings.join("app.toml")).unwrap(), b"mode = 'live'");
        assert_eq!(fx.runner.stdin_payloads("psql"), vec![b"live-dump".to_vec()]);
    }

    #[test]
    fn test_rollback_refuses_tampered_restore_point() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let store = RestorePointStore::new(fx.ctx.clone(), BackupConfig::default());
        let snapshot = store
            .capture(Uuid::new_v4(), &[ComponentKind::Database], Duration::from_secs(5))
            .unwrap();
        fs::write(&snapshot.location, b"garbage").unwrap();
        assert!(store.rollback(&snapshot, dir.path(), Duration::from_secs(5)).is_err());
        assert_eq!(fx.runner.calls_to("psql"), 0);
    }
}
