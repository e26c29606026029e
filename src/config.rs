//! Orchestrator Configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::admin::{AdminPoolConfig, PsqlAdminConfig};
use crate::backup::{BackupConfig, RetentionPolicy};
use crate::catalogue::BackupLevel;
use crate::crypto::KdfParams;
use crate::error::{DrError, Result};
use crate::failover::FailoverConfig;
use crate::replication::ReplicationConfig;
use crate::restore::RestoreConfig;
use crate::scheduler::{ScheduleConfig, WorkerPoolConfig};

/// Directory layout under the orchestrator root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalogue_dir(&self) -> PathBuf {
        self.root.join("catalogue")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    /// Final artifacts: `backups/{level}/{name}`.
    pub fn artifact_dir(&self, level: BackupLevel) -> PathBuf {
        self.root.join("backups").join(level.as_str())
    }

    /// Intermediate stage output: `work/{level}/{name}`.
    pub fn work_dir(&self, level: BackupLevel, name: &str) -> PathBuf {
        self.root.join("work").join(level.as_str()).join(name)
    }

    pub fn restore_dir(&self, backup_id: &Uuid) -> PathBuf {
        self.root.join("restore").join(backup_id.to_string())
    }

    pub fn restore_points_dir(&self) -> PathBuf {
        self.root.join("restore_points")
    }

    pub fn drill_dir(&self, test_id: &Uuid) -> PathBuf {
        self.root.join("drills").join(test_id.to_string())
    }
}

/// Everything the orchestrator needs besides the master secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub root: PathBuf,
    /// Node currently acting as primary.
    pub primary: String,
    pub backup: BackupConfig,
    /// Mirror completed artifacts into this directory.
    pub remote_dir: Option<PathBuf>,
    pub schedule: ScheduleConfig,
    pub retention: RetentionPolicy,
    pub restore: RestoreConfig,
    pub replication: ReplicationConfig,
    pub failover: FailoverConfig,
    pub admin_pool: AdminPoolConfig,
    /// Cluster nodes for the `psql` admin channel.
    pub psql: PsqlAdminConfig,
    pub workers: WorkerPoolConfig,
    pub kdf: KdfParams,
    pub audit_buffer: usize,
}

impl OrchestratorConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            primary: "primary".to_string(),
            audit_buffer: 10_000,
            ..Default::default()
        }
    }

    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| DrError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| DrError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(DrError::Config("root directory is not set".into()));
        }
        if self.primary.is_empty() {
            return Err(DrError::Config("primary node is not set".into()));
        }
        if self.replication.replicas.iter().any(|r| r == &self.primary) {
            return Err(DrError::Config(format!("{} is listed as both primary and replica", self.primary)));
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.root)
    }

    pub fn with_primary(mut self, primary: impl Into<String>) -> Self {
        self.primary = primary.into();
        self
    }

    pub fn with_backup(mut self, backup: BackupConfig) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_replicas<I, S>(mut self, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replication.replicas = replicas.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_remote_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.remote_dir = Some(dir.into());
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }
}
