//! Catalogue Rows
//!
//! Backup history, recovery drills, replica status, failover history and
//! restore-point snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::admin::PositionMarkers;
use crate::error::{DrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        })
    }
}

impl FromStr for BackupKind {
    type Err = DrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(DrError::Config(format!("unknown backup kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupLevel {
    Daily,
    Weekly,
    Monthly,
    Test,
}

impl BackupLevel {
    pub const ALL: [BackupLevel; 4] = [
        BackupLevel::Daily,
        BackupLevel::Weekly,
        BackupLevel::Monthly,
        BackupLevel::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupLevel::Daily => "daily",
            BackupLevel::Weekly => "weekly",
            BackupLevel::Monthly => "monthly",
            BackupLevel::Test => "test",
        }
    }
}

impl fmt::Display for BackupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupLevel {
    type Err = DrError;

    fn from_str(s: &str) -> Result<Self> {
        BackupLevel::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| DrError::Config(format!("unknown backup level: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
}

/// Stages a backup job moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStage {
    Init,
    Dumping,
    Archiving,
    Checksumming,
    Encrypting,
    Compressing,
    Uploading,
    Complete,
    Failed,
}

impl BackupStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStage::Init => "init",
            BackupStage::Dumping => "dumping",
            BackupStage::Archiving => "archiving",
            BackupStage::Checksumming => "checksumming",
            BackupStage::Encrypting => "encrypting",
            BackupStage::Compressing => "compressing",
            BackupStage::Uploading => "uploading",
            BackupStage::Complete => "complete",
            BackupStage::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backup job's history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub kind: BackupKind,
    pub level: BackupLevel,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub location: Option<String>,
    pub checksum: Option<String>,
    pub encrypted: bool,
    pub compressed: bool,
    pub status: BackupStatus,
    pub stage: BackupStage,
    pub error: Option<String>,
    pub restored_count: u32,
    pub base_backup_id: Option<Uuid>,
    pub remote_location: Option<String>,
    pub key_version: Option<u32>,
    pub components: Vec<String>,
    /// Working directory; kept after a failure for inspection.
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl BackupRecord {
    pub fn new(kind: BackupKind, level: BackupLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            level,
            started_at: Utc::now(),
            finished_at: None,
            size_bytes: 0,
            location: None,
            checksum: None,
            encrypted: false,
            compressed: false,
            status: BackupStatus::InProgress,
            stage: BackupStage::Init,
            error: None,
            restored_count: 0,
            base_backup_id: None,
            remote_location: None,
            key_version: None,
            components: Vec::new(),
            work_dir: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != BackupStatus::InProgress
    }

    /// Mark completed. Refuses without a location and checksum.
    pub fn complete(&mut self, location: String, checksum: String, size_bytes: u64) -> Result<()> {
        if self.is_terminal() {
            return Err(DrError::InvalidState(format!("backup {} is already terminal", self.id)));
        }
        if location.is_empty() || checksum.is_empty() {
            return Err(DrError::InvalidState(format!(
                "backup {} cannot complete without location and checksum",
                self.id
            )));
        }
        self.location = Some(location);
        self.checksum = Some(checksum);
        self.size_bytes = size_bytes;
        self.status = BackupStatus::Completed;
        self.stage = BackupStage::Complete;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, message: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(DrError::InvalidState(format!("backup {} is already terminal", self.id)));
        }
        self.status = BackupStatus::Failed;
        self.error = Some(message.to_string());
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// Outcome of one disaster-recovery drill. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryTest {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub test_kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub issues: Vec<String>,
    pub integrity_verified: bool,
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaHealth {
    Active,
    Lagging,
    Failed,
}

/// Latest poll result for one replica, keyed by replica id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub replica_id: String,
    pub status: ReplicaHealth,
    pub lag_bytes: u64,
    pub lag_seconds: f64,
    pub last_sync: Option<DateTime<Utc>>,
    pub markers: PositionMarkers,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverTrigger {
    Manual,
    Automatic,
}

/// One failover attempt. Updated once, at completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub trigger: FailoverTrigger,
    pub reason: String,
    pub old_primary: String,
    pub new_primary: String,
    pub started_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub data_loss_bytes: u64,
    pub affected_services: Vec<String>,
    pub actions: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl FailoverEvent {
    pub fn new(trigger: FailoverTrigger, reason: &str, old_primary: &str, new_primary: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            reason: reason.to_string(),
            old_primary: old_primary.to_string(),
            new_primary: new_primary.to_string(),
            started_at: Utc::now(),
            promoted_at: None,
            completed_at: None,
            data_loss_bytes: 0,
            affected_services: Vec::new(),
            actions: Vec::new(),
            success: false,
            error: None,
        }
    }
}

/// Restore point captured immediately before a restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub kind: String,
    pub backup_id: Uuid,
    pub components: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub location: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}
