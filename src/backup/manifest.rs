//! Backup Manifest
//!
//! `manifest.json` travels inside every artifact and lists the participating
//! components with a plaintext checksum for each.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::catalogue::{BackupKind, BackupLevel};
use crate::error::{DrError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Suffix appended to a component file once encrypted.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Components a backup can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Database,
    Files,
    Config,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 3] = [ComponentKind::Database, ComponentKind::Files, ComponentKind::Config];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Database => "database",
            ComponentKind::Files => "files",
            ComponentKind::Config => "config",
        }
    }

    /// Plaintext file name inside the working directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            ComponentKind::Database => "database.dump",
            ComponentKind::Files => "files.tar",
            ComponentKind::Config => "config.tar",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentEntry {
    pub kind: ComponentKind,
    /// File as stored in the artifact; carries [`ENCRYPTED_SUFFIX`] when encrypted.
    pub file: String,
    pub size_bytes: u64,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub backup_id: Uuid,
    pub level: BackupLevel,
    pub kind: BackupKind,
    pub timestamp: DateTime<Utc>,
    pub components: Vec<ComponentEntry>,
    /// Plaintext component file name to SHA-256.
    pub checksums: BTreeMap<String, String>,
    #[serde(default)]
    pub base_backup_id: Option<Uuid>,
    #[serde(default)]
    pub key_version: Option<u32>,
}

impl Manifest {
    pub fn new(backup_id: Uuid, level: BackupLevel, kind: BackupKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            backup_id,
            level,
            kind,
            timestamp,
            components: Vec::new(),
            checksums: BTreeMap::new(),
            base_backup_id: None,
            key_version: None,
        }
    }

    pub fn component(&self, kind: ComponentKind) -> Option<&ComponentEntry> {
        self.components.iter().find(|c| c.kind == kind)
    }

    pub fn checksum_for(&self, kind: ComponentKind) -> Result<&str> {
        self.checksums
            .get(kind.file_name())
            .map(String::as_str)
            .ok_or_else(|| DrError::InvalidState(format!("manifest has no checksum for {}", kind.as_str())))
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = fs::read(&path)
            .map_err(|e| DrError::InvalidState(format!("artifact has no readable manifest: {}", e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_manifest_wire_names() {
        let mut manifest = Manifest::new(Uuid::nil(), BackupLevel::Daily, BackupKind::Full, Utc::now());
        manifest.checksums.insert("database.dump".into(), "abc".into());
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"backupId\""));
        assert!(json.contains("\"checksums\""));
        assert_eq!(manifest.checksum_for(ComponentKind::Database).unwrap(), "abc");
        assert!(manifest.checksum_for(ComponentKind::Files).is_err());
    }

    #[test]
    fn test_write_read() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new(Uuid::new_v4(), BackupLevel::Weekly, BackupKind::Full, Utc::now());
        manifest.components.push(ComponentEntry {
            kind: ComponentKind::Config,
            file: "config.tar.enc".into(),
            size_bytes: 10,
            encrypted: true,
        });
        manifest.write(dir.path()).unwrap();
        let loaded = Manifest::read(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.component(ComponentKind::Config).unwrap().encrypted);
    }
}
