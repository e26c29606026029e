//! Audit Recorder
//!
//! Durable history of backup, restore, replication, failover, key-rotation
//! and drill events. Events are appended as JSON lines to `audit.log` and
//! kept in a bounded in-memory buffer for quick inspection.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::error;

use crate::error::Result;

/// Audit event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    BackupSkipped,
    RestoreStarted,
    RestoreCompleted,
    RestoreFailed,
    RollbackAttempted,
    ReplicaLagging,
    ReplicaFailed,
    FailoverStarted,
    FailoverStep,
    FailoverCompleted,
    FailoverFailed,
    KeyRotation,
    RecoveryTest,
    RetentionPrune,
}

/// Audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    /// Id of the backup, restore, failover or key set concerned.
    pub subject: Option<String>,
    pub success: bool,
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            subject: None,
            success: true,
            message: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl ToString) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Audit recorder
pub struct AuditRecorder {
    buffer: RwLock<VecDeque<AuditEvent>>,
    max_size: usize,
    log: Option<Mutex<File>>,
}

impl AuditRecorder {
    /// Memory-only recorder, for tests.
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: RwLock::new(VecDeque::with_capacity(max_size)),
            max_size,
            log: None,
        }
    }

    /// Recorder appending to `path`.
    pub fn open(path: &Path, max_size: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            log: Some(Mutex::new(file)),
            ..Self::new(max_size)
        })
    }

    /// Record an event. Durable write failures are logged, never raised, so
    /// that auditing cannot mask the error being audited.
    pub fn record(&self, event: AuditEvent) {
        if let Some(log) = &self.log {
            let mut line = event.to_json();
            line.push('\n');
            let mut file = log.lock();
            if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                error!("Failed to append audit event {:?}: {}", event.event_type, e);
            }
        }

        let mut buffer = self.buffer.write();
        if buffer.len() >= self.max_size {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    /// Get recent events, newest first
    pub fn recent(&self, count: usize) -> Vec<AuditEvent> {
        let buffer = self.buffer.read();
        buffer.iter().rev().take(count).cloned().collect()
    }

    pub fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        let buffer = self.buffer.read();
        buffer.iter().filter(|e| e.event_type == event_type).cloned().collect()
    }

    /// Get events as JSON
    pub fn export_json(&self) -> String {
        let buffer = self.buffer.read();
        let events: Vec<String> = buffer.iter().map(|e| e.to_json()).collect();
        format!("[{}]", events.join(","))
    }
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new(10000)
    }
}
