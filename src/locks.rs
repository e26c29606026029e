//! Exclusion Guards
//!
//! Per-level backup exclusion, the global restore/failover lock, and the
//! registry of backups referenced by running restores.

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::catalogue::BackupLevel;
use crate::error::{DrError, Result};

/// One active backup per level.
#[derive(Debug, Clone, Default)]
pub struct LevelLocks {
    busy: Arc<Mutex<HashSet<BackupLevel>>>,
}

impl LevelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `level`, or `None` if a job for it is already active.
    pub fn try_acquire(&self, level: BackupLevel) -> Option<LevelGuard> {
        if !self.busy.lock().insert(level) {
            return None;
        }
        debug!(%level, "Level lock acquired");
        Some(LevelGuard {
            locks: self.clone(),
            level,
        })
    }

    pub fn is_busy(&self, level: BackupLevel) -> bool {
        self.busy.lock().contains(&level)
    }
}

/// Releases its level on drop.
#[derive(Debug)]
pub struct LevelGuard {
    locks: LevelLocks,
    level: BackupLevel,
}

impl LevelGuard {
    pub fn level(&self) -> BackupLevel {
        self.level
    }
}

impl Drop for LevelGuard {
    fn drop(&mut self) {
        self.locks.busy.lock().remove(&self.level);
    }
}

/// Exclusive lock shared by restore and failover.
#[derive(Debug, Clone, Default)]
pub struct OperationLock {
    holder: Arc<Mutex<Option<String>>>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, operation: &str) -> Result<OperationGuard> {
        let mut holder = self.holder.lock();
        if let Some(current) = holder.as_ref() {
            return Err(DrError::OperationInProgress(current.clone()));
        }
        *holder = Some(operation.to_string());
        Ok(OperationGuard { lock: self.clone() })
    }

    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }
}

#[derive(Debug)]
pub struct OperationGuard {
    lock: OperationLock,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        *self.lock.holder.lock() = None;
    }
}

/// Backups that running restores and drills depend on; retention must skip
/// them. Each backup id is counted, so overlapping holders of one backup
/// keep it protected until the last one finishes.
#[derive(Debug, Clone, Default)]
pub struct RestoreRegistry {
    active: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl RestoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backup_id: Uuid) -> RestoreGuard {
        *self.active.lock().entry(backup_id).or_insert(0) += 1;
        RestoreGuard {
            registry: self.clone(),
            backup_id,
        }
    }

    pub fn contains(&self, backup_id: &Uuid) -> bool {
        self.active.lock().contains_key(backup_id)
    }

    /// Number of live guards for `backup_id`.
    pub fn holders(&self, backup_id: &Uuid) -> usize {
        self.active.lock().get(backup_id).copied().unwrap_or(0)
    }

    /// Run `f` only if no restore holds `backup_id`, blocking new
    /// registrations while it runs.
    pub fn unless_active<R>(&self, backup_id: &Uuid, f: impl FnOnce() -> R) -> Option<R> {
        let active = self.active.lock();
        if active.contains_key(backup_id) {
            return None;
        }
        Some(f())
    }
}

#[derive(Debug)]
pub struct RestoreGuard {
    registry: RestoreRegistry,
    backup_id: Uuid,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let mut active = self.registry.active.lock();
        if let Some(count) = active.get_mut(&self.backup_id) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.backup_id);
            }
        }
    }
}
