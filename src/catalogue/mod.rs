//! Persistent Catalogue
//!
//! Five tables kept in concurrent maps and made durable as append-only
//! JSON-lines logs, one file per table. Opening a catalogue replays the logs;
//! the last entry per key wins and deletes are written as tombstones. A log
//! that has grown past its rewrite threshold is compacted to one entry per
//! live row.

mod records;

pub use records::{
    BackupKind, BackupLevel, BackupRecord, BackupStage, BackupStatus, FailoverEvent,
    FailoverTrigger, RecoveryTest, ReplicaHealth, ReplicaStatus, Snapshot,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::hash::Hash;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DrError, Result};

/// Log entries a table may accumulate before it is rewritten.
pub const DEFAULT_REWRITE_THRESHOLD: usize = 10_000;

/// A row type stored in one catalogue table.
pub trait Row: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug;
    const TABLE: &'static str;

    fn key(&self) -> Self::Key;
}

impl Row for BackupRecord {
    type Key = Uuid;
    const TABLE: &'static str = "backup_history";

    fn key(&self) -> Uuid {
        self.id
    }
}

impl Row for RecoveryTest {
    type Key = Uuid;
    const TABLE: &'static str = "recovery_tests";

    fn key(&self) -> Uuid {
        self.id
    }
}

impl Row for ReplicaStatus {
    type Key = String;
    const TABLE: &'static str = "replica_status";

    fn key(&self) -> String {
        self.replica_id.clone()
    }
}

impl Row for FailoverEvent {
    type Key = Uuid;
    const TABLE: &'static str = "failover_history";

    fn key(&self) -> Uuid {
        self.id
    }
}

impl Row for Snapshot {
    type Key = Uuid;
    const TABLE: &'static str = "restore_points";

    fn key(&self) -> Uuid {
        self.id
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogEntry<R, K> {
    Put { row: R },
    Delete { key: K },
}

struct TableLog {
    path: PathBuf,
    file: File,
    entries: usize,
    rewrite_threshold: usize,
}

impl TableLog {
    /// Compaction is due once the log holds `rewrite_threshold` entries and
    /// at least twice as many entries as live rows.
    fn needs_rewrite(&self, live_rows: usize) -> bool {
        self.entries >= self.rewrite_threshold && self.entries >= live_rows.saturating_mul(2)
    }
}

/// One table: rows in memory plus an optional append-only log.
pub struct Table<R: Row> {
    rows: DashMap<R::Key, R>,
    log: Option<Mutex<TableLog>>,
}

impl<R: Row> Table<R> {
    fn in_memory() -> Self {
        Self {
            rows: DashMap::new(),
            log: None,
        }
    }

    fn open(dir: &Path, rewrite_threshold: usize) -> Result<Self> {
        let path = dir.join(format!("{}.jsonl", R::TABLE));
        let rows = DashMap::new();
        let mut entries = 0usize;

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                entries += 1;
                match serde_json::from_str::<LogEntry<R, R::Key>>(&line) {
                    Ok(LogEntry::Put { row }) => {
                        rows.insert(row.key(), row);
                    }
                    Ok(LogEntry::Delete { key }) => {
                        rows.remove(&key);
                    }
                    // A torn final write is skipped rather than poisoning the table.
                    Err(e) => warn!(table = R::TABLE, line = lineno + 1, "Skipping unreadable catalogue entry: {}", e),
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(table = R::TABLE, rows = rows.len(), entries, "Opened catalogue table");
        let table = Self {
            rows,
            log: Some(Mutex::new(TableLog {
                path,
                file,
                entries,
                rewrite_threshold,
            })),
        };
        if let Some(log) = &table.log {
            let mut log = log.lock();
            if log.needs_rewrite(table.rows.len()) {
                table.rewrite(&mut log)?;
            }
        }
        Ok(table)
    }

    /// Append `entry`, then apply the in-memory change under the same lock
    /// so a rewrite never misses a row.
    fn write(&self, entry: &LogEntry<&R, &R::Key>, apply: impl FnOnce()) -> Result<()> {
        let Some(log) = &self.log else {
            apply();
            return Ok(());
        };
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut log = log.lock();
        log.file.write_all(&line)?;
        log.file.flush()?;
        log.entries += 1;
        apply();
        if log.needs_rewrite(self.rows.len()) {
            self.rewrite(&mut log)?;
        }
        Ok(())
    }

    /// Replace the log with one `Put` per live row.
    fn rewrite(&self, log: &mut TableLog) -> Result<()> {
        let tmp = log.path.with_extension("jsonl.tmp");
        let mut count = 0usize;
        {
            let mut out = File::create(&tmp)?;
            for row in self.rows.iter() {
                let mut line = serde_json::to_vec(&LogEntry::<&R, &R::Key>::Put { row: row.value() })?;
                line.push(b'\n');
                out.write_all(&line)?;
                count += 1;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &log.path)?;
        log.file = OpenOptions::new().append(true).open(&log.path)?;
        debug!(table = R::TABLE, before = log.entries, after = count, "Rewrote catalogue log");
        log.entries = count;
        Ok(())
    }

    /// Write `row` durably, then make it visible.
    pub fn put(&self, row: R) -> Result<()> {
        let key = row.key();
        self.write(&LogEntry::Put { row: &row }, || {
            self.rows.insert(key, row.clone());
        })
    }

    pub fn get(&self, key: &R::Key) -> Option<R> {
        self.rows.get(key).map(|r| r.value().clone())
    }

    pub fn contains(&self, key: &R::Key) -> bool {
        self.rows.contains_key(key)
    }

    pub fn delete(&self, key: &R::Key) -> Result<Option<R>> {
        if !self.rows.contains_key(key) {
            return Ok(None);
        }
        let mut removed = None;
        self.write(&LogEntry::<&R, &R::Key>::Delete { key }, || {
            removed = self.rows.remove(key).map(|(_, row)| row);
        })?;
        Ok(removed)
    }

    pub fn all(&self) -> Vec<R> {
        self.rows.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// All catalogue tables.
pub struct Catalogue {
    dir: Option<PathBuf>,
    backups: Table<BackupRecord>,
    recovery_tests: Table<RecoveryTest>,
    replicas: Table<ReplicaStatus>,
    failovers: Table<FailoverEvent>,
    snapshots: Table<Snapshot>,
}

impl Catalogue {
    /// Open (or create) a durable catalogue under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_threshold(dir, DEFAULT_REWRITE_THRESHOLD)
    }

    /// Open with a custom per-table log rewrite threshold.
    pub fn open_with_threshold(dir: impl Into<PathBuf>, rewrite_threshold: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            backups: Table::open(&dir, rewrite_threshold)?,
            recovery_tests: Table::open(&dir, rewrite_threshold)?,
            replicas: Table::open(&dir, rewrite_threshold)?,
            failovers: Table::open(&dir, rewrite_threshold)?,
            snapshots: Table::open(&dir, rewrite_threshold)?,
            dir: Some(dir),
        })
    }

    /// A catalogue that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            backups: Table::in_memory(),
            recovery_tests: Table::in_memory(),
            replicas: Table::in_memory(),
            failovers: Table::in_memory(),
            snapshots: Table::in_memory(),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    // ---- backup history ----

    pub fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        if self.backups.contains(&record.id) {
            return Err(DrError::InvalidState(format!("backup {} already recorded", record.id)));
        }
        self.backups.put(record.clone())
    }

    /// Update a backup row. Terminal rows are never reopened.
    pub fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        match self.backups.get(&record.id) {
            None => Err(DrError::NotFound(format!("backup {}", record.id))),
            Some(existing) if existing.is_terminal() && existing.status != record.status => {
                Err(DrError::InvalidState(format!(
                    "backup {} is {:?} and cannot move to {:?}",
                    record.id, existing.status, record.status
                )))
            }
            Some(_) => self.backups.put(record.clone()),
        }
    }

    pub fn backup(&self, id: &Uuid) -> Option<BackupRecord> {
        self.backups.get(id)
    }

    /// Backups newest first, optionally filtered by level.
    pub fn backups(&self, level: Option<BackupLevel>) -> Vec<BackupRecord> {
        let mut rows: Vec<_> = self
            .backups
            .all()
            .into_iter()
            .filter(|r| level.map(|l| r.level == l).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        rows
    }

    pub fn latest_completed(&self, kind: Option<BackupKind>, level: Option<BackupLevel>) -> Option<BackupRecord> {
        self.backups(level)
            .into_iter()
            .find(|r| r.status == BackupStatus::Completed && kind.map(|k| r.kind == k).unwrap_or(true))
    }

    pub fn delete_backup(&self, id: &Uuid) -> Result<Option<BackupRecord>> {
        self.backups.delete(id)
    }

    // ---- recovery tests ----

    pub fn record_recovery_test(&self, test: &RecoveryTest) -> Result<()> {
        if self.recovery_tests.contains(&test.id) {
            return Err(DrError::InvalidState(format!("recovery test {} is immutable", test.id)));
        }
        self.recovery_tests.put(test.clone())
    }

    pub fn recovery_tests(&self) -> Vec<RecoveryTest> {
        let mut rows = self.recovery_tests.all();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        rows
    }

    // ---- replica status ----

    pub fn upsert_replica(&self, status: &ReplicaStatus) -> Result<()> {
        self.replicas.put(status.clone())
    }

    pub fn replica(&self, replica_id: &str) -> Option<ReplicaStatus> {
        self.replicas.get(&replica_id.to_string())
    }

    pub fn replicas(&self) -> Vec<ReplicaStatus> {
        let mut rows = self.replicas.all();
        rows.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
        rows
    }

    // ---- failover history ----

    pub fn insert_failover(&self, event: &FailoverEvent) -> Result<()> {
        if self.failovers.contains(&event.id) {
            return Err(DrError::InvalidState(format!("failover {} already recorded", event.id)));
        }
        self.failovers.put(event.clone())
    }

    /// Record completion. A completed event is never rewritten.
    pub fn complete_failover(&self, event: &FailoverEvent) -> Result<()> {
        match self.failovers.get(&event.id) {
            None => Err(DrError::NotFound(format!("failover {}", event.id))),
            Some(existing) if existing.completed_at.is_some() => Err(DrError::InvalidState(format!(
                "failover {} already completed",
                event.id
            ))),
            Some(_) => self.failovers.put(event.clone()),
        }
    }

    pub fn failover(&self, id: &Uuid) -> Option<FailoverEvent> {
        self.failovers.get(id)
    }

    pub fn failovers(&self) -> Vec<FailoverEvent> {
        let mut rows = self.failovers.all();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        rows
    }

    // ---- restore points ----

    pub fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots.put(snapshot.clone())
    }

    pub fn snapshot(&self, id: &Uuid) -> Option<Snapshot> {
        self.snapshots.get(id)
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        let mut rows = self.snapshots.all();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }
}
