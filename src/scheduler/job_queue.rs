//! Job Queue
//!
//! Bounded MPMC queue carrying backup jobs from the dispatcher to workers.

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::catalogue::{BackupKind, BackupLevel, BackupRecord};
use crate::error::Result;
use crate::locks::LevelGuard;

/// One timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub kind: BackupKind,
    pub level: BackupLevel,
    pub fired_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(kind: BackupKind, level: BackupLevel) -> Self {
        Self {
            kind,
            level,
            fired_at: Utc::now(),
        }
    }
}

/// Job handed to a worker. Holding `slot` keeps the level marked in flight
/// until the worker drops the job.
#[derive(Debug)]
pub struct BackupJob {
    pub trigger: Trigger,
    pub slot: LevelGuard,
    /// Completion channel for callers waiting on the result.
    pub done: Option<tokio::sync::oneshot::Sender<Result<BackupRecord>>>,
}

/// Bounded job queue
///
/// Producers never block: a full queue rejects the job so that firings are
/// skipped instead of piling up.
#[derive(Clone)]
pub struct JobQueue {
    sender: Sender<BackupJob>,
    receiver: Receiver<BackupJob>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            capacity: capacity.max(1),
        }
    }

    pub fn receiver(&self) -> Receiver<BackupJob> {
        self.receiver.clone()
    }

    pub fn try_send(&self, job: BackupJob) -> std::result::Result<(), TrySendError<BackupJob>> {
        self.sender.try_send(job)
    }

    pub fn try_recv(&self) -> std::result::Result<BackupJob, channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Approximate number of waiting jobs
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
