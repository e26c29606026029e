//! Backup Scheduler
//!
//! Independent timers per cadence feed a single dispatcher through a bounded
//! channel. The dispatcher enqueues at most one job per level; a firing for a
//! level that is still in flight is skipped, never queued.

mod job_queue;
mod worker_pool;

pub use job_queue::{BackupJob, JobQueue, Trigger};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

use crossbeam::channel::TrySendError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditRecorder};
use crate::catalogue::{BackupKind, BackupLevel, BackupRecord};
use crate::error::{DrError, Result};
use crate::locks::LevelLocks;
use crate::metrics::Metrics;

const TRIGGER_CHANNEL_CAPACITY: usize = 16;

/// One recurring trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    pub kind: BackupKind,
    pub level: BackupLevel,
    pub every: Duration,
}

impl Cadence {
    pub fn new(kind: BackupKind, level: BackupLevel, every: Duration) -> Self {
        Self { kind, level, every }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub cadences: Vec<Cadence>,
    /// Fire every cadence once at startup instead of waiting a full period.
    pub fire_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        const HOUR: u64 = 3600;
        Self {
            cadences: vec![
                Cadence::new(BackupKind::Full, BackupLevel::Daily, Duration::from_secs(24 * HOUR)),
                Cadence::new(BackupKind::Full, BackupLevel::Weekly, Duration::from_secs(7 * 24 * HOUR)),
                Cadence::new(BackupKind::Full, BackupLevel::Monthly, Duration::from_secs(30 * 24 * HOUR)),
                Cadence::new(BackupKind::Incremental, BackupLevel::Daily, Duration::from_secs(HOUR)),
            ],
            fire_on_start: false,
        }
    }
}

impl ScheduleConfig {
    pub fn with_cadences(mut self, cadences: Vec<Cadence>) -> Self {
        self.cadences = cadences;
        self
    }

    pub fn with_fire_on_start(mut self, fire: bool) -> Self {
        self.fire_on_start = fire;
        self
    }
}

/// What happened to a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Enqueued,
    SkippedBusy,
    SkippedQueueFull,
}

/// Turns triggers into queued jobs, one in flight per level.
pub struct Dispatcher {
    queue: JobQueue,
    in_flight: LevelLocks,
    audit: Arc<AuditRecorder>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(queue: JobQueue, audit: Arc<AuditRecorder>, metrics: Arc<Metrics>) -> Self {
        Self {
            queue,
            in_flight: LevelLocks::new(),
            audit,
            metrics,
        }
    }

    pub fn dispatch(&self, trigger: Trigger) -> DispatchOutcome {
        self.enqueue(trigger, None)
    }

    /// Dispatch and hand back a receiver for the job's result, or an error
    /// if the firing was skipped.
    pub fn dispatch_and_wait(
        &self,
        trigger: Trigger,
    ) -> Result<tokio::sync::oneshot::Receiver<Result<BackupRecord>>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        match self.enqueue(trigger, Some(tx)) {
            DispatchOutcome::Enqueued => Ok(rx),
            DispatchOutcome::SkippedBusy | DispatchOutcome::SkippedQueueFull => {
                Err(DrError::LevelBusy(trigger.level.to_string()))
            }
        }
    }

    pub fn is_in_flight(&self, level: BackupLevel) -> bool {
        self.in_flight.is_busy(level)
    }

    fn enqueue(
        &self,
        trigger: Trigger,
        done: Option<tokio::sync::oneshot::Sender<Result<BackupRecord>>>,
    ) -> DispatchOutcome {
        let Some(slot) = self.in_flight.try_acquire(trigger.level) else {
            warn!(kind = %trigger.kind, level = %trigger.level, "Previous backup still running; skipping firing");
            self.skipped(trigger, "previous job for this level still running");
            return DispatchOutcome::SkippedBusy;
        };

        match self.queue.try_send(BackupJob { trigger, slot, done }) {
            Ok(()) => {
                debug!(kind = %trigger.kind, level = %trigger.level, "Backup job enqueued");
                DispatchOutcome::Enqueued
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                warn!(level = %trigger.level, "Job queue unavailable; skipping firing");
                self.skipped(trigger, "job queue full");
                DispatchOutcome::SkippedQueueFull
            }
        }
    }

    fn skipped(&self, trigger: Trigger, reason: &str) {
        self.metrics.firing_skipped();
        self.audit.record(
            AuditEvent::new(AuditEventType::BackupSkipped)
                .with_subject(trigger.level)
                .with_message(reason)
                .with_detail("kind", trigger.kind)
                .with_detail("fired_at", trigger.fired_at.to_rfc3339()),
        );
    }
}

/// Running timer and dispatch tasks.
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start one timer task per cadence plus the dispatch loop. All of them
    /// stop when `shutdown` is cancelled.
    pub fn spawn(config: &ScheduleConfig, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<Trigger>(TRIGGER_CHANNEL_CAPACITY);
        let mut tasks = Vec::with_capacity(config.cadences.len() + 1);

        for cadence in config.cadences.iter().copied() {
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            let start = if config.fire_on_start {
                Instant::now()
            } else {
                Instant::now() + cadence.every
            };
            tasks.push(tokio::spawn(async move {
                let mut timer = interval_at(start, cadence.every);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = timer.tick() => {
                            let trigger = Trigger::new(cadence.kind, cadence.level);
                            if tx.try_send(trigger).is_err() {
                                warn!(level = %cadence.level, "Trigger channel full; dropping firing");
                            }
                        }
                    }
                }
            }));
        }
        drop(tx);

        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    trigger = rx.recv() => match trigger {
                        Some(trigger) => {
                            dispatcher.dispatch(trigger);
                        }
                        None => break,
                    },
                }
            }
            debug!("Dispatch loop stopped");
        }));

        info!(cadences = config.cadences.len(), "Scheduler started");
        Self { tasks }
    }

    /// Wait for every task to observe cancellation.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(capacity: usize) -> (Dispatcher, JobQueue) {
        let queue = JobQueue::new(capacity);
        let d = Dispatcher::new(queue.clone(), Arc::new(AuditRecorder::new(100)), Arc::new(Metrics::new()));
        (d, queue)
    }

    #[test]
    fn test_second_firing_for_busy_level_is_skipped() {
        let (d, queue) = dispatcher(4);
        assert_eq!(d.dispatch(Trigger::new(BackupKind::Full, BackupLevel::Daily)), DispatchOutcome::Enqueued);
        assert_eq!(
            d.dispatch(Trigger::new(BackupKind::Incremental, BackupLevel::Daily)),
            DispatchOutcome::SkippedBusy
        );
        assert_eq!(d.dispatch(Trigger::new(BackupKind::Full, BackupLevel::Weekly)), DispatchOutcome::Enqueued);
        assert_eq!(queue.len(), 2);
        assert_eq!(d.metrics.snapshot().firings_skipped, 1);
        assert_eq!(d.audit.of_type(AuditEventType::BackupSkipped).len(), 1);

        // Finishing the job frees the level.
        drop(queue.try_recv().unwrap());
        assert!(!d.is_in_flight(BackupLevel::Daily));
        assert_eq!(d.dispatch(Trigger::new(BackupKind::Full, BackupLevel::Daily)), DispatchOutcome::Enqueued);
    }

    #[test]
    fn test_full_queue_is_a_skip() {
        let (d, _queue) = dispatcher(1);
        d.dispatch(Trigger::new(BackupKind::Full, BackupLevel::Daily));
        assert_eq!(
            d.dispatch(Trigger::new(BackupKind::Full, BackupLevel::Monthly)),
            DispatchOutcome::SkippedQueueFull
        );
        assert!(!d.is_in_flight(BackupLevel::Monthly));
    }

    #[test]
    fn test_dispatch_and_wait_rejects_busy_level() {
        let (d, _queue) = dispatcher(4);
        let _rx = d.dispatch_and_wait(Trigger::new(BackupKind::Full, BackupLevel::Test)).unwrap();
        assert!(matches!(
            d.dispatch_and_wait(Trigger::new(BackupKind::Full, BackupLevel::Test)),
            Err(DrError::LevelBusy(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_into_queue() {
        let (d, queue) = dispatcher(8);
        let shutdown = CancellationToken::new();
        let config = ScheduleConfig::default().with_cadences(vec![
            Cadence::new(BackupKind::Full, BackupLevel::Daily, Duration::from_secs(60)),
            Cadence::new(BackupKind::Full, BackupLevel::Weekly, Duration::from_secs(60)),
        ]);
        let scheduler = Scheduler::spawn(&config, Arc::new(d), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.len(), 2);

        // Jobs still queued: the next firings are skipped, not queued.
        tokio::time::sleep(Duration::from_secs(60)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.len(), 2);

        shutdown.cancel();
        scheduler.join().await;
    }
}
