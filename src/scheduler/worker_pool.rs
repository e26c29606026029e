//! Worker Pool
//!
//! Dedicated threads that run backup jobs so that long external stages
//! never stall the scheduler's timer loop.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::job_queue::{BackupJob, JobQueue};
use crate::backup::BackupExecutor;
use crate::error::{DrError, Result};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (0 = one per backup level, capped by CPUs)
    pub num_workers: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            queue_capacity: 8,
        }
    }
}

impl WorkerPoolConfig {
    fn resolved_workers(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get().clamp(1, 4)
        } else {
            self.num_workers
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: JobQueue,
    executor: Arc<BackupExecutor>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, executor: Arc<BackupExecutor>) -> Self {
        let queue = JobQueue::new(config.queue_capacity);
        Self {
            config,
            queue,
            executor,
            handles: Vec::new(),
        }
    }

    /// Start the worker threads
    pub fn start(&mut self) -> Result<()> {
        let num_workers = self.config.resolved_workers();
        info!("Starting {} backup workers", num_workers);

        for i in 0..num_workers {
            let receiver = self.queue.receiver();
            let executor = self.executor.clone();
            let handle = thread::Builder::new()
                .name(format!("backup-worker-{}", i))
                .spawn(move || {
                    debug!("Worker {} started", i);
                    while let Ok(job) = receiver.recv() {
                        Self::run_job(i, &executor, job);
                    }
                    debug!("Worker {} stopped", i);
                })
                .map_err(|e| DrError::Config(format!("cannot spawn backup worker: {}", e)))?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Handle to the queue for the dispatcher
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    fn run_job(worker_id: usize, executor: &BackupExecutor, job: BackupJob) {
        let BackupJob { trigger, slot, done } = job;
        debug!(worker_id, kind = %trigger.kind, level = %trigger.level, "Running backup job");
        let result = executor.execute(trigger.kind, trigger.level);
        // Free the level before reporting so a waiting caller can fire again.
        drop(slot);
        if let Err(e) = &result {
            warn!(worker_id, level = %trigger.level, "Backup job failed: {}", e);
        }
        if let Some(done) = done {
            if done.send(result).is_err() {
                debug!(worker_id, "Result receiver dropped");
            }
        }
    }

    /// Close the queue and wait for in-flight jobs. Every other queue handle
    /// (the dispatcher's) must already be dropped.
    pub fn join(self) {
        let WorkerPool { queue, handles, .. } = self;
        drop(queue);
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupConfig, RetentionManager, RetentionPolicy};
    use crate::catalogue::{BackupKind, BackupLevel, BackupStatus};
    use crate::locks::LevelLocks;
    use crate::scheduler::job_queue::Trigger;
    use crate::testing::Fixture;
    use tempfile::tempdir;

    #[test]
    fn test_worker_runs_job_and_reports() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let retention = Arc::new(RetentionManager::new(fx.ctx.clone(), RetentionPolicy::default()));
        let executor = Arc::new(BackupExecutor::new(fx.ctx.clone(), BackupConfig::default(), retention));
        let mut pool = WorkerPool::new(
            WorkerPoolConfig {
                num_workers: 2,
                queue_capacity: 4,
            },
            executor,
        );
        pool.start().unwrap();
        assert_eq!(pool.num_workers(), 2);

        let locks = LevelLocks::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.queue()
            .try_send(BackupJob {
                trigger: Trigger::new(BackupKind::Full, BackupLevel::Test),
                slot: locks.try_acquire(BackupLevel::Test).unwrap(),
                done: Some(tx),
            })
            .unwrap();

        let record = tokio_test::block_on(rx).unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert!(!locks.is_busy(BackupLevel::Test));
        pool.join();
    }
}
