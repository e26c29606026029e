//! KEEPSAFE - Disaster Recovery Orchestrator
//!
//! Scheduled, encrypted and integrity-checked backups of a relational store,
//! file store and configuration; verified restores with rollback; replica lag
//! monitoring and controlled failover. Also home to the field-level
//! encryption service and session tokens.

pub mod admin;
pub mod audit;
pub mod backup;
pub mod catalogue;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod failover;
pub mod integrity;
pub mod locks;
pub mod metrics;
pub mod orchestrator;
pub mod process;
pub mod replication;
pub mod restore;
pub mod scheduler;
pub mod testing;

pub use admin::{AdminChannel, AdminPool, PositionMarkers, SimulatedCluster};
pub use audit::{AuditEvent, AuditEventType, AuditRecorder};
pub use backup::{BackupConfig, BackupExecutor, RetentionManager, RetentionPolicy};
pub use catalogue::{BackupKind, BackupLevel, BackupRecord, BackupStatus, Catalogue};
pub use config::{Layout, OrchestratorConfig};
pub use context::Context;
pub use crypto::{FieldCipher, KdfParams, KeyManager, Purpose, SessionTokenCodec};
pub use error::{DrError, Result};
pub use failover::{FailoverConfig, FailoverController, FailoverRequest, FailoverState};
pub use integrity::IntegrityVerifier;
pub use metrics::Metrics;
pub use orchestrator::{Orchestrator, StatusReport};
pub use process::{ProcessRunner, ScriptedProcessRunner, SystemProcessRunner};
pub use replication::{ReplicationConfig, ReplicationMonitor};
pub use restore::{RecoveryTester, RestoreConfig, RestoreOrchestrator, RestoreRequest};
pub use scheduler::{Dispatcher, ScheduleConfig, Scheduler, WorkerPool};
