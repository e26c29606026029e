//! Backup Pipeline
//!
//! Job execution, artifact layout, retention and the optional remote copy.

pub mod archive;
mod executor;
pub mod manifest;
mod retention;
mod storage;

pub use executor::{artifact_name, BackupConfig, BackupExecutor, DatabaseTarget};
pub use manifest::{ComponentEntry, ComponentKind, Manifest};
pub use retention::{PruneReport, RetentionManager, RetentionPolicy};
pub use storage::{DirectoryRemoteStore, RemoteStore};
