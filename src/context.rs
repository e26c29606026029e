//! Shared Services
//!
//! Handles every orchestrator component borrows: catalogue, audit trail,
//! metrics, process runner, cipher, admin pool and the exclusion guards.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::admin::AdminPool;
use crate::audit::AuditRecorder;
use crate::backup::RemoteStore;
use crate::catalogue::Catalogue;
use crate::config::Layout;
use crate::crypto::FieldCipher;
use crate::integrity::IntegrityVerifier;
use crate::locks::{OperationLock, RestoreRegistry};
use crate::metrics::Metrics;
use crate::process::ProcessRunner;

#[derive(Clone)]
pub struct Context {
    pub layout: Layout,
    pub catalogue: Arc<Catalogue>,
    pub audit: Arc<AuditRecorder>,
    pub metrics: Arc<Metrics>,
    pub runner: Arc<dyn ProcessRunner>,
    pub cipher: FieldCipher,
    pub admin: Arc<AdminPool>,
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub verifier: IntegrityVerifier,
    /// Backups referenced by running restores.
    pub restores: RestoreRegistry,
    /// Held by restore and failover for their whole critical section.
    pub operation_lock: OperationLock,
    /// Node currently acting as primary; failover moves it.
    pub primary: Arc<RwLock<String>>,
}

impl Context {
    pub fn new(
        layout: Layout,
        catalogue: Arc<Catalogue>,
        audit: Arc<AuditRecorder>,
        runner: Arc<dyn ProcessRunner>,
        cipher: FieldCipher,
        admin: Arc<AdminPool>,
    ) -> Self {
        Self {
            layout,
            catalogue,
            audit,
            metrics: Arc::new(Metrics::new()),
            runner,
            cipher,
            admin,
            remote: None,
            verifier: IntegrityVerifier::new(),
            restores: RestoreRegistry::new(),
            operation_lock: OperationLock::new(),
            primary: Arc::new(RwLock::new("primary".to_string())),
        }
    }

    pub fn with_primary(self, primary: impl Into<String>) -> Self {
        *self.primary.write() = primary.into();
        self
    }

    pub fn primary(&self) -> String {
        self.primary.read().clone()
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }
}
