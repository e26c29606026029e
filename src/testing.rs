//! Test Harness
//!
//! Wires a [`Context`] to the in-process fakes: a scripted process runner,
//! a simulated cluster and a key manager with cheap derivation parameters.
//! Used by unit tests, the integration suite and offline drills.

use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::admin::{AdminPool, AdminPoolConfig, PositionMarkers, SimulatedCluster};
use crate::audit::AuditRecorder;
use crate::catalogue::Catalogue;
use crate::config::Layout;
use crate::context::Context;
use crate::crypto::{FieldCipher, KdfParams, KeyManager, KEY_SIZE};
use crate::error::Result;
use crate::process::ScriptedProcessRunner;

pub const TEST_PRIMARY: &str = "db-primary";
pub const TEST_REPLICA: &str = "db-replica";

pub struct Fixture {
    pub ctx: Context,
    pub runner: Arc<ScriptedProcessRunner>,
    pub cluster: Arc<SimulatedCluster>,
    pub keys: Arc<KeyManager>,
}

impl Fixture {
    /// A durable fixture rooted at `root` with one primary and one replica.
    pub fn new(root: &Path) -> Result<Self> {
        let layout = Layout::new(root);
        let catalogue = Arc::new(Catalogue::open(layout.catalogue_dir())?);
        let audit = Arc::new(AuditRecorder::open(&layout.audit_log(), 1_000)?);
        let runner = Arc::new(ScriptedProcessRunner::new());
        let cluster = Arc::new(SimulatedCluster::new(TEST_PRIMARY));
        cluster.add_replica(TEST_REPLICA, PositionMarkers::default());
        let keys = Arc::new(KeyManager::new(Zeroizing::new([7u8; KEY_SIZE]), KdfParams::fast())?);
        let admin = Arc::new(AdminPool::new(cluster.clone(), AdminPoolConfig::default()));

        let ctx = Context::new(layout, catalogue, audit, runner.clone(), FieldCipher::new(keys.clone()), admin)
            .with_primary(TEST_PRIMARY);
        Ok(Self {
            ctx,
            runner,
            cluster,
            keys,
        })
    }
}
