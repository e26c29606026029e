//! Administrative Channel
//!
//! The database command channel shared by monitoring polls and destructive
//! operations, plus a bounded permit pool in front of it. [`SimulatedCluster`]
//! is an in-memory primary/replica topology used by tests and drills;
//! [`PsqlAdminChannel`] drives a real cluster through `psql`.

use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{DrError, Result};

mod psql;

pub use psql::{PsqlAdminChannel, PsqlAdminConfig};

/// Replica-reported positions, in bytes of write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionMarkers {
    /// Current write position on the primary.
    pub primary_lsn: u64,
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub replay_lsn: u64,
    /// When the replica last replayed a transaction.
    pub last_replay_at: Option<DateTime<Utc>>,
}

impl PositionMarkers {
    pub fn lag_bytes(&self) -> u64 {
        self.primary_lsn.saturating_sub(self.replay_lsn)
    }

    /// Zero when fully replayed, otherwise time since the last replay.
    pub fn lag_seconds(&self, now: DateTime<Utc>) -> f64 {
        if self.replay_lsn >= self.primary_lsn {
            return 0.0;
        }
        self.last_replay_at
            .map(|t| (now - t).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

/// Commands the orchestrator issues against the data store cluster.
pub trait AdminChannel: Send + Sync {
    /// Terminate client connections on `node`; returns how many were closed.
    fn terminate_connections(&self, node: &str) -> Result<usize>;
    fn set_read_only(&self, node: &str, read_only: bool) -> Result<()>;
    fn is_read_only(&self, node: &str) -> Result<bool>;
    fn replica_positions(&self, replica: &str) -> Result<PositionMarkers>;
    /// Current write position on `node`.
    fn current_position(&self, node: &str) -> Result<u64>;
    fn promote(&self, replica: &str) -> Result<()>;
    /// Point connection configuration at `primary`.
    fn repoint(&self, primary: &str) -> Result<()>;
    /// Prove `node` accepts writes.
    fn verify_writes(&self, node: &str) -> Result<()>;
    /// Run a scalar verification query against the live primary.
    fn verify_query(&self, sql: &str) -> Result<i64>;
}

/// Admin pool sizing and back-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminPoolConfig {
    pub size: usize,
    pub acquire_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for AdminPoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// Bounded pool of admin connections.
pub struct AdminPool {
    channel: Arc<dyn AdminChannel>,
    config: AdminPoolConfig,
    available: Mutex<usize>,
    released: Condvar,
}

impl AdminPool {
    pub fn new(channel: Arc<dyn AdminChannel>, config: AdminPoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            channel,
            config,
            available: Mutex::new(size),
            released: Condvar::new(),
        }
    }

    /// Borrow a connection, waiting up to `acquire_timeout` per attempt.
    pub fn acquire(&self) -> Result<AdminConnection<'_>> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            let deadline = Instant::now() + self.config.acquire_timeout;
            let mut available = self.available.lock();
            while *available == 0 {
                if self.released.wait_until(&mut available, deadline).timed_out() {
                    break;
                }
            }
            if *available > 0 {
                *available -= 1;
                return Ok(AdminConnection { pool: self });
            }
            warn!(attempt, attempts, "Admin connection pool exhausted");
        }
        Err(DrError::PoolExhausted { attempts })
    }

    /// Acquire, run `f`, release.
    pub fn with<R>(&self, f: impl FnOnce(&dyn AdminChannel) -> Result<R>) -> Result<R> {
        let conn = self.acquire()?;
        f(&*conn)
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    fn release(&self) {
        *self.available.lock() += 1;
        self.released.notify_one();
    }
}

/// A borrowed admin connection; the permit returns on drop.
pub struct AdminConnection<'a> {
    pool: &'a AdminPool,
}

impl Deref for AdminConnection<'_> {
    type Target = dyn AdminChannel;

    fn deref(&self) -> &Self::Target {
        &*self.pool.channel
    }
}

impl Drop for AdminConnection<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[derive(Debug, Clone, Default)]
struct SimNode {
    read_only: bool,
    markers: PositionMarkers,
    connections: usize,
}

#[derive(Debug, Default)]
struct ClusterState {
    primary: String,
    config_primary: String,
    primary_position: u64,
    nodes: HashMap<String, SimNode>,
    catch_up_on_poll: bool,
    failing_writes: HashSet<String>,
    unreachable: HashSet<String>,
    failing_queries: HashSet<String>,
    promoted: Vec<String>,
    log: Vec<String>,
}

impl ClusterState {
    fn node(&mut self, name: &str) -> Result<&mut SimNode> {
        if self.unreachable.contains(name) {
            return Err(DrError::TransientIo(format!("node {} unreachable", name)));
        }
        self.nodes
            .get_mut(name)
            .ok_or_else(|| DrError::NotFound(format!("node {}", name)))
    }
}

/// In-memory cluster implementing [`AdminChannel`].
#[derive(Debug, Default)]
pub struct SimulatedCluster {
    state: Mutex<ClusterState>,
}

impl SimulatedCluster {
    pub fn new(primary: &str) -> Self {
        let mut state = ClusterState {
            primary: primary.to_string(),
            config_primary: primary.to_string(),
            catch_up_on_poll: true,
            ..Default::default()
        };
        state.nodes.insert(
            primary.to_string(),
            SimNode {
                connections: 3,
                ..Default::default()
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn add_replica(&self, name: &str, markers: PositionMarkers) -> &Self {
        self.state.lock().nodes.insert(
            name.to_string(),
            SimNode {
                read_only: true,
                markers,
                connections: 0,
            },
        );
        self
    }

    pub fn set_markers(&self, name: &str, markers: PositionMarkers) {
        if let Some(node) = self.state.lock().nodes.get_mut(name) {
            node.markers = markers;
        }
    }

    pub fn set_primary_position(&self, position: u64) {
        self.state.lock().primary_position = position;
    }

    /// When set, a poll of a replica reports it fully replayed.
    pub fn set_catch_up_on_poll(&self, enabled: bool) {
        self.state.lock().catch_up_on_poll = enabled;
    }

    pub fn fail_write_verification(&self, node: &str) {
        self.state.lock().failing_writes.insert(node.to_string());
    }

    pub fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(node.to_string());
        } else {
            state.unreachable.remove(node);
        }
    }

    pub fn fail_query(&self, sql: &str) {
        self.state.lock().failing_queries.insert(sql.to_string());
    }

    pub fn primary(&self) -> String {
        self.state.lock().primary.clone()
    }

    pub fn config_primary(&self) -> String {
        self.state.lock().config_primary.clone()
    }

    pub fn was_promoted(&self, node: &str) -> bool {
        self.state.lock().promoted.iter().any(|n| n == node)
    }

    /// Every command issued, in order, formatted as `command:node`.
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

impl AdminChannel for SimulatedCluster {
    fn terminate_connections(&self, node: &str) -> Result<usize> {
        let mut state = self.state.lock();
        state.log.push(format!("terminate:{}", node));
        let n = state.node(node)?;
        Ok(std::mem::take(&mut n.connections))
    }

    fn set_read_only(&self, node: &str, read_only: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(format!("read_only={}:{}", read_only, node));
        state.node(node)?.read_only = read_only;
        Ok(())
    }

    fn is_read_only(&self, node: &str) -> Result<bool> {
        Ok(self.state.lock().node(node)?.read_only)
    }

    fn replica_positions(&self, replica: &str) -> Result<PositionMarkers> {
        let mut state = self.state.lock();
        let primary_position = state.primary_position;
        let catch_up = state.catch_up_on_poll;
        let node = state.node(replica)?;
        node.markers.primary_lsn = node.markers.primary_lsn.max(primary_position);
        if catch_up {
            node.markers.write_lsn = node.markers.primary_lsn;
            node.markers.flush_lsn = node.markers.primary_lsn;
            node.markers.replay_lsn = node.markers.primary_lsn;
            node.markers.last_replay_at = Some(Utc::now());
        }
        Ok(node.markers)
    }

    fn current_position(&self, node: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let position = state.primary_position;
        state.node(node)?;
        Ok(position)
    }

    fn promote(&self, replica: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(format!("promote:{}", replica));
        state.node(replica)?.read_only = false;
        state.primary = replica.to_string();
        state.promoted.push(replica.to_string());
        Ok(())
    }

    fn repoint(&self, primary: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(format!("repoint:{}", primary));
        state.node(primary)?;
        state.config_primary = primary.to_string();
        Ok(())
    }

    fn verify_writes(&self, node: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(format!("verify_writes:{}", node));
        let failing = state.failing_writes.contains(node);
        let n = state.node(node)?;
        if failing || n.read_only {
            return Err(DrError::InvalidState(format!("{} rejected a test write", node)));
        }
        Ok(())
    }

    fn verify_query(&self, sql: &str) -> Result<i64> {
        let mut state = self.state.lock();
        state.log.push(format!("query:{}", sql));
        if state.failing_queries.contains(sql) {
            return Err(DrError::InvalidState(format!("verification query failed: {}", sql)));
        }
        debug!(%sql, "Simulated verification query");
        Ok(1)
    }
}
