//! `psql`-backed admin channel
//!
//! Each command is one `psql -X -At -c` invocation through the shared
//! [`ProcessRunner`], with stdout captured in a scratch file. Connection
//! configuration is a single file holding the current primary's conninfo;
//! repointing rewrites it atomically.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AdminChannel, PositionMarkers};
use crate::error::{DrError, Result};
use crate::process::{Invocation, ProcessRunner};

const LSN_OFFSET: &str = "pg_wal_lsn_diff({}, '0/0')::bigint";

/// psql's exit status when the server connection fails.
const CONNECTION_FAILED: i32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsqlAdminConfig {
    pub program: String,
    /// Node name to libpq conninfo.
    pub nodes: BTreeMap<String, String>,
    pub command_timeout: Duration,
    /// File the applications read their primary conninfo from.
    pub pointer_file: Option<PathBuf>,
}

impl Default for PsqlAdminConfig {
    fn default() -> Self {
        Self {
            program: "psql".to_string(),
            nodes: BTreeMap::new(),
            command_timeout: Duration::from_secs(30),
            pointer_file: None,
        }
    }
}

impl PsqlAdminConfig {
    pub fn with_node(mut self, name: impl Into<String>, conninfo: impl Into<String>) -> Self {
        self.nodes.insert(name.into(), conninfo.into());
        self
    }

    pub fn with_pointer_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pointer_file = Some(path.into());
        self
    }
}

pub struct PsqlAdminChannel {
    config: PsqlAdminConfig,
    runner: Arc<dyn ProcessRunner>,
    scratch: PathBuf,
    primary: RwLock<String>,
}

impl PsqlAdminChannel {
    pub fn new(
        config: PsqlAdminConfig,
        runner: Arc<dyn ProcessRunner>,
        scratch: impl Into<PathBuf>,
        primary: impl Into<String>,
    ) -> Result<Self> {
        let scratch = scratch.into();
        fs::create_dir_all(&scratch)?;
        Ok(Self {
            config,
            runner,
            scratch,
            primary: RwLock::new(primary.into()),
        })
    }

    fn conninfo(&self, node: &str) -> Result<&str> {
        self.config
            .nodes
            .get(node)
            .map(String::as_str)
            .ok_or_else(|| DrError::NotFound(format!("node {}", node)))
    }

    /// Run `sql` on `node` and return trimmed unaligned output. A failed
    /// connection is reported as transient.
    fn query(&self, node: &str, sql: &str) -> Result<String> {
        let out = self.scratch.join(format!("{}.out", Uuid::new_v4()));
        let invocation = Invocation::new("admin", &self.config.program)
            .args([self.conninfo(node)?, "-X", "-A", "-t", "-v", "ON_ERROR_STOP=1", "-c", sql])
            .stdout_to(&out);
        debug!(%node, %sql, "Admin command");
        let text = self
            .runner
            .run(&invocation, self.config.command_timeout)
            .map(|_| fs::read_to_string(&out).unwrap_or_default());
        let _ = fs::remove_file(&out);
        match text {
            Ok(text) => Ok(text.trim().to_string()),
            Err(DrError::ExternalProcess {
                code: Some(CONNECTION_FAILED),
                stderr,
                ..
            }) => Err(DrError::TransientIo(format!("{} unreachable: {}", node, stderr))),
            Err(e) => Err(e),
        }
    }

    fn query_bool(&self, node: &str, sql: &str) -> Result<bool> {
        match self.query(node, sql)?.as_str() {
            "t" | "on" | "true" => Ok(true),
            "f" | "off" | "false" => Ok(false),
            other => Err(DrError::InvalidState(format!("unexpected boolean from {}: {:?}", node, other))),
        }
    }

    fn query_i64(&self, node: &str, sql: &str) -> Result<i64> {
        let text = self.query(node, sql)?;
        text.parse()
            .map_err(|_| DrError::InvalidState(format!("unexpected number from {}: {:?}", node, text)))
    }
}

fn lsn(expr: &str) -> String {
    LSN_OFFSET.replace("{}", expr)
}

fn parse_u64(field: Option<&str>) -> Result<u64> {
    let field = field.unwrap_or("").trim();
    if field.is_empty() {
        return Ok(0);
    }
    field
        .parse::<i64>()
        .map(|v| v.max(0) as u64)
        .map_err(|_| DrError::InvalidState(format!("unexpected position {:?}", field)))
}

impl AdminChannel for PsqlAdminChannel {
    fn terminate_connections(&self, node: &str) -> Result<usize> {
        let n = self.query_i64(
            node,
            "SELECT count(pg_terminate_backend(pid)) FROM pg_stat_activity \
             WHERE pid <> pg_backend_pid() AND backend_type = 'client backend'",
        )?;
        Ok(n.max(0) as usize)
    }

    fn set_read_only(&self, node: &str, read_only: bool) -> Result<()> {
        // ALTER SYSTEM cannot share a transaction with the reload.
        self.query(
            node,
            &format!(
                "ALTER SYSTEM SET default_transaction_read_only = {}",
                if read_only { "on" } else { "off" }
            ),
        )?;
        self.query(node, "SELECT pg_reload_conf()")?;
        Ok(())
    }

    fn is_read_only(&self, node: &str) -> Result<bool> {
        self.query_bool(node, "SHOW default_transaction_read_only")
    }

    /// With the primary unreachable, its position is taken to be the
    /// replica's receive position.
    fn replica_positions(&self, replica: &str) -> Result<PositionMarkers> {
        let row = self.query(
            replica,
            &format!(
                "SELECT {}, {}, extract(epoch FROM pg_last_xact_replay_timestamp())::bigint",
                lsn("pg_last_wal_receive_lsn()"),
                lsn("pg_last_wal_replay_lsn()")
            ),
        )?;
        let mut fields = row.split('|');
        let received = parse_u64(fields.next())?;
        let replay_lsn = parse_u64(fields.next())?;
        let replayed_at = parse_u64(fields.next())?;

        let primary = self.primary.read().clone();
        let primary_lsn = match self.current_position(&primary) {
            Ok(lsn) => lsn,
            Err(e) if e.is_transient() => {
                warn!(%primary, %replica, "Primary position unavailable, using replica receive position: {}", e);
                received
            }
            Err(e) => return Err(e),
        };
        Ok(PositionMarkers {
            primary_lsn,
            write_lsn: received,
            flush_lsn: received,
            replay_lsn,
            last_replay_at: if replayed_at == 0 {
                None
            } else {
                chrono::DateTime::from_timestamp(replayed_at as i64, 0)
            },
        })
    }

    fn current_position(&self, node: &str) -> Result<u64> {
        let text = self.query(node, &format!("SELECT {}", lsn("pg_current_wal_lsn()")))?;
        parse_u64(Some(&text))
    }

    fn promote(&self, replica: &str) -> Result<()> {
        if !self.query_bool(replica, "SELECT pg_promote(true, 60)")? {
            return Err(DrError::InvalidState(format!("{} did not finish promotion", replica)));
        }
        Ok(())
    }

    fn repoint(&self, primary: &str) -> Result<()> {
        let conninfo = self.conninfo(primary)?.to_string();
        if let Some(path) = &self.config.pointer_file {
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, format!("{}\n", conninfo))?;
            fs::rename(&tmp, path)?;
        }
        *self.primary.write() = primary.to_string();
        info!(%primary, "Connection configuration repointed");
        Ok(())
    }

    fn verify_writes(&self, node: &str) -> Result<()> {
        let writable = self.query_bool(
            node,
            "SELECT NOT pg_is_in_recovery() AND current_setting('default_transaction_read_only') = 'off'",
        )?;
        if !writable {
            return Err(DrError::InvalidState(format!("{} is not accepting writes", node)));
        }
        Ok(())
    }

    fn verify_query(&self, sql: &str) -> Result<i64> {
        let primary = self.primary.read().clone();
        self.query_i64(&primary, sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ScriptedOutcome, ScriptedProcessRunner};
    use tempfile::tempdir;

    fn channel(dir: &std::path::Path, runner: Arc<ScriptedProcessRunner>) -> PsqlAdminChannel {
        let config = PsqlAdminConfig::default()
            .with_node("a", "host=a dbname=app")
            .with_node("b", "host=b dbname=app")
            .with_pointer_file(dir.join("primary.conninfo"));
        PsqlAdminChannel::new(config, runner, dir.join("scratch"), "a").unwrap()
    }

    #[test]
    fn test_replica_positions_parse() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedProcessRunner::new());
        runner.once("psql", ScriptedOutcome::stdout(b"4800|4500|1700000000\n".to_vec()));
        runner.once("psql", ScriptedOutcome::stdout(b"5000\n".to_vec()));
        let markers = channel(dir.path(), runner.clone()).replica_positions("b").unwrap();

        assert_eq!(markers.primary_lsn, 5000);
        assert_eq!(markers.write_lsn, 4800);
        assert_eq!(markers.replay_lsn, 4500);
        assert_eq!(markers.lag_bytes(), 500);
        assert!(markers.last_replay_at.is_some());
        assert_eq!(runner.invocations()[0].args[0], "host=b dbname=app");
        assert_eq!(runner.invocations()[1].args[0], "host=a dbname=app");
    }

    #[test]
    fn test_replica_positions_without_primary() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedProcessRunner::new());
        runner.once("psql", ScriptedOutcome::stdout(b"4800|4700|1700000000\n".to_vec()));
        runner.once("psql", ScriptedOutcome::fail(2, "connection to server failed"));
        let markers = channel(dir.path(), runner).replica_positions("b").unwrap();

        assert_eq!(markers.primary_lsn, 4800);
        assert_eq!(markers.replay_lsn, 4700);
        assert_eq!(markers.lag_bytes(), 100);
    }

    #[test]
    fn test_connection_failure_is_transient() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedProcessRunner::new());
        runner.once("psql", ScriptedOutcome::fail(2, "connection to server failed"));
        runner.once("psql", ScriptedOutcome::fail(3, "syntax error"));
        let ch = channel(dir.path(), runner);

        assert!(ch.is_read_only("a").unwrap_err().is_transient());
        assert!(matches!(ch.is_read_only("a"), Err(DrError::ExternalProcess { code: Some(3), .. })));
    }

    #[test]
    fn test_repoint_rewrites_pointer_and_targets_queries() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedProcessRunner::new());
        runner.on("psql", ScriptedOutcome::stdout(b"1".to_vec()));
        let ch = channel(dir.path(), runner.clone());

        ch.repoint("b").unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("primary.conninfo")).unwrap(),
            "host=b dbname=app\n"
        );
        assert_eq!(ch.verify_query("SELECT 1").unwrap(), 1);
        assert_eq!(runner.invocations()[0].args[0], "host=b dbname=app");
    }

    #[test]
    fn test_unexpected_output_is_an_error() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedProcessRunner::new());
        runner.on("psql", ScriptedOutcome::stdout(b"maybe".to_vec()));
        let ch = channel(dir.path(), runner);
        assert!(ch.is_read_only("a").is_err());
        assert!(matches!(ch.promote("zzz"), Err(DrError::NotFound(_))));
    }
}
