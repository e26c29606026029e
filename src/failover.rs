//! Failover Controller
//!
//! Promotes a replica to primary:
//! `stable -> writes_stopped -> awaiting_catchup -> promoting -> verifying ->
//! stable | failed`. The global operation lock is held from stopping writes
//! until the new primary is verified. A failed step marks the event
//! unsuccessful; promotion is never reverted, but the old primary's write
//! mode and the connection configuration are put back as they were.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::audit::{AuditEvent, AuditEventType};
use crate::catalogue::{FailoverEvent, FailoverTrigger};
use crate::context::Context;
use crate::error::{DrError, Result};

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Bounded wait for the target replica to catch up.
    pub catchup_timeout: Duration,
    pub catchup_poll_interval: Duration,
    /// Proceed when the old primary cannot be reached to stop writes.
    pub allow_unreachable_primary: bool,
    /// Minimum gap between automatic failovers.
    pub cooldown: Duration,
    pub affected_services: Vec<String>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            catchup_timeout: Duration::from_secs(60),
            catchup_poll_interval: Duration::from_millis(500),
            allow_unreachable_primary: false,
            cooldown: Duration::from_secs(300),
            affected_services: vec!["api".to_string(), "workers".to_string()],
        }
    }
}

impl FailoverConfig {
    pub fn with_catchup(mut self, timeout: Duration, poll: Duration) -> Self {
        self.catchup_timeout = timeout;
        self.catchup_poll_interval = poll;
        self
    }

    pub fn allow_unreachable_primary(mut self) -> Self {
        self.allow_unreachable_primary = true;
        self
    }
}

/// Failover state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverState {
    Stable,
    WritesStopped,
    AwaitingCatchup,
    Promoting,
    Verifying,
    Failed,
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailoverState::Stable => "stable",
            FailoverState::WritesStopped => "writes_stopped",
            FailoverState::AwaitingCatchup => "awaiting_catchup",
            FailoverState::Promoting => "promoting",
            FailoverState::Verifying => "verifying",
            FailoverState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverRequest {
    pub target: String,
    pub trigger: FailoverTrigger,
    pub reason: String,
}

impl FailoverRequest {
    pub fn manual(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            trigger: FailoverTrigger::Manual,
            reason: reason.into(),
        }
    }

    pub fn automatic(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            trigger: FailoverTrigger::Automatic,
            reason: reason.into(),
        }
    }
}

/// What has been done so far, for undoing write mode and configuration.
#[derive(Debug, Default)]
struct Undo {
    /// Old primary's read-only flag before writes were stopped.
    prior_read_only: Option<bool>,
    repointed: bool,
}

pub struct FailoverController {
    ctx: Context,
    config: FailoverConfig,
    state: Mutex<FailoverState>,
    last_failover: Mutex<Option<Instant>>,
}

impl FailoverController {
    pub fn new(ctx: Context, config: FailoverConfig) -> Self {
        Self {
            ctx,
            config,
            state: Mutex::new(FailoverState::Stable),
            last_failover: Mutex::new(None),
        }
    }

    pub fn state(&self) -> FailoverState {
        *self.state.lock()
    }

    /// Check whether an automatic failover is allowed right now
    pub fn can_failover(&self) -> bool {
        match *self.last_failover.lock() {
            Some(last) => last.elapsed() >= self.config.cooldown,
            None => true,
        }
    }

    /// Run the failover sequence. Precondition failures are errors and leave
    /// no event behind; a failed step yields an event with `success = false`.
    pub fn perform_failover(&self, request: &FailoverRequest) -> Result<FailoverEvent> {
        let old_primary = self.ctx.primary();
        if request.target == old_primary {
            return Err(DrError::InvalidState(format!("{} is already the primary", request.target)));
        }
        if request.trigger == FailoverTrigger::Automatic && !self.can_failover() {
            return Err(DrError::InvalidState("automatic failover is cooling down".into()));
        }
        let _op = self
            .ctx
            .operation_lock
            .try_acquire(&format!("failover to {}", request.target))?;

        let mut event = FailoverEvent::new(request.trigger, &request.reason, &old_primary, &request.target);
        event.affected_services = self.config.affected_services.clone();
        self.ctx.catalogue.insert_failover(&event)?;
        self.ctx.audit.record(
            AuditEvent::new(AuditEventType::FailoverStarted)
                .with_subject(event.id)
                .with_detail("old_primary", &old_primary)
                .with_detail("new_primary", &request.target)
                .with_message(request.reason.clone()),
        );
        warn!(
            failover_id = %event.id,
            old_primary = %old_primary,
            new_primary = %request.target,
            reason = %request.reason,
            "Failover started"
        );

        let mut undo = Undo::default();
        match self.run_steps(&mut event, &mut undo) {
            Ok(()) => {
                self.set_state(FailoverState::Stable);
                *self.ctx.primary.write() = request.target.clone();
                *self.last_failover.lock() = Some(Instant::now());
                event.success = true;
                info!(failover_id = %event.id, new_primary = %request.target, "Failover completed");
            }
            Err(e) => {
                self.set_state(FailoverState::Failed);
                error!(failover_id = %event.id, "Failover failed: {}", e);
                event.error = Some(e.to_string());
                self.restore_old_primary(&mut event, &undo);
            }
        }

        event.completed_at = Some(chrono::Utc::now());
        if let Err(e) = self.ctx.catalogue.complete_failover(&event) {
            error!(failover_id = %event.id, "Failed to record failover completion: {}", e);
        }
        self.ctx.metrics.failover_finished(event.success);
        let mut audit = AuditEvent::new(if event.success {
            AuditEventType::FailoverCompleted
        } else {
            AuditEventType::FailoverFailed
        })
        .with_subject(event.id)
        .with_detail("data_loss_bytes", event.data_loss_bytes)
        .with_detail("actions", event.actions.len());
        if let Some(err) = &event.error {
            audit = audit.failed().with_message(err.clone());
        }
        self.ctx.audit.record(audit);
        Ok(event)
    }

    fn set_state(&self, state: FailoverState) {
        *self.state.lock() = state;
    }

    fn step(&self, event: &mut FailoverEvent, state: FailoverState, action: String) {
        self.set_state(state);
        info!(failover_id = %event.id, %state, "{}", action);
        self.ctx.audit.record(
            AuditEvent::new(AuditEventType::FailoverStep)
                .with_subject(event.id)
                .with_detail("state", state)
                .with_message(action.clone()),
        );
        event.actions.push(action);
    }

    fn run_steps(&self, event: &mut FailoverEvent, undo: &mut Undo) -> Result<()> {
        let old = event.old_primary.clone();
        let target = event.new_primary.clone();
        let admin = &self.ctx.admin;

        // Stop writes on the old primary.
        self.set_state(FailoverState::WritesStopped);
        let stop = admin.with(|a| {
            let prior = a.is_read_only(&old)?;
            a.set_read_only(&old, true)?;
            Ok(prior)
        });
        let catchup_position = match stop {
            Ok(prior) => {
                undo.prior_read_only = Some(prior);
                self.step(event, FailoverState::WritesStopped, format!("set {} read-only", old));
                Some(admin.with(|a| a.current_position(&old))?)
            }
            Err(e) if self.config.allow_unreachable_primary && e.is_transient() => {
                self.step(
                    event,
                    FailoverState::WritesStopped,
                    format!("{} unreachable ({}); proceeding without stopping writes", old, e),
                );
                None
            }
            Err(e) => return Err(e),
        };

        // Wait for the replica to replay up to the frozen position.
        self.set_state(FailoverState::AwaitingCatchup);
        let deadline = Instant::now() + self.config.catchup_timeout;
        loop {
            let markers = admin.with(|a| a.replica_positions(&target))?;
            let wanted = catchup_position.unwrap_or(markers.primary_lsn);
            if markers.replay_lsn >= wanted {
                event.data_loss_bytes = if catchup_position.is_some() { 0 } else { markers.lag_bytes() };
                self.step(
                    event,
                    FailoverState::AwaitingCatchup,
                    format!("{} caught up to position {}", target, markers.replay_lsn),
                );
                break;
            }
            if Instant::now() >= deadline {
                event.data_loss_bytes = wanted.saturating_sub(markers.replay_lsn);
                return Err(DrError::StageTimeout {
                    stage: FailoverState::AwaitingCatchup.to_string(),
                    timeout: self.config.catchup_timeout,
                });
            }
            thread::sleep(self.config.catchup_poll_interval);
        }

        self.set_state(FailoverState::Promoting);
        admin.with(|a| a.promote(&target))?;
        event.promoted_at = Some(chrono::Utc::now());
        self.step(event, FailoverState::Promoting, format!("promoted {}", target));

        admin.with(|a| a.repoint(&target))?;
        undo.repointed = true;
        self.step(event, FailoverState::Promoting, format!("repointed connections to {}", target));

        self.set_state(FailoverState::Verifying);
        admin.with(|a| a.verify_writes(&target))?;
        self.step(event, FailoverState::Verifying, format!("{} accepts writes", target));
        Ok(())
    }

    /// Put back the old primary's write mode and the connection target.
    fn restore_old_primary(&self, event: &mut FailoverEvent, undo: &Undo) {
        let old = event.old_primary.clone();
        if undo.repointed {
            match self.ctx.admin.with(|a| a.repoint(&old)) {
                Ok(()) => event.actions.push(format!("repointed connections back to {}", old)),
                Err(e) => event.actions.push(format!("could not repoint back to {}: {}", old, e)),
            }
        }
        if let Some(prior) = undo.prior_read_only {
            match self.ctx.admin.with(|a| a.set_read_only(&old, prior)) {
                Ok(()) => event.actions.push(format!("restored {} read_only={}", old, prior)),
                Err(e) => event.actions.push(format!("could not restore write mode on {}: {}", old, e)),
            }
        }
        if event.promoted_at.is_some() {
            warn!(
                failover_id = %event.id,
                replica = %event.new_primary,
                "Replica stays promoted; reconcile manually"
            );
            event
                .actions
                .push(format!("{} left promoted; manual reconciliation required", event.new_primary));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{
        AdminChannel, AdminPool, AdminPoolConfig, PositionMarkers, PsqlAdminChannel, PsqlAdminConfig,
    };
    use crate::process::{ScriptedOutcome, ScriptedProcessRunner};
    use std::sync::Arc;
    use crate::testing::{Fixture, TEST_PRIMARY, TEST_REPLICA};
    use tempfile::tempdir;

    fn controller(fx: &Fixture, config: FailoverConfig) -> FailoverController {
        FailoverController::new(fx.ctx.clone(), config)
    }

    fn fast() -> FailoverConfig {
        FailoverConfig::default().with_catchup(Duration::from_millis(100), Duration::from_millis(10))
    }

    #[test]
    fn test_successful_failover() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        fx.cluster.set_primary_position(10_000);

        let event = controller(&fx, fast())
            .perform_failover(&FailoverRequest::manual(TEST_REPLICA, "maintenance"))
            .unwrap();

        assert!(event.success, "{:?}", event.error);
        assert!(event.promoted_at.is_some());
        assert_eq!(event.data_loss_bytes, 0);
        assert_eq!(fx.ctx.primary(), TEST_REPLICA);
        assert_eq!(fx.cluster.config_primary(), TEST_REPLICA);
        assert_eq!(event.actions.len(), 5);
        let stored = fx.ctx.catalogue.failover(&event.id).unwrap();
        assert!(stored.completed_at.is_some());
        assert!(fx.ctx.operation_lock.holder().is_none());
    }

    #[test]
    fn test_failed_write_verification_keeps_old_primary_writable() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        fx.cluster.fail_write_verification(TEST_REPLICA);
        let ctl = controller(&fx, fast());

        let event = ctl
            .perform_failover(&FailoverRequest::manual(TEST_REPLICA, "drill"))
            .unwrap();

        assert!(!event.success);
        assert_eq!(ctl.state(), FailoverState::Failed);
        assert!(!fx.cluster.is_read_only(TEST_PRIMARY).unwrap());
        assert_eq!(fx.cluster.config_primary(), TEST_PRIMARY);
        assert_eq!(fx.ctx.primary(), TEST_PRIMARY);
        assert!(fx.cluster.was_promoted(TEST_REPLICA));
        assert!(!fx.ctx.catalogue.failover(&event.id).unwrap().success);
    }

    #[test]
    fn test_catchup_timeout_reports_failure() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        fx.cluster.set_catch_up_on_poll(false);
        fx.cluster.set_primary_position(9_000);
        fx.cluster.set_markers(
            TEST_REPLICA,
            PositionMarkers {
                replay_lsn: 8_000,
                ..Default::default()
            },
        );

        let event = controller(&fx, fast())
            .perform_failover(&FailoverRequest::manual(TEST_REPLICA, "primary degraded"))
            .unwrap();

        assert!(!event.success);
        assert_eq!(event.data_loss_bytes, 1_000);
        assert!(event.promoted_at.is_none());
        assert!(!fx.cluster.was_promoted(TEST_REPLICA));
        assert!(event.error.unwrap().contains("awaiting_catchup"));
    }

    #[test]
    fn test_unreachable_primary_needs_opt_in() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        fx.cluster.set_unreachable(TEST_PRIMARY, true);

        let event = controller(&fx, fast())
            .perform_failover(&FailoverRequest::manual(TEST_REPLICA, "primary down"))
            .unwrap();
        assert!(!event.success);

        let event = controller(&fx, fast().allow_unreachable_primary())
            .perform_failover(&FailoverRequest::manual(TEST_REPLICA, "primary down"))
            .unwrap();
        assert!(event.success, "{:?}", event.error);
    }

    #[test]
    fn test_unreachable_primary_through_psql() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let runner = Arc::new(ScriptedProcessRunner::new());
        let down = || ScriptedOutcome::fail(2, "connection to server failed");
        runner.once("psql", down());
        runner.once("psql", ScriptedOutcome::stdout(b"4800|4800|1700000000\n".to_vec()));
        runner.once("psql", down());
        runner.once("psql", ScriptedOutcome::stdout(b"t\n".to_vec()));
        runner.once("psql", ScriptedOutcome::stdout(b"t\n".to_vec()));
        let pointer = dir.path().join("primary.conninfo");
        let psql = PsqlAdminChannel::new(
            PsqlAdminConfig::default()
                .with_node(TEST_PRIMARY, "host=a dbname=app")
                .with_node(TEST_REPLICA, "host=b dbname=app")
                .with_pointer_file(&pointer),
            runner.clone(),
            dir.path().join("admin"),
            TEST_PRIMARY,
        )
        .unwrap();
        let mut ctx = fx.ctx.clone();
        ctx.admin = Arc::new(AdminPool::new(Arc::new(psql), AdminPoolConfig::default()));

        let event = FailoverController::new(ctx.clone(), fast().allow_unreachable_primary())
            .perform_failover(&FailoverRequest::manual(TEST_REPLICA, "primary down"))
            .unwrap();

        assert!(event.success, "{:?}", event.error);
        assert_eq!(event.data_loss_bytes, 0);
        assert_eq!(ctx.primary(), TEST_REPLICA);
        assert_eq!(std::fs::read_to_string(&pointer).unwrap(), "host=b dbname=app\n");
        assert_eq!(runner.calls_to("psql"), 5);
    }

    #[test]
    fn test_preconditions() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path()).unwrap();
        let ctl = controller(&fx, fast());

        assert!(ctl
            .perform_failover(&FailoverRequest::manual(TEST_PRIMARY, "noop"))
            .is_err());

        let held = fx.ctx.operation_lock.try_acquire("restore").unwrap();
        assert!(matches!(
            ctl.perform_failover(&FailoverRequest::manual(TEST_REPLICA, "x")),
            Err(DrError::OperationInProgress(_))
        ));
        drop(held);
        assert!(fx.ctx.catalogue.failovers().is_empty());

        ctl.perform_failover(&FailoverRequest::manual(TEST_REPLICA, "x"))
            .unwrap();
        assert!(!ctl.can_failover());
        assert!(ctl
            .perform_failover(&FailoverRequest::automatic(TEST_PRIMARY, "flap"))
            .is_err());
    }
}
