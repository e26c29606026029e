//! Process Runner
//!
//! Boundary to the external dump and apply utilities. Stages describe what
//! to run as an [`Invocation`]; a [`ProcessRunner`] runs it under a timeout.
//! [`ScriptedProcessRunner`] is the injectable fake used by tests and drills.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{DrError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Stage name used in timeout errors.
    pub stage: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// File fed to the process on stdin.
    pub stdin: Option<PathBuf>,
    /// File that receives the process's stdout.
    pub stdout: Option<PathBuf>,
}

impl Invocation {
    pub fn new(stage: &str, program: &str) -> Self {
        Self {
            stage: stage.to_string(),
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn stdin_from(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout = Some(path.to_path_buf());
        self
    }

    /// Basename of the program, used as the scripting key.
    pub fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stderr: String,
    pub elapsed: Duration,
}

/// Runs external utilities.
///
/// Implementations return `Ok` only for a zero exit status, `ExternalProcess`
/// for a non-zero one and `StageTimeout` when `timeout` elapses first. A
/// running process is never retried.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput>;
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput> {
        let start = Instant::now();
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).stderr(Stdio::piped());
        for (k, v) in &invocation.env {
            cmd.env(k, v);
        }
        match &invocation.stdin {
            Some(path) => cmd.stdin(File::open(path)?),
            None => cmd.stdin(Stdio::null()),
        };
        match &invocation.stdout {
            Some(path) => cmd.stdout(File::create(path)?),
            None => cmd.stdout(Stdio::null()),
        };

        debug!(program = %invocation.program, stage = %invocation.stage, "Spawning external process");
        let mut child = cmd.spawn().map_err(|e| DrError::ExternalProcess {
            program: invocation.program.clone(),
            code: None,
            stderr: e.to_string(),
        })?;

        // Drain stderr concurrently so a chatty process cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let outcome = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) if start.elapsed() >= timeout => {
                    warn!(program = %invocation.program, stage = %invocation.stage, "Stage timed out, killing process");
                    break Err(DrError::StageTimeout {
                        stage: invocation.stage.clone(),
                        timeout,
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    warn!(program = %invocation.program, stage = %invocation.stage, "Lost track of process, killing it: {}", e);
                    break Err(DrError::from(e));
                }
            }
        };
        // The child must be gone before the stderr drain can finish.
        if outcome.is_err() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let status = outcome?;

        if !status.success() {
            return Err(DrError::ExternalProcess {
                program: invocation.program.clone(),
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ProcessOutput {
            stderr,
            elapsed: start.elapsed(),
        })
    }
}

/// Scripted behaviour for one call of the fake runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Exit 0, writing `stdout` to the invocation's stdout file if any.
    Success { stdout: Vec<u8> },
    /// Exit with a non-zero code.
    Fail { code: i32, stderr: String },
    /// Never finishes before the stage timeout.
    Hang,
}

impl ScriptedOutcome {
    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        ScriptedOutcome::Success { stdout: bytes.into() }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        ScriptedOutcome::Fail {
            code,
            stderr: stderr.to_string(),
        }
    }
}

/// Fake runner: records invocations and replays scripted exit behaviour.
///
/// Programs without a script succeed with empty stdout. Whatever a call reads
/// from its stdin file is captured so tests can inspect applied payloads.
#[derive(Debug, Default)]
pub struct ScriptedProcessRunner {
    defaults: Mutex<HashMap<String, ScriptedOutcome>>,
    queued: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<Vec<Invocation>>,
    stdin_payloads: Mutex<Vec<(String, Vec<u8>)>>,
    delay: Option<Duration>,
}

impl ScriptedProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call for `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Behaviour for every call to `program` without a queued outcome.
    pub fn on(&self, program: &str, outcome: ScriptedOutcome) -> &Self {
        self.defaults.lock().insert(program.to_string(), outcome);
        self
    }

    /// Behaviour for the next call to `program` only.
    pub fn once(&self, program: &str, outcome: ScriptedOutcome) -> &Self {
        self.queued
            .lock()
            .entry(program.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, program: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|inv| inv.program_name() == program)
            .count()
    }

    /// Stdin bytes captured from calls to `program`, oldest first.
    pub fn stdin_payloads(&self, program: &str) -> Vec<Vec<u8>> {
        self.stdin_payloads
            .lock()
            .iter()
            .filter(|(p, _)| p == program)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    fn next_outcome(&self, program: &str) -> ScriptedOutcome {
        if let Some(outcome) = self.queued.lock().get_mut(program).and_then(VecDeque::pop_front) {
            return outcome;
        }
        self.defaults
            .lock()
            .get(program)
            .cloned()
            .unwrap_or(ScriptedOutcome::Success { stdout: Vec::new() })
    }
}

impl ProcessRunner for ScriptedProcessRunner {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput> {
        let start = Instant::now();
        let program = invocation.program_name().to_string();
        self.calls.lock().push(invocation.clone());

        if let Some(path) = &invocation.stdin {
            let bytes = std::fs::read(path)?;
            self.stdin_payloads.lock().push((program.clone(), bytes));
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        match self.next_outcome(&program) {
            ScriptedOutcome::Success { stdout } => {
                if let Some(path) = &invocation.stdout {
                    std::fs::write(path, stdout)?;
                }
                Ok(ProcessOutput {
                    stderr: String::new(),
                    elapsed: start.elapsed(),
                })
            }
            ScriptedOutcome::Fail { code, stderr } => Err(DrError::ExternalProcess {
                program: invocation.program.clone(),
                code: Some(code),
                stderr,
            }),
            ScriptedOutcome::Hang => Err(DrError::StageTimeout {
                stage: invocation.stage.clone(),
                timeout,
            }),
        }
    }
}
