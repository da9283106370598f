//! Engine process handles
//!
//! Spawns an external engine with piped stdout/stderr and hands back a
//! cloneable [`ProcessHandle`]. A background task owns the child and
//! publishes its exit; termination goes through signals so the handle never
//! needs the child itself.

use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineCommand;
use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the process was ended by a signal
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    AlreadyRequested,
    Graceful,
    Forced,
}

#[derive(Debug, Clone)]
pub struct ProcessHandle {
    program: Arc<str>,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    termination_requested: Arc<AtomicBool>,
}

pub struct EngineProcess {
    pub handle: ProcessHandle,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Starts `command` with `extra_args` appended after its configured arguments.
pub fn spawn(
    command: &EngineCommand,
    extra_args: &[OsString],
) -> Result<EngineProcess, SupervisorError> {
    let mut cmd = Command::new(&command.program);

    cmd.args(&command.args)
        .args(extra_args)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }

    // Own process group so the whole engine tree can be signalled at once.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| SupervisorError::EngineSpawn {
        program: command.program.clone(),
        source,
    })?;

    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let program: Arc<str> = Arc::from(command.program.as_str());

    let (exit_tx, exit_rx) = watch::channel(None);
    let waiter_program = Arc::clone(&program);
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(program = %waiter_program, error = %e, "failed to wait on engine");
                None
            }
        };
        debug!(program = %waiter_program, ?code, "engine exited");
        let _ = exit_tx.send(Some(ExitOutcome { code }));
    });

    debug!(program = %program, ?pid, "engine spawned");

    Ok(EngineProcess {
        handle: ProcessHandle {
            program,
            pid,
            exit: exit_rx,
            termination_requested: Arc::new(AtomicBool::new(false)),
        },
        stdout,
        stderr,
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> Arc<str> {
        Arc::clone(&self.program)
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(ExitOutcome { code: None }),
            Err(_) => ExitOutcome { code: None },
        }
    }

    /// Graceful tree termination, escalating to a forced kill when the
    /// process outlives `grace`. Only the first call sends anything.
    pub async fn terminate(&self, grace: Duration) -> Termination {
        if self.has_exited() {
            return Termination::AlreadyExited;
        }
        if self.termination_requested.swap(true, Ordering::SeqCst) {
            return Termination::AlreadyRequested;
        }
        let Some(pid) = self.pid else {
            return Termination::AlreadyExited;
        };

        if let Err(e) = send_signal(pid, false).await {
            debug!(program = %self.program, pid, error = %e, "graceful termination failed");
        }

        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return Termination::Graceful;
        }

        warn!(
            program = %self.program,
            pid,
            grace_ms = grace.as_millis() as u64,
            "engine outlived grace period, force-killing"
        );
        if let Err(e) = send_signal(pid, true).await {
            warn!(program = %self.program, pid, error = %e, "forced kill failed");
        }
        Termination::Forced
    }
}

#[cfg(unix)]
async fn send_signal(pid: u32, force: bool) -> io::Result<()> {
    use rustix::process::{Pid, Signal, kill_process_group};

    let pid = i32::try_from(pid)
        .ok()
        .and_then(Pid::from_raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    let signal = if force { Signal::KILL } else { Signal::TERM };
    kill_process_group(pid, signal)?;
    Ok(())
}

#[cfg(windows)]
async fn send_signal(pid: u32, force: bool) -> io::Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        cmd.arg("/F");
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|_| ())
}

#[cfg(not(any(unix, windows)))]
async fn send_signal(_pid: u32, _force: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Not supported on this platform",
    ))
}

/// Drains an engine's stderr into the log. Engines write free-text
/// diagnostics there, never structured records.
pub fn forward_stderr(stderr: ChildStderr, program: Arc<str>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => debug!(program = %program, "engine stderr: {}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(program = %program, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}
