//! Pipeline supervisor
//!
//! Owns one recovery job from preflight to its terminal state. The job task
//! reads the primary engine's records in order, runs the optional carve phase
//! once the workspace is ready, and reports through [`JobSignal`]s.
//!
//! Teardown always goes intent first: a cancel or disk-full observation is
//! recorded in the job's [`JobControl`] before any signal reaches the engine,
//! and the exit path reads that intent before it looks at the exit code.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::BufReader;
use tokio::process::ChildStdout;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::aggregator::ResultAggregator;
use crate::carver::{self, CarveRun};
use crate::config::SupervisorConfig;
use crate::control::JobControl;
use crate::disk_space::{CapacityProbe, SystemCapacityProbe, check_capacity};
use crate::error::SupervisorError;
use crate::events::{EngineEvent, EventReader, ProgressTracker, classify_line};
use crate::process::{self, ExitOutcome, ProcessHandle};
use crate::readiness::{self, ReadinessError};
use crate::types::{DiskFullPhase, ExitIntent, JobId, JobSignal, JobState, RecoveryJob};
use crate::workspace::{CleanupOutcome, WorkspaceManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRejection {
    DiskFull { free: u64, needed: u64 },
    DiskCheckFailed,
}

impl StartRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            StartRejection::DiskFull { .. } => "disk_full",
            StartRejection::DiskCheckFailed => "disk_check_failed",
        }
    }
}

pub enum StartOutcome {
    Started(JobHandle),
    Rejected(StartRejection),
}

impl StartOutcome {
    pub fn started(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            StartOutcome::Started(_) => None,
            StartOutcome::Rejected(r) => Some(r.reason()),
        }
    }

    pub fn into_handle(self) -> Option<JobHandle> {
        match self {
            StartOutcome::Started(handle) => Some(handle),
            StartOutcome::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub id: JobId,
    pub state: JobState,
    pub workspace: Option<PathBuf>,
    pub result_count: usize,
    pub exit_code: Option<i32>,
    pub cleanup: Option<CleanupOutcome>,
}

/// Caller-side view of a running job.
pub struct JobHandle {
    id: JobId,
    control: JobControl,
    state: Arc<RwLock<JobState>>,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        *self.state.read()
    }

    /// Requests cancellation. Returns `true` only for the request that was
    /// recorded; repeated or late requests change nothing.
    pub fn cancel(&self) -> bool {
        // Holding the read guard keeps the job task from moving to a state
        // that no longer accepts cancellation in between.
        let guard = self.state.read();
        let current = *guard;
        if !current.accepts_cancel() {
            debug!(job_id = %self.id, state = %current, "cancel ignored");
            return false;
        }
        let recorded = self.control.request_cancel();
        drop(guard);
        if recorded {
            info!(job_id = %self.id, state = %current, "cancellation requested");
        }
        recorded
    }

    pub fn control(&self) -> JobControl {
        self.control.clone()
    }

    pub async fn join(self) -> JobReport {
        let id = self.id;
        let state = Arc::clone(&self.state);
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(job_id = %id, error = %e, "job task failed");
                JobReport {
                    id,
                    state: *state.read(),
                    workspace: None,
                    result_count: 0,
                    exit_code: None,
                    cleanup: None,
                }
            }
        }
    }
}

pub struct PipelineSupervisor {
    config: Arc<SupervisorConfig>,
    probe: Arc<dyn CapacityProbe>,
    workspaces: WorkspaceManager,
}

impl PipelineSupervisor {
    pub fn new(config: SupervisorConfig, probe: Arc<dyn CapacityProbe>) -> Self {
        let workspaces = WorkspaceManager::from_config(&config);
        Self {
            config: Arc::new(config),
            probe,
            workspaces,
        }
    }

    pub fn with_system_probe(config: SupervisorConfig) -> Self {
        Self::new(config, Arc::new(SystemCapacityProbe))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Runs preflight and, when it passes, spawns the primary engine and the
    /// job task. A rejected preflight spawns nothing and creates no workspace.
    pub async fn start(
        &self,
        source: impl Into<PathBuf>,
        signals: UnboundedSender<JobSignal>,
    ) -> Result<StartOutcome, SupervisorError> {
        let mut job = RecoveryJob::new(source);
        job.transition(JobState::Preflight)?;

        let needed = self.config.required_free_bytes;
        let temp_root = self.config.temp_root();
        let probe = Arc::clone(&self.probe);
        let target = temp_root.clone();
        let check = tokio::task::spawn_blocking(move || check_capacity(&*probe, &target, needed))
            .await
            .map_err(|e| SupervisorError::CapacityQuery {
                path: temp_root.clone(),
                source: std::io::Error::other(e),
            })
            .and_then(|r| r);

        match check {
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "preflight capacity query failed");
                job.transition(JobState::DiskFullFailed)?;
                let _ = signals.send(JobSignal::DiskFull {
                    phase: DiskFullPhase::PreflightError,
                    free: None,
                    needed: Some(needed),
                });
                return Ok(StartOutcome::Rejected(StartRejection::DiskCheckFailed));
            }
            Ok(check) if !check.ok => {
                let err = SupervisorError::PreflightDiskFull {
                    free: check.free,
                    needed,
                };
                warn!(job_id = %job.id, error = %err, "preflight rejected");
                job.transition(JobState::DiskFullFailed)?;
                let _ = signals.send(JobSignal::DiskFull {
                    phase: DiskFullPhase::Preflight,
                    free: Some(check.free),
                    needed: Some(needed),
                });
                return Ok(StartOutcome::Rejected(StartRejection::DiskFull {
                    free: check.free,
                    needed,
                }));
            }
            Ok(check) => {
                debug!(job_id = %job.id, free = check.free, total = check.total, "preflight passed");
            }
        }

        let spawned = process::spawn(
            &self.config.engine,
            &[job.source.as_os_str().to_os_string()],
        )?;

        job.transition(JobState::Running)?;
        info!(
            job_id = %job.id,
            source = %job.source.display(),
            pid = ?spawned.handle.pid(),
            "recovery job started"
        );

        if let Some(stderr) = spawned.stderr {
            process::forward_stderr(stderr, spawned.handle.program());
        }

        let id = job.id;
        let control = JobControl::new();
        let state = Arc::new(RwLock::new(job.state));
        let runner = JobRunner {
            job,
            config: Arc::clone(&self.config),
            workspaces: self.workspaces.clone(),
            control: control.clone(),
            state: Arc::clone(&state),
            signals,
            engine: spawned.handle,
            aggregator: ResultAggregator::new(),
            progress: ProgressTracker::new(),
            watcher: None,
            disk_full: (None, None),
        };
        let span = info_span!("job", job_id = %id);
        let task = tokio::spawn(runner.run(spawned.stdout).instrument(span));

        Ok(StartOutcome::Started(JobHandle {
            id,
            control,
            state,
            task,
        }))
    }
}

struct JobRunner {
    job: RecoveryJob,
    config: Arc<SupervisorConfig>,
    workspaces: WorkspaceManager,
    control: JobControl,
    state: Arc<RwLock<JobState>>,
    signals: UnboundedSender<JobSignal>,
    engine: ProcessHandle,
    aggregator: ResultAggregator,
    progress: ProgressTracker,
    watcher: Option<JoinHandle<Result<PathBuf, ReadinessError>>>,
    disk_full: (Option<u64>, Option<u64>),
}

impl JobRunner {
    async fn run(mut self, stdout: Option<ChildStdout>) -> JobReport {
        let exit = self.run_primary(stdout).await;

        match self.control.intent() {
            ExitIntent::CancelRequested => return self.finish_cancelled(exit).await,
            ExitIntent::DiskFullObserved => return self.finish_disk_full(exit).await,
            ExitIntent::None => {}
        }

        if let Some(outcome) = exit.filter(|o| !o.success()) {
            let err = SupervisorError::EngineNonzeroExit { code: outcome.code };
            warn!(error = %err, "primary engine failed, keeping what it produced");
        }

        if let Some(watcher) = self.watcher.take() {
            if self.advance(JobState::CarvingWait) == JobState::Cancelled {
                watcher.abort();
                return self.finish_cancelled(exit).await;
            }
            if !self.carve_phase(watcher).await {
                return self.finish_cancelled(exit).await;
            }
        }

        if self.advance(JobState::Aggregating) == JobState::Cancelled {
            return self.finish_cancelled(exit).await;
        }

        let workspace = self.job.workspace.clone();
        let result_count = self
            .aggregator
            .finalize(workspace.as_deref())
            .map(|files| {
                let count = files.len();
                self.send(JobSignal::Results { files });
                count
            })
            .unwrap_or(0);

        self.advance(JobState::Done);
        self.send(JobSignal::Done);
        info!(results = result_count, "recovery job done");

        self.report(exit, result_count, None)
    }

    /// Reads the primary engine's records until it closes stdout and exits,
    /// or until an exit intent is recorded. Returns `None` when the engine
    /// had to be terminated.
    async fn run_primary(&mut self, stdout: Option<ChildStdout>) -> Option<ExitOutcome> {
        let control = self.control.clone();
        let engine = self.engine.clone();

        if let Some(stdout) = stdout {
            let mut reader = EventReader::new(BufReader::new(stdout));
            loop {
                tokio::select! {
                    biased;
                    intent = control.wait() => {
                        self.terminate_engine(intent).await;
                        return None;
                    }
                    line = reader.next_line() => match line {
                        Ok(Some(line)) => self.dispatch(classify_line(&line)).await,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "engine stdout read failed");
                            break;
                        }
                    }
                }
            }
        }

        tokio::select! {
            biased;
            intent = control.wait() => {
                self.terminate_engine(intent).await;
                None
            }
            exit = engine.wait() => {
                debug!(code = ?exit.code, "primary engine exited");
                Some(exit)
            }
        }
    }

    async fn terminate_engine(&self, intent: ExitIntent) {
        let outcome = self.engine.terminate(self.config.terminate_grace()).await;
        info!(?intent, ?outcome, "primary engine terminated");
    }

    async fn dispatch(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::DiskFull { free, needed, .. } => {
                self.disk_full = (free, needed);
                if self.control.observe_disk_full() {
                    let err = SupervisorError::RuntimeDiskFull { free, needed };
                    error!(error = %err, "engine reported disk full");
                }
            }
            EngineEvent::WorkspaceAnnounced { path } => {
                self.adopt_workspace(&path);
            }
            EngineEvent::ExtractDone {
                output_dir,
                results,
            } => {
                if let Some(dir) = output_dir {
                    self.adopt_workspace(&dir);
                }
                debug!(count = results.len(), "inline results received");
                self.aggregator.add_inline(results);
            }
            EngineEvent::Progress { processed, total } => {
                let percent = self.progress.observe(processed, total);
                self.send(JobSignal::Progress {
                    processed,
                    total,
                    percent,
                });
            }
            EngineEvent::AnalysisReady { path } => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    let dir = dir.to_path_buf();
                    self.adopt_workspace(&dir);
                    self.send(JobSignal::AnalysisLocated { dir });
                }
                if let Err(e) = self.aggregator.add_analysis_file(&path).await {
                    warn!(error = %e, "analysis results unavailable");
                }
            }
            EngineEvent::DownloadStats {
                copied,
                copied_slack,
            } => {
                debug!(copied, copied_slack, "engine copy stats");
            }
            EngineEvent::Unrecognized { raw_line } => {
                if !raw_line.trim().is_empty() {
                    debug!("engine: {}", raw_line);
                }
            }
        }
    }

    fn adopt_workspace(&mut self, path: &Path) {
        if !self.job.adopt_workspace(path) {
            return;
        }
        info!(workspace = %path.display(), "workspace announced");

        if self.config.carver.is_some() && self.watcher.is_none() {
            let base = path.to_path_buf();
            let readiness = self.config.readiness.clone();
            let control = self.control.clone();
            self.watcher = Some(tokio::spawn(
                async move { readiness::wait_for_ready(&base, &readiness, &control).await }
                    .in_current_span(),
            ));
        }
    }

    /// Waits for readiness and runs the carver. Returns `false` when the job
    /// was cancelled along the way.
    async fn carve_phase(&mut self, watcher: JoinHandle<Result<PathBuf, ReadinessError>>) -> bool {
        let ready = match watcher.await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "readiness watcher failed, skipping carve phase");
                return true;
            }
        };

        match ready {
            Ok(dir) => {
                debug!(ready = %dir.display(), "carve phase starting");
            }
            Err(ReadinessError::Cancelled) => {
                return self.control.intent() != ExitIntent::CancelRequested;
            }
            Err(e) => {
                if let Some(err) = e.into_supervisor_error() {
                    warn!(error = %err, "carve phase skipped");
                }
                return true;
            }
        }

        let (Some(command), Some(workspace)) =
            (self.config.carver.clone(), self.job.workspace.clone())
        else {
            return true;
        };

        if self.advance(JobState::Carving) == JobState::Cancelled {
            return false;
        }

        match carver::run_carver(&self.config, &command, &workspace, &self.control).await {
            CarveRun::Completed { exit, files } => {
                info!(code = ?exit.code, count = files.len(), "carve phase finished");
                self.aggregator.add_carved(files);
                true
            }
            CarveRun::SpawnFailed => true,
            CarveRun::Cancelled => false,
        }
    }

    /// Moves to `next`, or to `Cancelled` when a cancel was recorded while
    /// the current state still accepted one.
    fn advance(&mut self, next: JobState) -> JobState {
        let mut shared = self.state.write();
        let target = if self.control.intent() == ExitIntent::CancelRequested
            && shared.accepts_cancel()
            && !next.is_terminal()
        {
            JobState::Cancelled
        } else {
            next
        };
        match self.job.transition(target) {
            Ok(_) => *shared = target,
            Err(e) => error!(error = %e, "job state machine violated"),
        }
        self.job.state
    }

    fn send(&self, signal: JobSignal) {
        if self.signals.send(signal).is_err() {
            debug!("signal consumer is gone");
        }
    }

    async fn cleanup(&mut self) -> Option<CleanupOutcome> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        let workspace = self.job.workspace.clone()?;
        Some(self.workspaces.safe_delete(&workspace).await)
    }

    async fn finish_cancelled(mut self, exit: Option<ExitOutcome>) -> JobReport {
        if self.job.state != JobState::Cancelled {
            self.advance(JobState::Cancelled);
        }
        let cleanup = self.cleanup().await;
        self.aggregator.emit_empty(&self.signals);
        self.send(JobSignal::Cancelled);
        info!(?cleanup, "recovery job cancelled");
        self.report(exit, 0, cleanup)
    }

    async fn finish_disk_full(mut self, exit: Option<ExitOutcome>) -> JobReport {
        self.advance(JobState::DiskFullFailed);
        let cleanup = self.cleanup().await;
        let (free, needed) = self.disk_full;
        self.send(JobSignal::DiskFull {
            phase: DiskFullPhase::During,
            free,
            needed,
        });
        self.aggregator.emit_empty(&self.signals);
        warn!(?cleanup, "recovery job aborted: disk full");
        self.report(exit, 0, cleanup)
    }

    fn report(
        &self,
        exit: Option<ExitOutcome>,
        result_count: usize,
        cleanup: Option<CleanupOutcome>,
    ) -> JobReport {
        JobReport {
            id: self.job.id,
            state: self.job.state,
            workspace: self.job.workspace.clone(),
            result_count,
            exit_code: exit.and_then(|e| e.code),
            cleanup,
        }
    }
}
