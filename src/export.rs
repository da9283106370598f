//! Export of selected results
//!
//! Hands a selection back to the primary engine, which copies the chosen
//! media out of the workspace into the destination directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::io::BufReader;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::events::{EngineEvent, EventReader};
use crate::process;
use crate::types::file_name_of;
use crate::workspace::WorkspaceManager;

pub const SELECTION_FILE: &str = "selected_files.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportChoice {
    Video,
    Frames,
    Both,
}

impl ExportChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportChoice::Video => "video",
            ExportChoice::Frames => "frames",
            ExportChoice::Both => "both",
        }
    }
}

impl fmt::Display for ExportChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportChoice {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(ExportChoice::Video),
            "frames" => Ok(ExportChoice::Frames),
            "both" => Ok(ExportChoice::Both),
            other => Err(SupervisorError::InvalidExport(format!(
                "unknown export choice `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub workspace: PathBuf,
    pub choice: ExportChoice,
    pub destination: PathBuf,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub copied: u64,
    pub copied_slack: u64,
    pub exit_code: Option<i32>,
}

impl ExportRequest {
    fn validate(&self, workspaces: &WorkspaceManager) -> Result<(), SupervisorError> {
        if self.workspace.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidExport("workspace is empty".into()));
        }
        if self.destination.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidExport("destination is empty".into()));
        }
        if self.files.is_empty() {
            return Err(SupervisorError::InvalidExport("no files selected".into()));
        }
        workspaces
            .validate(&self.workspace)
            .map_err(|reason| SupervisorError::InvalidExport(format!("workspace rejected: {reason}")))
    }

    /// Base names of the selection, the form the engine matches against.
    pub fn selected_names(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|p| file_name_of(p))
            .filter(|n| !n.is_empty())
            .collect()
    }
}

pub async fn write_selection(workspace: &Path, names: &[String]) -> Result<PathBuf, SupervisorError> {
    let path = workspace.join(SELECTION_FILE);
    let body = serde_json::to_vec_pretty(names)
        .map_err(|e| SupervisorError::InvalidExport(e.to_string()))?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

pub async fn run_export(
    config: &SupervisorConfig,
    request: &ExportRequest,
) -> Result<ExportReport, SupervisorError> {
    let workspaces = WorkspaceManager::from_config(config);
    request.validate(&workspaces)?;

    let names = request.selected_names();
    let selection = write_selection(&request.workspace, &names).await?;
    info!(
        workspace = %request.workspace.display(),
        choice = %request.choice,
        count = names.len(),
        "export started"
    );

    let args = [
        request.workspace.as_os_str().to_os_string(),
        request.choice.as_str().into(),
        request.destination.as_os_str().to_os_string(),
        selection.as_os_str().to_os_string(),
    ];
    let spawned = process::spawn(&config.engine, &args)?;
    if let Some(stderr) = spawned.stderr {
        process::forward_stderr(stderr, spawned.handle.program());
    }

    let mut report = ExportReport::default();
    if let Some(stdout) = spawned.stdout {
        let mut reader = EventReader::new(BufReader::new(stdout));
        loop {
            match reader.next_event().await {
                Ok(Some(EngineEvent::DownloadStats {
                    copied,
                    copied_slack,
                })) => {
                    report.copied = copied;
                    report.copied_slack = copied_slack;
                }
                Ok(Some(EngineEvent::Unrecognized { raw_line })) => {
                    if !raw_line.trim().is_empty() {
                        debug!("export: {}", raw_line);
                    }
                }
                Ok(Some(event)) => debug!(kind = event.kind(), "export record"),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "export stdout read failed");
                    break;
                }
            }
        }
    }

    let exit = spawned.handle.wait().await;
    report.exit_code = exit.code;
    if !exit.success() {
        return Err(SupervisorError::ExportFailed { code: exit.code });
    }

    info!(
        copied = report.copied,
        copied_slack = report.copied_slack,
        "export finished"
    );
    Ok(report)
}
