//! Readiness watcher
//!
//! Polls the workspace for a carve-input subdirectory holding at least one
//! artifact. The poll stops early when the job records an exit intent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ReadinessConfig;
use crate::control::JobControl;
use crate::error::SupervisorError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("no carve input under {} after {waited:?}", dir.display())]
    Timeout { dir: PathBuf, waited: Duration },

    #[error("readiness wait cancelled")]
    Cancelled,
}

impl ReadinessError {
    pub fn into_supervisor_error(self) -> Option<SupervisorError> {
        match self {
            ReadinessError::Timeout { dir, waited } => {
                Some(SupervisorError::ReadinessTimeout { dir, waited })
            }
            ReadinessError::Cancelled => None,
        }
    }
}

/// First configured subdirectory of `base` containing a file with the
/// artifact suffix.
pub async fn find_ready_dir(base: &Path, config: &ReadinessConfig) -> Option<PathBuf> {
    let suffix = config.artifact_suffix.to_ascii_lowercase();
    for sub in &config.subdirs {
        let dir = base.join(sub);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
            if !name.ends_with(&suffix) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                return Some(dir);
            }
        }
    }
    None
}

pub async fn wait_for_ready(
    base: &Path,
    config: &ReadinessConfig,
    control: &JobControl,
) -> Result<PathBuf, ReadinessError> {
    let started = Instant::now();
    let deadline = started + config.timeout();

    loop {
        if control.is_set() {
            return Err(ReadinessError::Cancelled);
        }

        if let Some(dir) = find_ready_dir(base, config).await {
            debug!(dir = %dir.display(), "carve input ready");
            return Ok(dir);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReadinessError::Timeout {
                dir: base.to_path_buf(),
                waited: now - started,
            });
        }

        trace!(base = %base.display(), "carve input not ready yet");
        let pause = config.interval().min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = control.wait() => return Err(ReadinessError::Cancelled),
        }
    }
}
