use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::JobState;

/// Errors raised while supervising a recovery job.
///
/// Only the two disk-full variants abort a job. The remaining soft variants
/// are built so they can be logged with full context, then absorbed.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Not enough free space before start: {free} bytes free, {needed} bytes needed")]
    PreflightDiskFull { free: u64, needed: u64 },

    #[error("Engine ran out of disk space (free: {free:?}, needed: {needed:?})")]
    RuntimeDiskFull {
        free: Option<u64>,
        needed: Option<u64>,
    },

    #[error("Failed to spawn engine `{program}`: {source}")]
    EngineSpawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Engine exited with failure code {code:?}")]
    EngineNonzeroExit { code: Option<i32> },

    #[error("Failed to read results from {}: {reason}", path.display())]
    ResultRead { path: PathBuf, reason: String },

    #[error("Readiness not reached under {} after {waited:?}", dir.display())]
    ReadinessTimeout { dir: PathBuf, waited: Duration },

    #[error("Failed to remove workspace {} after {attempts} attempts: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Capacity query failed for {}: {source}", path.display())]
    CapacityQuery {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Invalid export request: {0}")]
    InvalidExport(String),

    #[error("Export engine exited with failure code {code:?}")]
    ExportFailed { code: Option<i32> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl SupervisorError {
    pub fn result_read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SupervisorError::ResultRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error ends the job, as opposed to degrading its results.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::PreflightDiskFull { .. } | SupervisorError::RuntimeDiskFull { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
