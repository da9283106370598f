//! Result aggregation
//!
//! Three producers feed one list: the primary engine's inline payload, the
//! analysis file it points at, and the carve index. The aggregator hands the
//! merged list out exactly once per job.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::SupervisorError;
use crate::events::parse_result_records;
use crate::types::{JobSignal, ResultFile};

#[derive(Debug, Default)]
pub struct ResultAggregator {
    inline: Vec<ResultFile>,
    analysis: Vec<ResultFile>,
    carved: Vec<ResultFile>,
    emitted: bool,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_inline(&mut self, files: Vec<ResultFile>) {
        self.inline.extend(files);
    }

    pub fn add_carved(&mut self, files: Vec<ResultFile>) {
        self.carved.extend(files);
    }

    /// Reads an analysis file (a JSON array of result records). Read and parse
    /// failures come back as `ResultRead`; the caller decides whether to care.
    pub async fn add_analysis_file(&mut self, path: &Path) -> Result<usize, SupervisorError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SupervisorError::result_read(path, e))?;
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|e| SupervisorError::result_read(path, e))?;
        if !value.is_array() {
            return Err(SupervisorError::result_read(path, "expected a JSON array"));
        }

        let files = parse_result_records(&value);
        let count = files.len();
        debug!(path = %path.display(), count, "analysis results loaded");
        self.analysis.extend(files);
        Ok(count)
    }

    pub fn is_emitted(&self) -> bool {
        self.emitted
    }

    pub fn pending(&self) -> usize {
        self.inline.len() + self.analysis.len() + self.carved.len()
    }

    /// Merged list: producer order inline, analysis, carve; the first entry
    /// for a path wins. Missing categories are filled from the workspace layout.
    pub fn merged(&self, workspace: Option<&Path>) -> Vec<ResultFile> {
        let mut seen = HashSet::new();
        self.inline
            .iter()
            .chain(&self.analysis)
            .chain(&self.carved)
            .filter(|file| seen.insert(file.path.clone()))
            .cloned()
            .map(|mut file| {
                file.resolve_category(workspace);
                file
            })
            .collect()
    }

    /// The merged list the first time, `None` afterwards.
    pub fn finalize(&mut self, workspace: Option<&Path>) -> Option<Vec<ResultFile>> {
        if self.emitted {
            return None;
        }
        self.emitted = true;
        Some(self.merged(workspace))
    }

    /// Sends the final `Results` signal unless it was already sent.
    pub fn emit(&mut self, workspace: Option<&Path>, sink: &UnboundedSender<JobSignal>) -> bool {
        let Some(files) = self.finalize(workspace) else {
            return false;
        };
        if sink.send(JobSignal::Results { files }).is_err() {
            warn!("results consumer is gone");
        }
        true
    }

    /// Sends an empty `Results` signal unless one was already sent.
    pub fn emit_empty(&mut self, sink: &UnboundedSender<JobSignal>) -> bool {
        if self.emitted {
            return false;
        }
        self.emitted = true;
        if sink.send(JobSignal::Results { files: Vec::new() }).is_err() {
            warn!("results consumer is gone");
        }
        true
    }
}
