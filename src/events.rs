//! Engine output classification
//!
//! Every stdout line of an engine is tried as a JSON record and mapped to
//! exactly one [`EngineEvent`]. The checks run in a fixed precedence order and
//! the first match returns, so a record carrying several recognisable fields
//! still yields a single event.

use std::path::PathBuf;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

use crate::types::{DiskFullPhase, ResultFile};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress {
        processed: u64,
        total: u64,
    },
    WorkspaceAnnounced {
        path: PathBuf,
    },
    ExtractDone {
        output_dir: Option<PathBuf>,
        results: Vec<ResultFile>,
    },
    DiskFull {
        free: Option<u64>,
        needed: Option<u64>,
        phase: DiskFullPhase,
    },
    AnalysisReady {
        path: PathBuf,
    },
    DownloadStats {
        copied: u64,
        copied_slack: u64,
    },
    Unrecognized {
        raw_line: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Progress { .. } => "progress",
            EngineEvent::WorkspaceAnnounced { .. } => "workspace_announced",
            EngineEvent::ExtractDone { .. } => "extract_done",
            EngineEvent::DiskFull { .. } => "disk_full",
            EngineEvent::AnalysisReady { .. } => "analysis_ready",
            EngineEvent::DownloadStats { .. } => "download_stats",
            EngineEvent::Unrecognized { .. } => "unrecognized",
        }
    }
}

pub fn classify_line(line: &str) -> EngineEvent {
    let trimmed = line.trim();
    let record = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map,
        _ => {
            return EngineEvent::Unrecognized {
                raw_line: line.to_string(),
            };
        }
    };

    classify_record(&record).unwrap_or_else(|| EngineEvent::Unrecognized {
        raw_line: line.to_string(),
    })
}

fn classify_record(record: &Map<String, Value>) -> Option<EngineEvent> {
    let event = record.get("event").and_then(Value::as_str);

    if event == Some("disk_full") {
        let phase = match record.get("phase").and_then(Value::as_str) {
            Some("preflight") => DiskFullPhase::Preflight,
            _ => DiskFullPhase::During,
        };
        return Some(EngineEvent::DiskFull {
            free: record.get("free").and_then(Value::as_u64),
            needed: record.get("needed").and_then(Value::as_u64),
            phase,
        });
    }

    if let Some(path) = non_empty_path(record, "tempDir") {
        return Some(EngineEvent::WorkspaceAnnounced { path });
    }

    if event == Some("extract_done") {
        return Some(EngineEvent::ExtractDone {
            output_dir: non_empty_path(record, "output_dir"),
            results: record
                .get("results")
                .map(parse_result_records)
                .unwrap_or_default(),
        });
    }

    if let (Some(processed), Some(total)) = (
        record.get("processed").and_then(Value::as_u64),
        record.get("total").and_then(Value::as_u64),
    ) {
        return Some(EngineEvent::Progress { processed, total });
    }

    if let Some(path) = non_empty_path(record, "analysisPath") {
        return Some(EngineEvent::AnalysisReady { path });
    }

    if event == Some("download_stats") {
        return Some(EngineEvent::DownloadStats {
            copied: record.get("copied").and_then(Value::as_u64).unwrap_or(0),
            copied_slack: record
                .get("copied_slack")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });
    }

    None
}

fn non_empty_path(record: &Map<String, Value>, key: &str) -> Option<PathBuf> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// Parses an array of result records. Records that are not objects or do not
/// deserialize are skipped; the rest of the batch survives.
pub fn parse_result_records(value: &Value) -> Vec<ResultFile> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            if !item.is_object() {
                warn!(index, "skipping non-object result record");
                return None;
            }
            match serde_json::from_value::<ResultFile>(item.clone()) {
                Ok(file) if file.path.as_os_str().is_empty() => {
                    warn!(index, "skipping result record without a path");
                    None
                }
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(index, error = %e, "skipping malformed result record");
                    None
                }
            }
        })
        .collect()
}

/// Progress as a percentage; zero when `total` is zero, never above 100.
pub fn percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (processed as f64 / total as f64 * 100.0).min(100.0)
}

/// Keeps reported progress non-decreasing across a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressTracker {
    last: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, processed: u64, total: u64) -> f64 {
        self.last = self.last.max(percent(processed, total));
        self.last
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

/// Line reader over an engine's stdout. Invalid UTF-8 is replaced rather than
/// treated as a read error.
pub struct EventReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> EventReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(256),
        }
    }

    /// Next raw line without its terminator, or `None` at end of stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    pub async fn next_event(&mut self) -> std::io::Result<Option<EngineEvent>> {
        Ok(self.next_line().await?.map(|line| classify_line(&line)))
    }
}
