use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::SupervisorError;

pub const KB: u64 = 1024;
pub const MB: u64 = KB * 1024;
pub const GB: u64 = MB * 1024;

pub const PREFLIGHT_REQUIRED_BYTES: u64 = 5 * GB;
pub const UNKNOWN_CATEGORY: &str = "unknown";
pub const CARVED_CATEGORY: &str = "carved";
pub const JDR_CATEGORY: &str = "jdr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Preflight,
    Running,
    CarvingWait,
    Carving,
    Aggregating,
    Done,
    Cancelled,
    DiskFullFailed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Cancelled | JobState::DiskFullFailed
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Idle, Preflight)
                | (Preflight, Running)
                | (Preflight, DiskFullFailed)
                | (Running, CarvingWait)
                | (Running, Aggregating)
                | (Running, Cancelled)
                | (Running, DiskFullFailed)
                | (CarvingWait, Carving)
                | (CarvingWait, Aggregating)
                | (CarvingWait, Cancelled)
                | (Carving, Aggregating)
                | (Carving, Cancelled)
                | (Aggregating, Done)
        )
    }

    /// Whether a cancellation request is still meaningful in this state.
    pub fn accepts_cancel(self) -> bool {
        matches!(
            self,
            JobState::Running | JobState::CarvingWait | JobState::Carving
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Preflight => "preflight",
            JobState::Running => "running",
            JobState::CarvingWait => "carving_wait",
            JobState::Carving => "carving",
            JobState::Aggregating => "aggregating",
            JobState::Done => "done",
            JobState::Cancelled => "cancelled",
            JobState::DiskFullFailed => "disk_full_failed",
        };
        write!(f, "{}", s)
    }
}

/// Why the job is being torn down. Written before any termination signal is
/// sent and read by the exit handler before it looks at the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitIntent {
    #[default]
    None,
    CancelRequested,
    DiskFullObserved,
}

#[derive(Debug, Clone)]
pub struct RecoveryJob {
    pub id: JobId,
    pub source: PathBuf,
    pub workspace: Option<PathBuf>,
    pub state: JobState,
}

impl RecoveryJob {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            id: JobId::new(),
            source: source.into(),
            workspace: None,
            state: JobState::Idle,
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<JobState, SupervisorError> {
        if !self.state.can_transition_to(next) {
            return Err(SupervisorError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        tracing::debug!(job_id = %self.id, from = %previous, to = %next, "job transition");
        Ok(previous)
    }

    /// Records the workspace the first time it is reported; later reports are ignored.
    pub fn adopt_workspace(&mut self, path: &Path) -> bool {
        if self.workspace.is_some() {
            return false;
        }
        self.workspace = Some(path.to_path_buf());
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFullPhase {
    Preflight,
    PreflightError,
    During,
}

impl fmt::Display for DiskFullPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskFullPhase::Preflight => write!(f, "preflight"),
            DiskFullPhase::PreflightError => write!(f, "preflight_error"),
            DiskFullPhase::During => write!(f, "during"),
        }
    }
}

/// Everything the core reports to its consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum JobSignal {
    Progress {
        processed: u64,
        total: u64,
        percent: f64,
    },
    AnalysisLocated {
        dir: PathBuf,
    },
    Results {
        files: Vec<ResultFile>,
    },
    Done,
    Cancelled,
    DiskFull {
        phase: DiskFullPhase,
        free: Option<u64>,
        needed: Option<u64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_rate: Option<f64>,
}

/// Slack-space recovery metadata attached to a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSlackInfo")]
pub struct SlackInfo {
    pub recovered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u64>,
}

// The engine reports the recovered media path under several keys depending on
// which recovery routine produced it.
#[derive(Deserialize)]
struct RawSlackInfo {
    #[serde(default)]
    recovered: Option<bool>,
    #[serde(default)]
    slack_rate: Option<f64>,
    #[serde(default)]
    slack_ratio_percent: Option<f64>,
    #[serde(default)]
    ratio: Option<f64>,
    #[serde(default)]
    media_path: Option<PathBuf>,
    #[serde(default)]
    video_path: Option<PathBuf>,
    #[serde(default)]
    video: Option<PathBuf>,
    #[serde(default)]
    output_path: Option<PathBuf>,
    #[serde(default)]
    recovered_slack_path: Option<PathBuf>,
    #[serde(default)]
    frame_count: Option<u64>,
}

impl From<RawSlackInfo> for SlackInfo {
    fn from(raw: RawSlackInfo) -> Self {
        Self {
            recovered: raw.recovered.unwrap_or(false),
            ratio: raw.ratio.or(raw.slack_rate).or(raw.slack_ratio_percent),
            media_path: raw
                .media_path
                .or(raw.video_path)
                .or(raw.video)
                .or(raw.output_path)
                .or(raw.recovered_slack_path),
            frame_count: raw.frame_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawResultFile")]
pub struct ResultFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_video: Option<PathBuf>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<String, ChannelInfo>,
    #[serde(rename = "slack_info", skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackInfo>,
    #[serde(rename = "remuxFailed")]
    pub remux_failed: bool,
}

#[derive(Deserialize)]
struct RawResultFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    size: Option<Value>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    origin_video: Option<PathBuf>,
    #[serde(default)]
    channels: Option<BTreeMap<String, ChannelInfo>>,
    #[serde(default)]
    slack_info: Option<SlackInfo>,
    #[serde(default, rename = "remuxFailed")]
    remux_failed: Option<bool>,
}

impl From<RawResultFile> for ResultFile {
    fn from(raw: RawResultFile) -> Self {
        let path = raw.path.unwrap_or_default();
        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| file_name_of(&path));
        let category = raw
            .category
            .or(raw.group)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());

        Self {
            name,
            path,
            size: raw.size.as_ref().map(parse_size).unwrap_or(0),
            category,
            origin_video: raw.origin_video,
            channels: raw.channels.unwrap_or_default(),
            slack: raw.slack_info,
            remux_failed: raw.remux_failed.unwrap_or(false),
        }
    }
}

impl ResultFile {
    pub fn new(path: impl Into<PathBuf>, size: u64, category: &str) -> Self {
        let path = path.into();
        Self {
            name: file_name_of(&path),
            path,
            size,
            category: category.to_string(),
            origin_video: None,
            channels: BTreeMap::new(),
            slack: None,
            remux_failed: false,
        }
    }

    pub fn has_known_category(&self) -> bool {
        !self.category.is_empty() && self.category != UNKNOWN_CATEGORY
    }

    /// Fills in the category from the first directory below `workspace` when
    /// the engine did not supply one.
    pub fn resolve_category(&mut self, workspace: Option<&Path>) {
        if self.has_known_category() {
            return;
        }
        self.category = workspace
            .and_then(|ws| self.path.strip_prefix(ws).ok())
            .and_then(|rel| {
                let mut parts = rel.components();
                let first = parts.next()?;
                // A bare file directly in the workspace has no grouping segment.
                parts.next()?;
                Some(first.as_os_str().to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());
    }
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Parses the engine's size field: plain integers, floats, or the
/// human-readable form `"12.5 MB"`. Anything unreadable counts as zero.
pub fn parse_size(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .unwrap_or(0),
        Value::String(s) => parse_human_size(s).unwrap_or(0),
        _ => 0,
    }
}

fn parse_human_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    if number < 0.0 {
        return None;
    }
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" | "KIB" => KB,
        "MB" | "M" | "MIB" => MB,
        "GB" | "G" | "GIB" => GB,
        "TB" | "T" | "TIB" => GB * 1024,
        _ => return None,
    };
    Some((number * multiplier as f64).round() as u64)
}

/// Terminal index written by the volume carver.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CarveIndex {
    #[serde(default)]
    pub items: Vec<CarveIndexEntry>,
    #[serde(default)]
    pub targets: Vec<CarveTarget>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CarveTarget {
    #[serde(default)]
    pub items: Vec<CarveIndexEntry>,
}

impl CarveIndex {
    pub fn entries(&self) -> impl Iterator<Item = &CarveIndexEntry> {
        self.items
            .iter()
            .chain(self.targets.iter().flat_map(|t| t.items.iter()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CarveIndexEntry {
    #[serde(default)]
    pub bin: Option<PathBuf>,
    #[serde(default)]
    pub rebuilt: Vec<RebuiltCandidate>,
    #[serde(default)]
    pub jdr: Vec<UnallocatedCandidate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RebuiltCandidate {
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub raw: Option<PathBuf>,
    #[serde(default)]
    pub rebuilt: Option<PathBuf>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub probe: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnallocatedCandidate {
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub es: Option<PathBuf>,
    #[serde(default)]
    pub rebuilt: Option<PathBuf>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub codec: Option<String>,
}
