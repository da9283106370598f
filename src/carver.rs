//! Volume carving phase
//!
//! Runs the carver against a ready workspace, then turns its index file into
//! result entries. Nothing here fails the job: a missing or unreadable index
//! falls back to listing the carved directory, and a carver that cannot be
//! started simply contributes no results.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tracing::{debug, info, warn};

use crate::config::{EngineCommand, SupervisorConfig};
use crate::control::JobControl;
use crate::error::SupervisorError;
use crate::events::{EngineEvent, EventReader};
use crate::process::{self, ExitOutcome};
use crate::types::{CARVED_CATEGORY, CarveIndex, JDR_CATEGORY, ResultFile};

#[derive(Debug)]
pub enum CarveRun {
    Completed {
        exit: ExitOutcome,
        files: Vec<ResultFile>,
    },
    Cancelled,
    SpawnFailed,
}

pub fn carver_args(workspace: &Path, tool_dir: Option<&Path>) -> Vec<OsString> {
    let mut args = vec![workspace.as_os_str().to_os_string()];
    if let Some(dir) = tool_dir {
        args.push("--ffmpeg-dir".into());
        args.push(dir.as_os_str().to_os_string());
    }
    args
}

/// Runs the carver to completion, or until the job's exit intent is set.
pub async fn run_carver(
    config: &SupervisorConfig,
    command: &EngineCommand,
    workspace: &Path,
    control: &JobControl,
) -> CarveRun {
    if control.is_set() {
        return CarveRun::Cancelled;
    }

    let args = carver_args(workspace, config.tool_dir.as_deref());
    let spawned = match process::spawn(command, &args) {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!(error = %e, "carver could not be started, skipping carve phase");
            return CarveRun::SpawnFailed;
        }
    };

    let handle = spawned.handle;
    if let Some(stderr) = spawned.stderr {
        process::forward_stderr(stderr, handle.program());
    }
    if let Some(stdout) = spawned.stdout {
        tokio::spawn(async move {
            let mut reader = EventReader::new(BufReader::new(stdout));
            while let Ok(Some(event)) = reader.next_event().await {
                if let EngineEvent::Unrecognized { raw_line } = &event {
                    if !raw_line.trim().is_empty() {
                        debug!("carver: {}", raw_line);
                    }
                } else {
                    debug!(kind = event.kind(), "carver record");
                }
            }
        });
    }

    let exit = tokio::select! {
        exit = handle.wait() => exit,
        _ = control.wait() => {
            let outcome = handle.terminate(config.terminate_grace()).await;
            info!(?outcome, "carver terminated");
            return CarveRun::Cancelled;
        }
    };

    if !exit.success() {
        warn!(code = ?exit.code, "carver exited with failure, reading whatever it left");
    }

    let config = config.clone();
    let workspace = workspace.to_path_buf();
    let files = tokio::task::spawn_blocking(move || collect_carved(&config, &workspace))
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "carve collection task failed");
            Vec::new()
        });

    CarveRun::Completed { exit, files }
}

/// Results of a finished carve: the index when it can be found and read,
/// otherwise a listing of the carved directory.
pub fn collect_carved(config: &SupervisorConfig, workspace: &Path) -> Vec<ResultFile> {
    if let Some(index_path) = locate_index(
        workspace,
        &config.carve_index_name,
        &config.carve_search_dirs,
        config.carve_search_depth,
    ) {
        match read_index(&index_path) {
            Ok(index) => {
                let base = index_path.parent().unwrap_or(workspace);
                let files = flatten_index(&index, base);
                info!(
                    index = %index_path.display(),
                    count = files.len(),
                    "carve index read"
                );
                return files;
            }
            Err(e) => warn!(error = %e, "carve index unusable, scanning carved directory"),
        }
    } else {
        debug!(workspace = %workspace.display(), "no carve index found");
    }

    scan_carved_dir(&workspace.join(&config.carved_dir))
}

/// The index at the workspace root, else a breadth-first search through the
/// candidate subdirectories down to `max_depth` levels.
pub fn locate_index(
    workspace: &Path,
    name: &str,
    candidates: &[String],
    max_depth: usize,
) -> Option<PathBuf> {
    let direct = workspace.join(name);
    if direct.is_file() {
        return Some(direct);
    }

    let mut queue: VecDeque<(PathBuf, usize)> = candidates
        .iter()
        .map(|c| (workspace.join(c), 1))
        .filter(|(dir, _)| dir.is_dir())
        .collect();

    while let Some((dir, depth)) = queue.pop_front() {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if depth >= max_depth {
            continue;
        }
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        children.sort();
        queue.extend(children.into_iter().map(|c| (c, depth + 1)));
    }

    None
}

pub fn read_index(path: &Path) -> Result<CarveIndex, SupervisorError> {
    let bytes = fs::read(path).map_err(|e| SupervisorError::result_read(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| SupervisorError::result_read(path, e))
}

/// Flattens both candidate lists. Failed rebuilds are kept, pointing at the
/// raw stream and flagged `remux_failed`.
pub fn flatten_index(index: &CarveIndex, base: &Path) -> Vec<ResultFile> {
    let mut files = Vec::new();

    for entry in index.entries() {
        for candidate in &entry.rebuilt {
            let chosen = if candidate.ok {
                candidate.rebuilt.as_ref().or(candidate.raw.as_ref())
            } else {
                candidate.raw.as_ref().or(candidate.rebuilt.as_ref())
            };
            if let Some(path) = chosen {
                files.push(carved_file(base, path, CARVED_CATEGORY, !candidate.ok));
            }
        }

        for candidate in &entry.jdr {
            let chosen = if candidate.ok {
                candidate.rebuilt.as_ref().or(candidate.es.as_ref())
            } else {
                candidate.es.as_ref().or(candidate.rebuilt.as_ref())
            };
            if let Some(path) = chosen {
                files.push(carved_file(base, path, JDR_CATEGORY, !candidate.ok));
            }
        }
    }

    files
}

fn carved_file(base: &Path, path: &Path, category: &str, remux_failed: bool) -> ResultFile {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let mut file = ResultFile::new(path, size, category);
    file.remux_failed = remux_failed;
    file
}

/// Non-empty regular files directly inside `dir`, sorted by name.
pub fn scan_carved_dir(dir: &Path) -> Vec<ResultFile> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut files: Vec<ResultFile> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            (meta.is_file() && meta.len() > 0)
                .then(|| ResultFile::new(e.path(), meta.len(), CARVED_CATEGORY))
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}
