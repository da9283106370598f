//! Workspace lifecycle
//!
//! A workspace is only ever removed when it sits strictly below the temp root
//! and its directory name carries one of the configured job prefixes. The
//! check is component-wise over the whole path, drive prefix and root
//! included, so `/tmp/Virex_1` never matches a root of `/tm` and `..`
//! segments are refused outright. A relative temp root matches nothing.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnsafeWorkspace {
    #[error("path is not absolute")]
    Relative,

    #[error("path contains parent-directory segments")]
    ParentTraversal,

    #[error("path is not strictly under {}", .0.display())]
    OutsideTempRoot(PathBuf),

    #[error("directory name carries no job prefix")]
    MissingPrefix,

    #[error("path is a symlink")]
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted { attempts: u32 },
    Missing,
    Refused(UnsafeWorkspace),
    Failed { attempts: u32 },
}

impl CleanupOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, CleanupOutcome::Deleted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    temp_root: PathBuf,
    prefixes: Vec<String>,
    retries: u32,
    retry_delay: Duration,
}

impl WorkspaceManager {
    pub fn new(temp_root: impl Into<PathBuf>, prefixes: Vec<String>) -> Self {
        Self {
            temp_root: temp_root.into(),
            prefixes,
            retries: 2,
            retry_delay: Duration::from_millis(150),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.temp_root(), config.workspace_prefixes.clone())
            .with_retries(config.cleanup_retries, config.cleanup_retry_delay())
    }

    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn validate(&self, path: &Path) -> Result<(), UnsafeWorkspace> {
        if !self.temp_root.is_absolute() {
            return Err(UnsafeWorkspace::OutsideTempRoot(self.temp_root.clone()));
        }
        if !path.is_absolute() {
            return Err(UnsafeWorkspace::Relative);
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(UnsafeWorkspace::ParentTraversal);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        let prefixed = self
            .prefixes
            .iter()
            .any(|p| name.len() > p.len() && name.starts_with(p.as_str()));
        if !prefixed {
            return Err(UnsafeWorkspace::MissingPrefix);
        }

        if !self.is_under_root(path) {
            return Err(UnsafeWorkspace::OutsideTempRoot(self.temp_root.clone()));
        }
        Ok(())
    }

    pub fn is_safe(&self, path: &Path) -> bool {
        self.validate(path).is_ok()
    }

    // Temp roots are often reached through a symlink (macOS /tmp), so the
    // canonical forms are compared too.
    fn is_under_root(&self, path: &Path) -> bool {
        if strictly_under(path, &self.temp_root) {
            return true;
        }
        let Ok(root) = self.temp_root.canonicalize() else {
            return false;
        };
        let candidate = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        strictly_under(&candidate, &root) || strictly_under(path, &root)
    }

    pub async fn safe_delete(&self, path: &Path) -> CleanupOutcome {
        self.delete_with(path, |p: &Path| std::fs::remove_dir_all(p))
            .await
    }

    async fn delete_with<F>(&self, path: &Path, remove: F) -> CleanupOutcome
    where
        F: Fn(&Path) -> io::Result<()> + Clone + Send + 'static,
    {
        if let Err(reason) = self.validate(path) {
            warn!(path = %path.display(), %reason, "refusing to delete workspace");
            return CleanupOutcome::Refused(reason);
        }

        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!(path = %path.display(), "refusing to delete symlinked workspace");
                return CleanupOutcome::Refused(UnsafeWorkspace::Symlink);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "workspace already gone");
                return CleanupOutcome::Missing;
            }
            Err(_) => {}
        }

        let max_attempts = self.retries + 1;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let target = path.to_path_buf();
            let remover = remove.clone();
            let removed = tokio::task::spawn_blocking(move || remover(&target))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e)));
            match removed {
                Ok(()) => {
                    info!(path = %path.display(), attempts, "workspace deleted");
                    return CleanupOutcome::Deleted { attempts };
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return CleanupOutcome::Deleted { attempts };
                }
                Err(source) if attempts >= max_attempts => {
                    let err = SupervisorError::Cleanup {
                        path: path.to_path_buf(),
                        attempts,
                        source,
                    };
                    warn!(error = %err, "workspace cleanup gave up");
                    return CleanupOutcome::Failed { attempts };
                }
                Err(e) => {
                    debug!(path = %path.display(), attempts, error = %e, "delete failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Removes every leftover workspace directly under the temp root.
    pub async fn purge_stale(&self) -> io::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.temp_root).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let path = entry.path();
            if !is_dir || !self.is_safe(&path) {
                continue;
            }
            if self.safe_delete(&path).await.is_deleted() {
                removed += 1;
            }
        }
        info!(root = %self.temp_root.display(), removed, "stale workspaces purged");
        Ok(removed)
    }
}

/// `child` starts with every component of `parent`, prefix and root
/// included, and has at least one more.
fn strictly_under(child: &Path, parent: &Path) -> bool {
    child.starts_with(parent) && child.components().count() > parent.components().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn manager(root: &Path) -> WorkspaceManager {
        WorkspaceManager::new(root, vec!["Virex_".to_string()])
            .with_retries(2, Duration::from_millis(1))
    }

    #[test]
    fn test_component_prefix_not_string_prefix() {
        assert!(strictly_under(Path::new("/tmp/a/Virex_1"), Path::new("/tmp")));
        assert!(!strictly_under(Path::new("/tmpx/Virex_1"), Path::new("/tmp")));
        assert!(!strictly_under(Path::new("/tmp"), Path::new("/tmp")));
        assert!(!strictly_under(Path::new("/tmp/Virex_1"), Path::new("tmp")));
    }

    #[test]
    fn test_relative_root_refuses_absolute_lookalike() {
        let mgr = manager(Path::new("tmp"));
        assert_eq!(
            mgr.validate(Path::new("/tmp/Virex_x")),
            Err(UnsafeWorkspace::OutsideTempRoot(PathBuf::from("tmp")))
        );
        assert!(!mgr.is_safe(&std::env::current_dir().unwrap().join("tmp/Virex_x")));
    }

    #[cfg(windows)]
    #[test]
    fn test_other_drive_is_outside_root() {
        let mgr = manager(Path::new(r"C:\Temp"));
        assert!(mgr.is_safe(Path::new(r"C:\Temp\Virex_x")));
        assert_eq!(
            mgr.validate(Path::new(r"D:\Temp\Virex_x")),
            Err(UnsafeWorkspace::OutsideTempRoot(PathBuf::from(r"C:\Temp")))
        );
    }

    #[test]
    fn test_validate_rules() {
        let mgr = manager(Path::new("/scratch"));
        assert!(mgr.is_safe(Path::new("/scratch/Virex_abc")));
        assert_eq!(
            mgr.validate(Path::new("scratch/Virex_abc")),
            Err(UnsafeWorkspace::Relative)
        );
        assert_eq!(
            mgr.validate(Path::new("/scratch/../Virex_abc")),
            Err(UnsafeWorkspace::ParentTraversal)
        );
        assert_eq!(
            mgr.validate(Path::new("/scratch/Virex_")),
            Err(UnsafeWorkspace::MissingPrefix)
        );
        assert_eq!(
            mgr.validate(Path::new("/home/Virex_abc")),
            Err(UnsafeWorkspace::OutsideTempRoot(PathBuf::from("/scratch")))
        );
    }

    #[tokio::test]
    async fn test_retry_budget_is_three_attempts() {
        let root = tempdir().unwrap();
        let ws = root.path().join("Virex_locked");
        std::fs::create_dir(&ws).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = manager(root.path())
            .delete_with(&ws, move |_: &Path| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
            })
            .await;

        assert_eq!(outcome, CleanupOutcome::Failed { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_succeeds_on_second_attempt() {
        let root = tempdir().unwrap();
        let ws = root.path().join("Virex_flaky");
        std::fs::create_dir(&ws).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = manager(root.path())
            .delete_with(&ws, move |p: &Path| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(io::Error::other("busy"))
                } else {
                    std::fs::remove_dir_all(p)
                }
            })
            .await;

        assert_eq!(outcome, CleanupOutcome::Deleted { attempts: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!ws.exists());
    }

    #[tokio::test]
    async fn test_removal_runs_off_the_async_thread() {
        let root = tempdir().unwrap();
        let ws = root.path().join("Virex_blocking");
        std::fs::create_dir(&ws).unwrap();

        let caller = std::thread::current().id();
        let outcome = manager(root.path())
            .delete_with(&ws, move |p: &Path| {
                if std::thread::current().id() == caller {
                    return Err(io::Error::other("removal ran on the runtime thread"));
                }
                std::fs::remove_dir_all(p)
            })
            .await;

        assert_eq!(outcome, CleanupOutcome::Deleted { attempts: 1 });
    }
}
