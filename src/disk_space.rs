//! Disk space guard
//!
//! Free/total capacity of the filesystem holding a path. Used as the preflight
//! gate before any engine is spawned.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub free: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityCheck {
    pub ok: bool,
    pub free: u64,
    pub total: u64,
}

/// Source of capacity figures. The system implementation asks the OS; tests
/// substitute fixed numbers.
pub trait CapacityProbe: Send + Sync {
    fn capacity(&self, path: &Path) -> io::Result<Capacity>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCapacityProbe;

impl CapacityProbe for SystemCapacityProbe {
    fn capacity(&self, path: &Path) -> io::Result<Capacity> {
        query_capacity(&volume_root(path))
    }
}

/// Fixed answer, or a fixed failure when `free` is `None`.
#[derive(Debug, Clone, Copy)]
pub struct StaticCapacityProbe {
    pub free: Option<u64>,
    pub total: u64,
}

impl CapacityProbe for StaticCapacityProbe {
    fn capacity(&self, _path: &Path) -> io::Result<Capacity> {
        match self.free {
            Some(free) => Ok(Capacity {
                free,
                total: self.total,
            }),
            None => Err(io::Error::other("capacity unavailable")),
        }
    }
}

pub fn check_capacity(
    probe: &dyn CapacityProbe,
    target: &Path,
    required_bytes: u64,
) -> Result<CapacityCheck, SupervisorError> {
    let Capacity { free, total } =
        probe
            .capacity(target)
            .map_err(|source| SupervisorError::CapacityQuery {
                path: target.to_path_buf(),
                source,
            })?;

    Ok(CapacityCheck {
        ok: free >= required_bytes,
        free,
        total,
    })
}

/// The path the OS should be asked about: the drive root on Windows, the
/// nearest existing ancestor elsewhere.
pub fn volume_root(path: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        use std::path::Component;
        let root: PathBuf = path
            .components()
            .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
            .collect();
        if !root.as_os_str().is_empty() {
            return root;
        }
    }

    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(unix)]
fn query_capacity(path: &Path) -> io::Result<Capacity> {
    let stat = rustix::fs::statvfs(path)?;
    let fragment = if stat.f_frsize > 0 {
        stat.f_frsize
    } else {
        stat.f_bsize
    };

    Ok(Capacity {
        free: stat.f_bavail.saturating_mul(fragment),
        total: stat.f_blocks.saturating_mul(fragment),
    })
}

#[cfg(windows)]
fn query_capacity(path: &Path) -> io::Result<Capacity> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;

    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    let mut free = 0u64;
    let mut total = 0u64;
    let mut total_free = 0u64;
    let result =
        unsafe { GetDiskFreeSpaceExW(wide.as_ptr(), &mut free, &mut total, &mut total_free) };

    if result == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(Capacity { free, total })
    }
}

#[cfg(not(any(unix, windows)))]
fn query_capacity(_path: &Path) -> io::Result<Capacity> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Not supported on this platform",
    ))
}
