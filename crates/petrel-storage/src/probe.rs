//! Disk usage probes
//!
//! Volumes never ask the filesystem for free space directly; they go
//! through [`DiskProbe`] so production volumes and test volumes share one
//! code path. The production probe wraps `statvfs` and resolves the mount
//! point the probed path lives on, which the volume set uses to avoid
//! double-counting volumes that share a physical disk.

use petrel_common::{Error, Result};
use std::path::{Path, PathBuf};

/// Space and mount queries for one volume root.
pub trait DiskProbe: Send + Sync {
    /// Total capacity in bytes of the filesystem holding the probed path
    fn capacity(&self) -> Result<u64>;

    /// Bytes currently available on that filesystem
    fn available(&self) -> Result<u64>;

    /// Identifier of the mount the probed path lives on
    fn mount_id(&self) -> Result<String>;
}

/// `statvfs`-backed probe for a real directory.
#[derive(Debug, Clone)]
pub struct StatvfsProbe {
    path: PathBuf,
}

impl StatvfsProbe {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn statvfs(&self) -> Result<nix::sys::statvfs::Statvfs> {
        nix::sys::statvfs::statvfs(self.path.as_path())
            .map_err(|errno| Error::disk(&self.path, errno.into()))
    }
}

impl DiskProbe for StatvfsProbe {
    fn capacity(&self) -> Result<u64> {
        let vfs = self.statvfs()?;
        Ok(vfs.blocks() as u64 * vfs.fragment_size() as u64)
    }

    fn available(&self) -> Result<u64> {
        let vfs = self.statvfs()?;
        Ok(vfs.blocks_available() as u64 * vfs.fragment_size() as u64)
    }

    #[cfg(target_os = "linux")]
    fn mount_id(&self) -> Result<String> {
        let target = self
            .path
            .canonicalize()
            .map_err(|e| Error::disk(&self.path, e))?;
        let mounts = std::fs::read_to_string("/proc/self/mounts")
            .map_err(|e| Error::disk("/proc/self/mounts", e))?;
        Ok(longest_mount_prefix(&mounts, &target)
            .map_or_else(|| target.display().to_string(), str::to_owned))
    }

    // Without a mount table every volume counts as its own disk, which
    // overstates aggregate capacity when volumes share one.
    #[cfg(not(target_os = "linux"))]
    fn mount_id(&self) -> Result<String> {
        let target = self
            .path
            .canonicalize()
            .map_err(|e| Error::disk(&self.path, e))?;
        Ok(target.display().to_string())
    }
}

/// Pick the longest mount point that is a path prefix of `target`.
#[cfg(target_os = "linux")]
fn longest_mount_prefix<'a>(mounts: &'a str, target: &Path) -> Option<&'a str> {
    let mut best: Option<&str> = None;
    for line in mounts.lines() {
        let Some(point) = line.split_whitespace().nth(1) else {
            continue;
        };
        if target.starts_with(point) && best.is_none_or(|b| point.len() > b.len()) {
            best = Some(point);
        }
    }
    best
}

/// Probe returning canned numbers, for tests that need deterministic
/// space accounting.
#[cfg(test)]
pub(crate) struct FixedProbe {
    pub capacity: u64,
    pub available: u64,
    pub mount: String,
}

#[cfg(test)]
impl FixedProbe {
    pub(crate) fn new(capacity: u64, available: u64, mount: &str) -> Self {
        Self { capacity, available, mount: mount.to_owned() }
    }
}

#[cfg(test)]
impl DiskProbe for FixedProbe {
    fn capacity(&self) -> Result<u64> {
        Ok(self.capacity)
    }

    fn available(&self) -> Result<u64> {
        Ok(self.available)
    }

    fn mount_id(&self) -> Result<String> {
        Ok(self.mount.clone())
    }
}
