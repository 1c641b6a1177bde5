//! Storage volumes and the volume set
//!
//! A volume is one physical storage mount: a shard tree under `data/`, a
//! staging area under `tmp/`, and a disk probe. The volume set spreads
//! new blocks across volumes round-robin, skipping any volume without
//! room, and aggregates space counting each mount once.

use crate::probe::DiskProbe;
use crate::shard::{self, Blocks, ShardTree};
use petrel_common::{Block, Error, Result, StorageConfig};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// Index of a volume within its set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VolumeId(usize);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One volume root: shard tree, staging dir, and space accounting.
pub struct Volume {
    root: PathBuf,
    tree: ShardTree,
    tmp_dir: PathBuf,
    reserved: u64,
    usable_fraction: f64,
    probe: Box<dyn DiskProbe>,
}

impl Volume {
    /// Open the volume rooted at `root`.
    ///
    /// Rebuilds the shard tree from whatever is under `data/` and wipes
    /// `tmp/`, so no staged file survives a restart.
    pub fn open(
        root: impl Into<PathBuf>,
        config: &StorageConfig,
        probe: Box<dyn DiskProbe>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::disk(&root, e))?;
        let tree = ShardTree::open(root.join("data"), config.max_blocks_per_directory)?;
        let tmp_dir = root.join("tmp");
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).map_err(|e| Error::disk(&tmp_dir, e))?;
        }
        fs::create_dir_all(&tmp_dir).map_err(|e| Error::disk(&tmp_dir, e))?;
        info!(volume = %root.display(), "opened volume");
        Ok(Self {
            root,
            tree,
            tmp_dir,
            reserved: config.reserved_space_bytes,
            usable_fraction: config.usable_disk_fraction,
            probe,
        })
    }

    /// Root directory of the volume.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Total capacity of the filesystem under this volume.
    pub fn capacity(&self) -> Result<u64> {
        self.probe.capacity()
    }

    /// Bytes this volume may still allocate: the usable fraction of the
    /// probed free space, minus the reserve.
    pub fn available(&self) -> Result<u64> {
        let probed = self.probe.available()?;
        let usable = (self.usable_fraction * probed as f64).round() as u64;
        Ok(usable.saturating_sub(self.reserved))
    }

    /// Mount the volume root lives on.
    pub fn mount_id(&self) -> Result<String> {
        self.probe.mount_id()
    }

    /// Create the empty staged file for a block about to be written.
    ///
    /// Fails if a staged file for this block already exists. The declared
    /// size comes out of the reserve and is not returned to it; the
    /// reserve resets to its configured value on restart.
    pub fn stage_block(&mut self, block: &Block) -> Result<PathBuf> {
        let staged = self.tmp_dir.join(block.filename());
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged)
            .map_err(|e| Error::disk(&staged, e))?;
        self.reserved = self.reserved.saturating_sub(block.num_bytes());
        Ok(staged)
    }

    /// Move a staged file to its permanent home in the shard tree.
    pub fn place_block(&mut self, block: &Block, staged: &Path) -> Result<PathBuf> {
        self.tree.place(block, staged)
    }

    /// Lazily iterate every block file on this volume.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_> {
        self.tree.blocks()
    }

    /// Verify the shard tree and the staging dir are usable.
    pub fn check_health(&self) -> Result<()> {
        self.tree.check_health()?;
        shard::check_dir(&self.tmp_dir)
    }

    /// Space snapshot for operator tooling.
    pub fn usage(&self) -> Result<VolumeUsage> {
        Ok(VolumeUsage {
            root: self.root.clone(),
            capacity: self.capacity()?,
            available: self.available()?,
            mount: self.mount_id()?,
        })
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

/// Point-in-time space numbers for one volume.
#[derive(Debug, Clone)]
pub struct VolumeUsage {
    pub root: PathBuf,
    pub capacity: u64,
    pub available: u64,
    pub mount: String,
}

/// All configured volumes plus the round-robin allocation cursor.
pub struct VolumeSet {
    volumes: Vec<Volume>,
    cursor: usize,
}

impl VolumeSet {
    /// Build a set over `volumes`; allocation starts at the first.
    #[must_use]
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self { volumes, cursor: 0 }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: VolumeId) -> &Volume {
        &self.volumes[id.0]
    }

    pub fn get_mut(&mut self, id: VolumeId) -> &mut Volume {
        &mut self.volumes[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (VolumeId, &Volume)> {
        self.volumes.iter().enumerate().map(|(i, v)| (VolumeId(i), v))
    }

    /// Pick the next volume with room for `required` bytes.
    ///
    /// Starts at the cursor and advances it past every volume probed, so
    /// load spreads evenly instead of filling the first volume to the
    /// brim. One full cycle without a fit fails with `OutOfSpace`.
    pub fn next_volume(&mut self, required: u64) -> Result<VolumeId> {
        for _ in 0..self.volumes.len() {
            let id = self.cursor;
            self.cursor = (self.cursor + 1) % self.volumes.len();
            if self.volumes[id].available()? >= required {
                return Ok(VolumeId(id));
            }
        }
        Err(Error::OutOfSpace { required })
    }

    /// Total capacity across distinct mounts.
    pub fn capacity(&self) -> Result<u64> {
        let mut seen = HashSet::new();
        let mut total = 0;
        for volume in &self.volumes {
            if seen.insert(volume.mount_id()?) {
                total += volume.capacity()?;
            }
        }
        Ok(total)
    }

    /// Total available space across distinct mounts.
    pub fn remaining(&self) -> Result<u64> {
        let mut seen = HashSet::new();
        let mut total = 0;
        for volume in &self.volumes {
            if seen.insert(volume.mount_id()?) {
                total += volume.available()?;
            }
        }
        Ok(total)
    }

    /// Check every volume, failing on the first unhealthy one.
    pub fn check_health(&self) -> Result<()> {
        for volume in &self.volumes {
            volume.check_health()?;
        }
        Ok(())
    }
}

impl fmt::Display for VolumeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for volume in &self.volumes {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{volume}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::FixedProbe;
    use petrel_common::BlockId;
    use tempfile::tempdir;

    fn config() -> StorageConfig {
        StorageConfig {
            data_dirs: Vec::new(),
            reserved_space_bytes: 0,
            usable_disk_fraction: 1.0,
            max_blocks_per_directory: 4,
        }
    }

    fn volume(root: &Path, available: u64, mount: &str) -> Volume {
        Volume::open(
            root,
            &config(),
            Box::new(FixedProbe::new(1 << 30, available, mount)),
        )
        .unwrap()
    }

    fn block(id: u64, len: u64) -> Block {
        Block::new(BlockId::new(id), len)
    }

    #[test]
    fn test_open_wipes_tmp() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("tmp").join("blk_3");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"leftover").unwrap();

        let v = volume(dir.path(), 1 << 20, "/m0");
        assert!(!stale.exists());
        assert!(v.root().join("tmp").is_dir());
        assert!(v.root().join("data").is_dir());
    }

    #[test]
    fn test_available_applies_fraction_and_reserve() {
        let dir = tempdir().unwrap();
        let cfg = StorageConfig {
            reserved_space_bytes: 300,
            usable_disk_fraction: 0.5,
            ..config()
        };
        let v = Volume::open(
            dir.path(),
            &cfg,
            Box::new(FixedProbe::new(1 << 30, 1000, "/m0")),
        )
        .unwrap();
        // round(0.5 * 1000) - 300
        assert_eq!(v.available().unwrap(), 200);
    }

    #[test]
    fn test_available_saturates_at_zero() {
        let dir = tempdir().unwrap();
        let cfg = StorageConfig { reserved_space_bytes: 5000, ..config() };
        let v = Volume::open(
            dir.path(),
            &cfg,
            Box::new(FixedProbe::new(1 << 30, 1000, "/m0")),
        )
        .unwrap();
        assert_eq!(v.available().unwrap(), 0);
    }

    #[test]
    fn test_stage_block_spends_reserve_permanently() {
        let dir = tempdir().unwrap();
        let cfg = StorageConfig { reserved_space_bytes: 300, ..config() };
        let mut v = Volume::open(
            dir.path(),
            &cfg,
            Box::new(FixedProbe::new(1 << 30, 1000, "/m0")),
        )
        .unwrap();
        assert_eq!(v.available().unwrap(), 700);

        let staged = v.stage_block(&block(1, 200)).unwrap();
        assert!(staged.is_file());
        assert_eq!(fs::metadata(&staged).unwrap().len(), 0);
        // The reserve shrank and stays shrunk.
        assert_eq!(v.available().unwrap(), 900);

        v.stage_block(&block(2, 200)).unwrap();
        assert_eq!(v.available().unwrap(), 1000);
        v.stage_block(&block(3, 200)).unwrap();
        assert_eq!(v.available().unwrap(), 1000);
    }

    #[test]
    fn test_stage_block_rejects_existing_staged_file() {
        let dir = tempdir().unwrap();
        let mut v = volume(dir.path(), 1 << 20, "/m0");
        let b = block(5, 10);
        v.stage_block(&b).unwrap();
        match v.stage_block(&b) {
            Err(Error::Disk { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::AlreadyExists);
            }
            other => panic!("expected Disk error, got {other:?}"),
        }
    }

    #[test]
    fn test_next_volume_round_robin() {
        let dir = tempdir().unwrap();
        let volumes = vec![
            volume(&dir.path().join("v0"), 1 << 20, "/m0"),
            volume(&dir.path().join("v1"), 1 << 20, "/m1"),
        ];
        let mut set = VolumeSet::new(volumes);
        let picks: Vec<String> = (0..4)
            .map(|_| set.next_volume(1024).unwrap().to_string())
            .collect();
        assert_eq!(picks, vec!["0", "1", "0", "1"]);
    }

    #[test]
    fn test_next_volume_skips_full_volume() {
        let dir = tempdir().unwrap();
        let volumes = vec![
            volume(&dir.path().join("v0"), 0, "/m0"),
            volume(&dir.path().join("v1"), 1 << 20, "/m1"),
        ];
        let mut set = VolumeSet::new(volumes);
        for _ in 0..5 {
            let id = set.next_volume(1024).unwrap();
            assert_eq!(id.to_string(), "1");
        }
    }

    #[test]
    fn test_next_volume_out_of_space() {
        let dir = tempdir().unwrap();
        let volumes = vec![
            volume(&dir.path().join("v0"), 100, "/m0"),
            volume(&dir.path().join("v1"), 200, "/m1"),
        ];
        let mut set = VolumeSet::new(volumes);
        match set.next_volume(1024) {
            Err(Error::OutOfSpace { required }) => assert_eq!(required, 1024),
            other => panic!("expected OutOfSpace, got {other:?}"),
        }
    }

    #[test]
    fn test_capacity_counts_shared_mount_once() {
        let dir = tempdir().unwrap();
        let volumes = vec![
            volume(&dir.path().join("v0"), 500, "/m0"),
            volume(&dir.path().join("v1"), 500, "/m0"),
            volume(&dir.path().join("v2"), 500, "/m1"),
        ];
        let set = VolumeSet::new(volumes);
        assert_eq!(set.capacity().unwrap(), 2 << 30);
        assert_eq!(set.remaining().unwrap(), 1000);
    }

    #[test]
    fn test_check_health_flags_bad_volume() {
        let dir = tempdir().unwrap();
        let volumes = vec![
            volume(&dir.path().join("v0"), 500, "/m0"),
            volume(&dir.path().join("v1"), 500, "/m1"),
        ];
        let set = VolumeSet::new(volumes);
        set.check_health().unwrap();

        let tmp = dir.path().join("v1").join("tmp");
        fs::remove_dir_all(&tmp).unwrap();
        match set.check_health() {
            Err(Error::UnhealthyDir { path }) => assert_eq!(path, tmp),
            other => panic!("expected UnhealthyDir, got {other:?}"),
        }
    }
}
