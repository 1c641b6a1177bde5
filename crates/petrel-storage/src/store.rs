//! Block index and lifecycle
//!
//! [`BlockStore`] is the engine's public contract: it owns the volume
//! set plus three maps (blocks being created, block to volume, block to
//! finalized file) behind one mutex. Every lifecycle decision happens
//! under that lock; byte I/O on the returned read and write handles does
//! not.
//!
//! A block moves `unknown -> staged -> finalized -> gone`. There is no
//! abort: a writer that never finalizes leaves its staged file behind
//! until the next restart wipes the staging dir.

use crate::probe::StatvfsProbe;
use crate::volume::{Volume, VolumeId, VolumeSet, VolumeUsage};
use parking_lot::Mutex;
use petrel_common::{Block, Error, Result, StorageConfig};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// The storage node's block engine.
pub struct BlockStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    volumes: VolumeSet,
    /// Staged file per block being created.
    ongoing: HashMap<Block, PathBuf>,
    /// Owning volume per block, indexed or staged.
    volume_of: HashMap<Block, VolumeId>,
    /// Finalized file per block.
    file_of: HashMap<Block, PathBuf>,
}

impl StoreInner {
    fn is_valid(&self, block: &Block) -> bool {
        self.file_of.get(block).is_some_and(|path| path.exists())
    }
}

impl BlockStore {
    /// Open the store over the configured volume roots.
    ///
    /// Builds one volume per data dir and scans every shard tree to
    /// rebuild the block index.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let mut volumes = Vec::with_capacity(config.data_dirs.len());
        for dir in &config.data_dirs {
            let probe = Box::new(StatvfsProbe::new(dir));
            volumes.push(Volume::open(dir, config, probe)?);
        }
        Self::with_volumes(VolumeSet::new(volumes))
    }

    /// Open the store over prebuilt volumes.
    pub fn with_volumes(volumes: VolumeSet) -> Result<Self> {
        let mut volume_of = HashMap::new();
        let mut file_of = HashMap::new();
        for (id, volume) in volumes.iter() {
            for item in volume.blocks() {
                let (block, path) = item?;
                volume_of.insert(block, id);
                if let Some(prev) = file_of.insert(block, path) {
                    // Same id on two volumes; the later scan wins.
                    warn!(block = %block, earlier = %prev.display(), "duplicate block file found during scan");
                }
            }
        }
        info!(volumes = volumes.len(), blocks = file_of.len(), "opened block store");
        Ok(Self {
            inner: Mutex::new(StoreInner {
                volumes,
                ongoing: HashMap::new(),
                volume_of,
                file_of,
            }),
        })
    }

    /// Total capacity across distinct mounts.
    pub fn capacity(&self) -> Result<u64> {
        self.inner.lock().volumes.capacity()
    }

    /// Available space across distinct mounts.
    pub fn remaining(&self) -> Result<u64> {
        self.inner.lock().volumes.remaining()
    }

    /// Number of configured volumes.
    #[must_use]
    pub fn volume_count(&self) -> usize {
        self.inner.lock().volumes.len()
    }

    /// Space snapshot of every volume, in configuration order.
    pub fn volume_usage(&self) -> Result<Vec<VolumeUsage>> {
        let inner = self.inner.lock();
        inner.volumes.iter().map(|(_, v)| v.usage()).collect()
    }

    /// Length in bytes of a finalized block's file.
    pub fn length(&self, block: Block) -> Result<u64> {
        let inner = self.inner.lock();
        let path = inner.file_of.get(&block).ok_or(Error::InvalidBlock(block))?;
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::InvalidBlock(block)),
            Err(e) => Err(Error::disk(path, e)),
        }
    }

    /// Whether `block` is finalized and its file is still on disk.
    #[must_use]
    pub fn is_valid(&self, block: Block) -> bool {
        self.inner.lock().is_valid(&block)
    }

    /// Open a write stream for a new block.
    ///
    /// Fails with `InvalidBlock` when the block is already finalized and
    /// with `DuplicateCreate` when another writer has it staged. Volume
    /// selection, staged-file creation, and index updates happen under
    /// one critical section, so two writers can never race onto the same
    /// staged path.
    pub fn open_write(&self, block: Block) -> Result<BlockWriter> {
        let mut inner = self.inner.lock();
        if inner.is_valid(&block) {
            return Err(Error::InvalidBlock(block));
        }
        if inner.ongoing.contains_key(&block) {
            return Err(Error::DuplicateCreate(block));
        }
        let id = inner.volumes.next_volume(block.num_bytes())?;
        let staged = inner.volumes.get_mut(id).stage_block(&block)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&staged)
            .map_err(|e| Error::disk(&staged, e))?;
        inner.ongoing.insert(block, staged);
        inner.volume_of.insert(block, id);
        debug!(block = %block, volume = %id, "staged block for writing");
        Ok(BlockWriter { block, file })
    }

    /// Commit a staged block.
    ///
    /// Measures the staged file, moves it into the owning volume's shard
    /// tree, and publishes it to readers. Returns the identity carrying
    /// the authoritative on-disk length. Before this call the block is
    /// invisible to reads and reports; after it, immutable.
    pub fn finalize(&self, block: Block) -> Result<Block> {
        let mut inner = self.inner.lock();
        let Some(staged) = inner.ongoing.get(&block).cloned() else {
            return Err(Error::InvalidBlock(block));
        };
        let meta = match fs::metadata(&staged) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::StaleStagedFile { block, path: staged });
            }
            Err(e) => return Err(Error::disk(&staged, e)),
        };
        let finalized = block.with_num_bytes(meta.len());
        let id = inner.volume_of.get(&block).copied().ok_or(Error::InvalidBlock(block))?;
        let dest = inner.volumes.get_mut(id).place_block(&finalized, &staged)?;
        inner.file_of.insert(finalized, dest);
        inner.ongoing.remove(&finalized);
        debug!(block = %finalized, bytes = finalized.num_bytes(), "finalized block");
        Ok(finalized)
    }

    /// Open a read stream over a finalized block.
    pub fn open_read(&self, block: Block) -> Result<BlockReader> {
        let inner = self.inner.lock();
        let path = inner.file_of.get(&block).ok_or(Error::InvalidBlock(block))?;
        match File::open(path) {
            Ok(file) => Ok(BlockReader { file }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::InvalidBlock(block)),
            Err(e) => Err(Error::disk(path, e)),
        }
    }

    /// Delete finalized blocks.
    ///
    /// The first failure aborts the batch; blocks already deleted stay
    /// deleted. A block with no finalized file fails the batch with
    /// `InvalidBlock` the same way.
    pub fn invalidate(&self, blocks: &[Block]) -> Result<()> {
        let mut inner = self.inner.lock();
        for block in blocks {
            let Some(path) = inner.file_of.get(block).cloned() else {
                return Err(Error::InvalidBlock(*block));
            };
            fs::remove_file(&path).map_err(|e| Error::disk(&path, e))?;
            inner.file_of.remove(block);
            inner.volume_of.remove(block);
            info!(block = %block, file = %path.display(), "deleted block");
        }
        Ok(())
    }

    /// Point-in-time report of every block on disk, sorted by id.
    ///
    /// Reads the trees, not the index, so it reflects exactly what a
    /// fresh scan would find.
    pub fn block_report(&self) -> Result<Vec<Block>> {
        let inner = self.inner.lock();
        let mut report = BTreeSet::new();
        for (_, volume) in inner.volumes.iter() {
            for item in volume.blocks() {
                let (block, _) = item?;
                report.insert(block);
            }
        }
        Ok(report.into_iter().collect())
    }

    /// Verify every volume's directories are present and writable.
    pub fn check_health(&self) -> Result<()> {
        self.inner.lock().volumes.check_health()
    }
}

impl fmt::Display for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockStore({})", self.inner.lock().volumes)
    }
}

/// Write handle over a staged block file.
///
/// Dropping the writer without [`BlockStore::finalize`] leaves the block
/// staged; it never becomes visible and its file is wiped on the next
/// restart.
pub struct BlockWriter {
    block: Block,
    file: File,
}

impl BlockWriter {
    /// Identity this writer stages.
    #[must_use]
    pub fn block(&self) -> Block {
        self.block
    }
}

impl Write for BlockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Read handle over a finalized block file.
pub struct BlockReader {
    file: File,
}

impl Read for BlockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for BlockReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
