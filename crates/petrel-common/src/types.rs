//! Core type definitions for Petrel
//!
//! This module defines the block identity types shared by the storage
//! engine and everything that talks to it.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Prefix of every block file on disk.
pub const BLOCK_FILE_PREFIX: &str = "blk_";

/// Unique identifier for a block
///
/// Ids are assigned by the cluster coordinator; the storage node never
/// mints them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct BlockId(u64);

impl BlockId {
    /// Create from a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying id
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block as the engine tracks it: identity plus byte length.
///
/// Equality, ordering, and hashing consider the id alone. The length is
/// provisional between create and finalize; [`with_num_bytes`] produces
/// the authoritative value once the on-disk size is known, without
/// disturbing any map keyed on the identity.
///
/// [`with_num_bytes`]: Block::with_num_bytes
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Block {
    id: BlockId,
    num_bytes: u64,
}

impl Block {
    /// Create a block identity with a declared length
    #[must_use]
    pub const fn new(id: BlockId, num_bytes: u64) -> Self {
        Self { id, num_bytes }
    }

    /// Reconstruct a block from its on-disk file name and length
    ///
    /// Returns `None` when the name is not a canonical block filename,
    /// which is how directory scans skip shard subdirectories and any
    /// foreign files.
    #[must_use]
    pub fn from_block_file(name: &str, len: u64) -> Option<Self> {
        let id = name.strip_prefix(BLOCK_FILE_PREFIX)?.parse::<u64>().ok()?;
        Some(Self::new(BlockId::new(id), len))
    }

    /// Whether `name` is a canonical block filename
    #[must_use]
    pub fn is_block_filename(name: &str) -> bool {
        name.strip_prefix(BLOCK_FILE_PREFIX)
            .is_some_and(|rest| rest.parse::<u64>().is_ok())
    }

    /// Get the block id
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    /// Get the byte length this identity carries
    #[must_use]
    pub const fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    /// Same identity carrying a different length
    #[must_use]
    pub const fn with_num_bytes(self, num_bytes: u64) -> Self {
        Self { id: self.id, num_bytes }
    }

    /// Canonical on-disk file name, `blk_<id>`
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{BLOCK_FILE_PREFIX}{}", self.id)
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Block {}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Block {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({}{}, {} bytes)", BLOCK_FILE_PREFIX, self.id, self.num_bytes)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BLOCK_FILE_PREFIX}{}", self.id)
    }
}
