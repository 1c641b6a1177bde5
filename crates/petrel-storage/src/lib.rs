//! Petrel Storage Engine - Block storage for storage nodes
//!
//! This crate implements the block-storage engine of a Petrel storage
//! node:
//! - Directory shard trees that keep per-directory block counts bounded
//! - Volumes (one per configured data dir) with staged-write space
//!   accounting
//! - Round-robin allocation across volumes with mount-aware capacity
//!   aggregation
//! - The block index: create, finalize, read, invalidate, and report

pub mod probe;
pub mod shard;
pub mod store;
pub mod volume;

// Re-exports
pub use probe::{DiskProbe, StatvfsProbe};
pub use shard::{Blocks, SUBDIR_PREFIX, ShardTree};
pub use store::{BlockReader, BlockStore, BlockWriter};
pub use volume::{Volume, VolumeId, VolumeSet, VolumeUsage};
