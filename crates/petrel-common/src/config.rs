//! Configuration types for Petrel storage nodes
//!
//! This module defines the configuration surface of the block-storage
//! engine.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Volume root directories, one volume per entry
    #[serde(default)]
    pub data_dirs: Vec<PathBuf>,
    /// Bytes per volume withheld from allocation
    #[serde(default = "default_reserved_space_bytes")]
    pub reserved_space_bytes: u64,
    /// Fraction of probed available space treated as usable
    #[serde(default = "default_usable_disk_fraction")]
    pub usable_disk_fraction: f64,
    /// Blocks a shard directory holds directly before fanning out
    #[serde(default = "default_max_blocks_per_directory")]
    pub max_blocks_per_directory: usize,
}

fn default_reserved_space_bytes() -> u64 {
    0
}

fn default_usable_disk_fraction() -> f64 {
    0.98
}

fn default_max_blocks_per_directory() -> usize {
    64
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dirs: Vec::new(),
            reserved_space_bytes: default_reserved_space_bytes(),
            usable_disk_fraction: default_usable_disk_fraction(),
            max_blocks_per_directory: default_max_blocks_per_directory(),
        }
    }
}

impl StorageConfig {
    /// Validate configured values
    ///
    /// Rejects an empty volume list, a usable fraction outside `(0, 1]`,
    /// and a zero shard fan-out.
    pub fn validate(&self) -> Result<()> {
        if self.data_dirs.is_empty() {
            return Err(Error::config("no data directories configured"));
        }
        if self.usable_disk_fraction <= 0.0 || self.usable_disk_fraction > 1.0 {
            return Err(Error::config(format!(
                "usable_disk_fraction must be in (0, 1], got {}",
                self.usable_disk_fraction
            )));
        }
        if self.max_blocks_per_directory == 0 {
            return Err(Error::config("max_blocks_per_directory must be at least 1"));
        }
        Ok(())
    }
}
