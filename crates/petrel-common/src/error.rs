//! Error types for Petrel
//!
//! This module defines the common error type used throughout the
//! storage engine.

use crate::types::Block;
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for Petrel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Petrel
#[derive(Debug, Error)]
pub enum Error {
    // Block lifecycle errors
    #[error("invalid block: {0}")]
    InvalidBlock(Block),

    #[error("block {0} is already being created")]
    DuplicateCreate(Block),

    #[error("staged file for block {block} is missing: {}", path.display())]
    StaleStagedFile { block: Block, path: PathBuf },

    // Space errors
    #[error("out of space on all volumes: required {required} bytes")]
    OutOfSpace { required: u64 },

    // Disk errors
    #[error("disk I/O error at {}: {source}", path.display())]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unhealthy storage directory: {}", path.display())]
    UnhealthyDir { path: PathBuf },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a disk error carrying the failing path
    pub fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Disk { path: path.into(), source }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error means a block was in the wrong lifecycle state
    #[must_use]
    pub fn is_invalid_block(&self) -> bool {
        matches!(self, Self::InvalidBlock(_) | Self::StaleStagedFile { .. })
    }

    /// Check if this error reports failed or unhealthy hardware
    #[must_use]
    pub fn is_disk_failure(&self) -> bool {
        matches!(self, Self::Disk { .. } | Self::UnhealthyDir { .. })
    }
}
