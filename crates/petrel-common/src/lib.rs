//! Petrel Common - Shared types and utilities
//!
//! This crate provides the block identity, error, and configuration
//! types used across all Petrel storage-node components.

pub mod config;
pub mod error;
pub mod types;

pub use config::StorageConfig;
pub use error::{Error, Result};
pub use types::*;
