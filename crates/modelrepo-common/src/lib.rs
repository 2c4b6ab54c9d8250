//! modelrepo Common - Shared types and utilities
//!
//! This crate provides the identifier types, error definitions,
//! configuration and checksum helpers used across all modelrepo components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, DirectoryFingerprint};
pub use config::{CacheConfig, CompactionConfig, LayerConfig, RepositoryConfig, SyncMode};
pub use error::{Error, Result};
pub use types::*;
