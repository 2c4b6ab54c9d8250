//! Error types for modelrepo
//!
//! This module defines the common error type used throughout the system.

use crate::types::{RecordKey, UnitId};
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for modelrepo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for modelrepo
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unit {0} is closed")]
    UnitClosed(UnitId),

    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record {key}: {reason}")]
    CorruptRecord { key: RecordKey, reason: String },

    #[error("format version mismatch at {path:?}: expected {expected}, found {found}")]
    VersionMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("layer directory missing: {0:?}")]
    LayerMissing(PathBuf),

    #[error("layer is read-only: {0:?}")]
    ReadOnly(PathBuf),

    #[error("storage error: {0}")]
    Storage(String),

    // Codec errors
    #[error("codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Lifecycle and setup errors
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a corrupt record error
    pub fn corrupt(key: RecordKey, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            key,
            reason: reason.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::LayerMissing(_))
    }

    /// Check if this error only affects a single record and the caller may
    /// recover by recomputing the object
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::CorruptRecord { .. } | Self::Codec(_)
        )
    }

    /// Check if this error signals a record that failed to decode
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptRecord { .. } | Self::Codec(_))
    }
}
