//! Core type definitions for modelrepo
//!
//! This module defines the identifiers shared by the storage engine and the
//! repository facade: unit and filesystem ids, unit descriptors, record keys
//! and layer locations.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Numeric identifier of a unit.
///
/// The same logical unit may carry different ids in the client numbering and
/// in each layer's local numbering; converters translate between the two.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct UnitId(u32);

impl UnitId {
    /// Create a unit id from its raw value
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", self.0)
    }
}

/// Numeric identifier of a filesystem, numbered like [`UnitId`]
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct FsId(u32);

impl FsId {
    /// Create a filesystem id from its raw value
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsId({})", self.0)
    }
}

/// Identity of a filesystem a unit's sources live on (e.g. `local`, `ssh://build-host`)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct FilesystemId(String);

impl FilesystemId {
    /// The local filesystem
    pub const LOCAL: &'static str = "local";

    /// Create a filesystem identity
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of the local filesystem
    #[must_use]
    pub fn local() -> Self {
        Self(Self::LOCAL.to_string())
    }

    /// Get the identity as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilesystemId({})", self.0)
    }
}

/// Human-readable identity of a unit: its name plus the filesystem it belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitDescriptor {
    pub name: String,
    pub filesystem: FilesystemId,
}

impl UnitDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, filesystem: FilesystemId) -> Self {
        Self {
            name: name.into(),
            filesystem,
        }
    }

    /// Descriptor of a unit on the local filesystem
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, FilesystemId::local())
    }
}

impl fmt::Display for UnitDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.filesystem)
    }
}

/// Storage-level address of one record: `(unit, index)` in some numbering
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub unit: UnitId,
    pub index: u32,
}

impl RecordKey {
    #[must_use]
    pub const fn new(unit: UnitId, index: u32) -> Self {
        Self { unit, index }
    }

    /// The same record index under another unit id
    #[must_use]
    pub const fn with_unit(self, unit: UnitId) -> Self {
        Self {
            unit,
            index: self.index,
        }
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({}:{})", self.unit, self.index)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.index)
    }
}

/// Storage hint attached to a key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Behavior {
    /// Small, mostly stable object; cached after read
    #[default]
    Default,
    /// Large object rewritten often; never kept in the read cache
    LargeAndMutable,
}

impl Behavior {
    /// Whether reads of this record should populate the read cache
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        matches!(self, Self::Default)
    }
}

/// Physical location of one storage layer
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerDescriptor {
    root: PathBuf,
}

impl LayerDescriptor {
    const FILE_SCHEME: &'static str = "file://";

    /// Create a descriptor for a layer rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Parse a location that is either a plain path or a `file://` URI
    #[must_use]
    pub fn parse(location: &str) -> Self {
        let path = location
            .strip_prefix(Self::FILE_SCHEME)
            .unwrap_or(location);
        Self::new(path)
    }

    /// Root directory of the layer
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location rendered as a `file://` URI
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}{}", Self::FILE_SCHEME, self.root.display())
    }
}

impl fmt::Display for LayerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_ordering() {
        let a = RecordKey::new(UnitId::new(1), 5);
        let b = RecordKey::new(UnitId::new(1), 6);
        let c = RecordKey::new(UnitId::new(2), 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.with_unit(UnitId::new(2)).unit, UnitId::new(2));
        assert_eq!(a.to_string(), "1:5");
    }

    #[test]
    fn test_layer_descriptor_parse() {
        let plain = LayerDescriptor::parse("/var/cache/modelrepo");
        let uri = LayerDescriptor::parse("file:///var/cache/modelrepo");
        assert_eq!(plain, uri);
        assert_eq!(uri.uri(), "file:///var/cache/modelrepo");
    }

    #[test]
    fn test_unit_descriptor_display() {
        let desc = UnitDescriptor::new("libfoo", FilesystemId::new("ssh://build"));
        assert_eq!(desc.to_string(), "libfoo@ssh://build");
        assert_eq!(UnitDescriptor::local("a").filesystem.as_str(), "local");
    }

    #[test]
    fn test_behavior_cacheable() {
        assert!(Behavior::Default.is_cacheable());
        assert!(!Behavior::LargeAndMutable.is_cacheable());
    }
}
