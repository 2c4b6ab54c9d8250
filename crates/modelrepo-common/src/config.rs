//! Configuration types for modelrepo
//!
//! This module defines the repository configuration: the ordered layer stack,
//! the expected on-disk format version, the read cache budget and commit
//! durability.

use crate::error::{Error, Result};
use crate::types::LayerDescriptor;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk format version written by this build
pub const DEFAULT_FORMAT_VERSION: u32 = 1;

/// Root configuration for a repository
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Expected on-disk format version
    pub format_version: u32,
    /// Layer stack, most specific (writable) first
    pub layers: Vec<LayerConfig>,
    /// Read cache configuration
    pub cache: CacheConfig,
    /// Durability of commits
    pub sync: SyncMode,
    /// Data file compaction
    pub compaction: CompactionConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            format_version: DEFAULT_FORMAT_VERSION,
            layers: Vec::new(),
            cache: CacheConfig::default(),
            sync: SyncMode::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl RepositoryConfig {
    /// Configuration with a single writable layer at `location`
    #[must_use]
    pub fn single_layer(location: impl AsRef<Path>) -> Self {
        Self {
            layers: vec![LayerConfig::writable(location)],
            ..Default::default()
        }
    }

    /// Append a layer to the bottom of the stack
    #[must_use]
    pub fn with_layer(mut self, layer: LayerConfig) -> Self {
        self.layers.push(layer);
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration for values the repository cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::Configuration("no layers configured".into()));
        }
        if self.format_version == 0 {
            return Err(Error::Configuration("format version must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.compaction.dead_ratio) {
            return Err(Error::Configuration(format!(
                "compaction dead_ratio {} outside 0..=1",
                self.compaction.dead_ratio
            )));
        }
        Ok(())
    }
}

/// Configuration for a single layer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Directory path or `file://` URI
    pub location: String,
    /// Never write to this layer
    #[serde(default)]
    pub read_only: bool,
    /// Create the directory if it does not exist
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
}

const fn default_create_if_missing() -> bool {
    true
}

impl LayerConfig {
    /// A writable layer created on demand
    #[must_use]
    pub fn writable(location: impl AsRef<Path>) -> Self {
        Self {
            location: location.as_ref().to_string_lossy().to_string(),
            read_only: false,
            create_if_missing: true,
        }
    }

    /// A shared read-only layer that must already exist
    #[must_use]
    pub fn read_only(location: impl AsRef<Path>) -> Self {
        Self {
            location: location.as_ref().to_string_lossy().to_string(),
            read_only: true,
            create_if_missing: false,
        }
    }

    /// Resolve the location to a layer descriptor
    #[must_use]
    pub fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor::parse(&self.location)
    }
}

/// Read cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Approximate upper bound of cached payload bytes per layer
    pub budget_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Commit synchronization mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync data and index on every commit (safest, slowest)
    Always,
    /// fsync data files on commit, rely on rename for the index
    #[default]
    OnCommit,
    /// Leave flushing to the OS (fastest, risk of losing recent commits)
    Never,
}

/// Data file compaction configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Compact automatically after commits
    pub enabled: bool,
    /// Fraction of dead bytes that triggers compaction
    pub dead_ratio: f64,
    /// Data files smaller than this are never compacted automatically
    pub min_file_bytes: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dead_ratio: 0.5,
            min_file_bytes: 1024 * 1024, // 1 MB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RepositoryConfig::default();
        assert_eq!(config.format_version, DEFAULT_FORMAT_VERSION);
        assert_eq!(config.cache.budget_bytes, 64 * 1024 * 1024);
        assert_eq!(config.sync, SyncMode::OnCommit);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config = RepositoryConfig::from_toml_str(
            r#"
            format_version = 3
            sync = "never"

            [cache]
            budget_bytes = 4096

            [[layers]]
            location = "/tmp/project-cache"

            [[layers]]
            location = "file:///opt/prebuilt"
            read_only = true
            create_if_missing = false
            "#,
        )
        .unwrap();

        assert_eq!(config.format_version, 3);
        assert_eq!(config.sync, SyncMode::Never);
        assert_eq!(config.cache.budget_bytes, 4096);
        assert_eq!(config.layers.len(), 2);
        assert!(!config.layers[0].read_only);
        assert!(config.layers[0].create_if_missing);
        assert!(config.layers[1].read_only);
        assert_eq!(
            config.layers[1].descriptor().root(),
            Path::new("/opt/prebuilt")
        );
        assert!(config.compaction.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RepositoryConfig::single_layer("/tmp/layer");
        assert!(config.validate().is_ok());

        config.format_version = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.format_version = 1;
        config.compaction.dead_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.toml");
        std::fs::write(&path, "[[layers]]\nlocation = \"/tmp/a\"\n").unwrap();

        let config = RepositoryConfig::load(&path).unwrap();
        assert_eq!(config.layers[0].location, "/tmp/a");
        assert!(RepositoryConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
