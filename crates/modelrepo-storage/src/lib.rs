//! modelrepo Storage Engine - layered on-disk object storage
//!
//! This crate implements the storage side of the repository:
//! - Typed binary codec for persisted objects (`RepositoryDataOutput` / `RepositoryDataInput`)
//! - The `Persistent` / `PersistentFactory` contract and `Key`
//! - Per-unit append-only data files with atomically swapped indexes
//! - A byte-budget LRU read cache
//! - Layer manifests mapping layer-local unit and filesystem ids to names
//! - `DiskLayer`, the read/write engine for one layer directory

pub mod cache;
pub mod codec;
pub mod layer;
pub mod layout;
pub mod manifest;
pub mod persistent;
pub mod unit;

// Re-exports
pub use cache::{CacheStats, ReadCache};
pub use codec::{IdTranslator, RepositoryDataInput, RepositoryDataOutput};
pub use layer::{
    CommitStats, DiskLayer, DiskLayerConfig, LayerStats, LayerStatus, RecordLookup, UnitWriter,
    VerifyReport,
};
pub use layout::{IndexEntry, LAYER_MAGIC, LayerHeader};
pub use manifest::{LayerManifest, ManifestUnit};
pub use persistent::{Key, Persistent, PersistentFactory, downcast};
pub use unit::{CompactStats, UnitStats, UnitStore};
