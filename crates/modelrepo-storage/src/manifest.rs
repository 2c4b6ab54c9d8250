//! Layer manifest
//!
//! Every layer numbers its units and filesystems independently. The manifest
//! records which layer-local ids exist and which unit name and filesystem
//! they stand for, so that the repository can translate ids between its own
//! numbering and the layer's.

use crate::layout::{MANIFEST_MAGIC, decode_frame, encode_frame, write_file_atomic};
use modelrepo_common::{Error, FilesystemId, FsId, Result, SyncMode, UnitDescriptor, UnitId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A unit known to a layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestUnit {
    /// Unit name
    pub name: String,
    /// Layer-local filesystem id
    pub fs: FsId,
}

/// Persisted form of the manifest
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ManifestData {
    next_unit: u32,
    next_fs: u32,
    units: BTreeMap<UnitId, ManifestUnit>,
    filesystems: BTreeMap<FsId, FilesystemId>,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self {
            next_unit: 1,
            next_fs: 1,
            units: BTreeMap::new(),
            filesystems: BTreeMap::new(),
        }
    }
}

/// Manifest tables plus reverse lookups
#[derive(Default)]
struct ManifestState {
    data: ManifestData,
    unit_by_name: HashMap<(String, FsId), UnitId>,
    fs_by_name: HashMap<FilesystemId, FsId>,
}

impl ManifestState {
    fn from_data(data: ManifestData) -> Self {
        let unit_by_name = data
            .units
            .iter()
            .map(|(id, unit)| ((unit.name.clone(), unit.fs), *id))
            .collect();
        let fs_by_name = data
            .filesystems
            .iter()
            .map(|(id, fs)| (fs.clone(), *id))
            .collect();
        Self {
            data,
            unit_by_name,
            fs_by_name,
        }
    }
}

/// Unit and filesystem tables of one layer
#[derive(Default)]
pub struct LayerManifest {
    state: RwLock<ManifestState>,
    /// Modified since last persisted
    dirty: AtomicBool,
    /// Held while the manifest file is replaced
    persist_lock: Mutex<()>,
}

impl LayerManifest {
    /// Create an empty manifest
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a manifest file; a missing file yields an empty manifest
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        let payload = decode_frame(MANIFEST_MAGIC, &bytes)?;
        let data: ManifestData = bincode::deserialize(payload)
            .map_err(|e| Error::Serialization(format!("failed to deserialize manifest: {e}")))?;
        debug!(
            "Loaded manifest {:?}: {} units, {} filesystems",
            path,
            data.units.len(),
            data.filesystems.len()
        );
        Ok(Self {
            state: RwLock::new(ManifestState::from_data(data)),
            dirty: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        })
    }

    /// Replace the contents with `other`
    pub(crate) fn replace(&self, other: Self) {
        *self.state.write() = other.state.into_inner();
        self.dirty
            .store(other.dirty.load(Ordering::Acquire), Ordering::Release);
    }

    /// Forget every unit and filesystem
    pub fn reset(&self) {
        *self.state.write() = ManifestState::default();
        self.dirty.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the manifest if it changed; returns whether it was written
    pub fn persist(&self, path: &Path, sync: SyncMode) -> Result<bool> {
        // One writer at a time; they all share the same temp file
        let _persist = self.persist_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = self.encode().and_then(|bytes| write_file_atomic(path, &bytes, sync));
        if let Err(e) = result {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        let payload = bincode::serialize(&state.data)
            .map_err(|e| Error::Serialization(format!("failed to serialize manifest: {e}")))?;
        Ok(encode_frame(MANIFEST_MAGIC, &payload).to_vec())
    }

    /// Layer-local id of a filesystem
    #[must_use]
    pub fn find_fs(&self, fs: &FilesystemId) -> Option<FsId> {
        self.state.read().fs_by_name.get(fs).copied()
    }

    /// Filesystem identity behind a layer-local id
    #[must_use]
    pub fn filesystem(&self, id: FsId) -> Option<FilesystemId> {
        self.state.read().data.filesystems.get(&id).cloned()
    }

    /// Layer-local id of a unit
    #[must_use]
    pub fn find_unit(&self, desc: &UnitDescriptor) -> Option<UnitId> {
        let state = self.state.read();
        let fs = state.fs_by_name.get(&desc.filesystem)?;
        state.unit_by_name.get(&(desc.name.clone(), *fs)).copied()
    }

    /// Descriptor of a layer-local unit
    #[must_use]
    pub fn unit(&self, id: UnitId) -> Option<UnitDescriptor> {
        let state = self.state.read();
        let unit = state.data.units.get(&id)?;
        let fs = state.data.filesystems.get(&unit.fs)?;
        Some(UnitDescriptor::new(unit.name.clone(), fs.clone()))
    }

    #[must_use]
    pub fn contains_unit(&self, id: UnitId) -> bool {
        self.state.read().data.units.contains_key(&id)
    }

    /// Get or allocate the layer-local id of a filesystem
    pub(crate) fn register_fs(&self, fs: &FilesystemId) -> FsId {
        let mut state = self.state.write();
        Self::register_fs_locked(&mut state, fs, &self.dirty)
    }

    fn register_fs_locked(state: &mut ManifestState, fs: &FilesystemId, dirty: &AtomicBool) -> FsId {
        if let Some(id) = state.fs_by_name.get(fs) {
            return *id;
        }
        let id = FsId::new(state.data.next_fs);
        state.data.next_fs += 1;
        state.data.filesystems.insert(id, fs.clone());
        state.fs_by_name.insert(fs.clone(), id);
        dirty.store(true, Ordering::Release);
        id
    }

    /// Get or allocate the layer-local id of a unit
    pub(crate) fn register_unit(&self, desc: &UnitDescriptor) -> UnitId {
        let mut state = self.state.write();
        let fs = Self::register_fs_locked(&mut state, &desc.filesystem, &self.dirty);
        let name_key = (desc.name.clone(), fs);
        if let Some(id) = state.unit_by_name.get(&name_key) {
            return *id;
        }
        let id = UnitId::new(state.data.next_unit);
        state.data.next_unit += 1;
        state.data.units.insert(
            id,
            ManifestUnit {
                name: desc.name.clone(),
                fs,
            },
        );
        state.unit_by_name.insert(name_key, id);
        self.dirty.store(true, Ordering::Release);
        debug!("Allocated layer unit {} for {}", id, desc);
        id
    }

    /// Forget a unit; its id is not handed out again
    pub(crate) fn remove_unit(&self, id: UnitId) -> Option<ManifestUnit> {
        let mut state = self.state.write();
        let unit = state.data.units.remove(&id)?;
        state.unit_by_name.remove(&(unit.name.clone(), unit.fs));
        self.dirty.store(true, Ordering::Release);
        Some(unit)
    }

    /// All units, in id order
    #[must_use]
    pub fn units(&self) -> Vec<(UnitId, UnitDescriptor)> {
        let state = self.state.read();
        state
            .data
            .units
            .iter()
            .filter_map(|(id, unit)| {
                let fs = state.data.filesystems.get(&unit.fs)?;
                Some((*id, UnitDescriptor::new(unit.name.clone(), fs.clone())))
            })
            .collect()
    }

    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.state.read().data.units.len()
    }

    /// All filesystems, in id order
    #[must_use]
    pub fn filesystems(&self) -> Vec<(FsId, FilesystemId)> {
        self.state
            .read()
            .data
            .filesystems
            .iter()
            .map(|(id, fs)| (*id, fs.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_register_is_idempotent() {
        let manifest = LayerManifest::new();
        let a = UnitDescriptor::local("a.c");
        let b = UnitDescriptor::new("a.c", FilesystemId::new("ssh://build"));

        let id_a = manifest.register_unit(&a);
        assert_eq!(id_a, UnitId::new(1));
        assert_eq!(manifest.register_unit(&a), id_a);

        let id_b = manifest.register_unit(&b);
        assert_ne!(id_a, id_b);
        assert_eq!(manifest.find_unit(&b), Some(id_b));
        assert_eq!(manifest.unit(id_b), Some(b));
        assert_eq!(manifest.filesystems().len(), 2);
        assert!(manifest.is_dirty());
    }

    #[test]
    fn test_removed_ids_not_reused() {
        let manifest = LayerManifest::new();
        let a = UnitDescriptor::local("a.c");
        let id = manifest.register_unit(&a);
        assert!(manifest.remove_unit(id).is_some());
        assert!(manifest.find_unit(&a).is_none());
        assert!(manifest.remove_unit(id).is_none());

        let again = manifest.register_unit(&a);
        assert_ne!(again, id);
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.bin");

        let manifest = LayerManifest::new();
        let a = manifest.register_unit(&UnitDescriptor::local("a.c"));
        let b = manifest.register_unit(&UnitDescriptor::local("b.c"));
        assert!(manifest.persist(&path, SyncMode::OnCommit).unwrap());
        assert!(!manifest.persist(&path, SyncMode::OnCommit).unwrap());

        let loaded = LayerManifest::load(&path).unwrap();
        assert!(!loaded.is_dirty());
        assert_eq!(loaded.units(), manifest.units());
        assert_eq!(loaded.find_unit(&UnitDescriptor::local("b.c")), Some(b));

        // Allocation continues after the highest id ever handed out
        loaded.remove_unit(a);
        let c = loaded.register_unit(&UnitDescriptor::local("c.c"));
        assert_eq!(c, UnitId::new(3));
    }

    #[test]
    fn test_concurrent_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.bin");
        let manifest = LayerManifest::new();

        std::thread::scope(|scope| {
            for thread in 0..8 {
                let (manifest, path) = (&manifest, &path);
                scope.spawn(move || {
                    for n in 0..40 {
                        manifest.register_unit(&UnitDescriptor::local(format!("t{thread}-{n}.c")));
                        manifest.persist(path, SyncMode::Never).unwrap();
                    }
                });
            }
        });

        let loaded = LayerManifest::load(&path).unwrap();
        assert_eq!(loaded.unit_count(), 8 * 40);
        assert!(!dir.path().join("manifest.bin.tmp").exists());
    }

    #[test]
    fn test_load_corrupt_manifest_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.bin");
        std::fs::write(&path, b"definitely not a manifest").unwrap();
        assert!(LayerManifest::load(&path).is_err());

        assert_eq!(
            LayerManifest::load(&dir.path().join("missing")).unwrap().unit_count(),
            0
        );
    }

    #[test]
    fn test_reset() {
        let manifest = LayerManifest::new();
        manifest.register_unit(&UnitDescriptor::local("a.c"));
        manifest.reset();
        assert_eq!(manifest.unit_count(), 0);
        assert!(manifest.is_dirty());
        assert_eq!(
            manifest.register_unit(&UnitDescriptor::local("z.c")),
            UnitId::new(1)
        );
    }
}
