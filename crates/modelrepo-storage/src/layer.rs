//! Disk layer
//!
//! A `DiskLayer` is the read/write engine for one layer directory. It owns
//! the layer header and manifest, lazily opens per-unit stores and shares a
//! read cache across all units of the layer.

use crate::cache::ReadCache;
use crate::layout::{
    HEADER_FILE, IndexEntry, LayerHeader, MANIFEST_FILE, UNITS_DIR, record_len, unit_dir,
};
use crate::manifest::LayerManifest;
use crate::unit::{CompactStats, PendingOp, UnitStats, UnitStore};
use bytes::Bytes;
use modelrepo_common::{
    Behavior, CompactionConfig, Error, FilesystemId, FsId, LayerDescriptor, RecordKey,
    RepositoryConfig, Result, SyncMode, UnitDescriptor, UnitId,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Disk layer configuration
#[derive(Clone, Debug)]
pub struct DiskLayerConfig {
    /// Read cache budget in bytes
    pub cache_budget: usize,
    /// Durability of commits
    pub sync: SyncMode,
    /// Automatic compaction after commits
    pub compaction: CompactionConfig,
}

impl Default for DiskLayerConfig {
    fn default() -> Self {
        Self::from(&RepositoryConfig::default())
    }
}

impl From<&RepositoryConfig> for DiskLayerConfig {
    fn from(config: &RepositoryConfig) -> Self {
        Self {
            cache_budget: config.cache.budget_bytes,
            sync: config.sync,
            compaction: config.compaction.clone(),
        }
    }
}

/// Outcome of starting a layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerStatus {
    /// Existing layer with the expected format version
    Opened,
    /// New layer initialized in an empty or missing directory
    Created,
    /// Stale layer discarded; `found` is the format version it carried
    /// (0 if the header was unreadable)
    Rebuilt { found: u32 },
}

/// Result of looking up one record in one layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordLookup {
    /// Committed payload
    Found(Bytes),
    /// The record was removed in this layer; lower layers must not be consulted
    Removed,
    /// This layer knows nothing about the record
    Absent,
}

/// Counters of a single commit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    /// Records written
    pub records: usize,
    /// Records removed
    pub removed: usize,
    /// Payload bytes written
    pub bytes: u64,
}

impl AddAssign for CommitStats {
    fn add_assign(&mut self, other: Self) {
        self.records += other.records;
        self.removed += other.removed;
        self.bytes += other.bytes;
    }
}

/// Layer statistics
#[derive(Debug, Default)]
pub struct LayerStats {
    pub lookups: AtomicU64,
    pub found: AtomicU64,
    pub removed: AtomicU64,
    pub absent: AtomicU64,
    pub corrupt_records: AtomicU64,
    pub writes: AtomicU64,
    pub removes: AtomicU64,
    pub commits: AtomicU64,
    pub committed_records: AtomicU64,
    pub committed_bytes: AtomicU64,
    pub compactions: AtomicU64,
}

/// Result of verifying every record of a layer
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    /// Units examined
    pub units: usize,
    /// Live records read back
    pub records: usize,
    /// Records whose bytes failed verification
    pub corrupt: Vec<(RecordKey, String)>,
    /// Units whose index could not be opened
    pub bad_units: Vec<(UnitId, String)>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.bad_units.is_empty()
    }
}

/// Read/write engine of one layer directory
pub struct DiskLayer {
    descriptor: LayerDescriptor,
    config: DiskLayerConfig,
    started: AtomicBool,
    writable: AtomicBool,
    header: RwLock<Option<LayerHeader>>,
    manifest: LayerManifest,
    /// Open unit stores
    units: RwLock<HashMap<UnitId, Arc<UnitStore>>>,
    /// Per-unit gates serializing opening and closing of a unit's store
    gates: Mutex<HashMap<UnitId, Arc<Mutex<()>>>>,
    cache: ReadCache,
    stats: LayerStats,
}

impl DiskLayer {
    /// Create an unstarted layer
    pub fn new(descriptor: LayerDescriptor, config: DiskLayerConfig) -> Self {
        Self {
            cache: ReadCache::new(config.cache_budget),
            descriptor,
            config,
            started: AtomicBool::new(false),
            writable: AtomicBool::new(false),
            header: RwLock::new(None),
            manifest: LayerManifest::new(),
            units: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            stats: LayerStats::default(),
        }
    }

    /// Read the header of a layer without starting it
    pub fn probe(root: &Path) -> Result<Option<LayerHeader>> {
        LayerHeader::read_from(root)
    }

    /// Validate or initialize the layer directory
    ///
    /// A layer written with another format version is never decoded: a
    /// writable layer is wiped and re-initialized, a read-only one fails with
    /// [`Error::VersionMismatch`].
    pub fn startup(
        &self,
        format_version: u32,
        read_only: bool,
        create_if_missing: bool,
    ) -> Result<LayerStatus> {
        if self.is_started() {
            return Err(Error::invalid_state(format!(
                "layer {} is already started",
                self.descriptor
            )));
        }
        let root = self.root().to_path_buf();
        let writable = !read_only;

        self.units.write().clear();
        self.cache.clear();

        let mut status = if !root.exists() {
            if !create_if_missing || read_only {
                return Err(Error::LayerMissing(root));
            }
            std::fs::create_dir_all(root.join(UNITS_DIR))?;
            self.init_header(format_version)?;
            LayerStatus::Created
        } else {
            match LayerHeader::read_from(&root) {
                Ok(Some(header)) if header.version == format_version => {
                    *self.header.write() = Some(header);
                    LayerStatus::Opened
                }
                Ok(Some(header)) => self.discard(format_version, header.version, writable)?,
                Ok(None) if !writable => return Err(Error::LayerMissing(root)),
                Ok(None) if root.join(UNITS_DIR).exists() => {
                    self.discard(format_version, 0, writable)?
                }
                Ok(None) => {
                    std::fs::create_dir_all(root.join(UNITS_DIR))?;
                    self.init_header(format_version)?;
                    LayerStatus::Created
                }
                Err(e @ Error::Io(_)) => return Err(e),
                Err(e) => {
                    warn!("Unreadable header in {:?}: {}", root, e);
                    self.discard(format_version, 0, writable)?
                }
            }
        };

        match LayerManifest::load(&root.join(MANIFEST_FILE)) {
            Ok(manifest) => self.manifest.replace(manifest),
            Err(e @ Error::Io(_)) => return Err(e),
            Err(e) if writable => {
                warn!("Discarding layer {:?} with corrupt manifest: {}", root, e);
                self.wipe()?;
                status = LayerStatus::Rebuilt {
                    found: format_version,
                };
            }
            Err(e) => return Err(e),
        }

        self.writable.store(writable, Ordering::Release);
        self.started.store(true, Ordering::Release);
        info!(
            "Started layer {} ({:?}, {}, {} units)",
            self.descriptor,
            status,
            if writable { "writable" } else { "read-only" },
            self.manifest.unit_count()
        );
        Ok(status)
    }

    fn init_header(&self, format_version: u32) -> Result<()> {
        let header = LayerHeader::new(format_version);
        header.write_to(self.root())?;
        *self.header.write() = Some(header);
        Ok(())
    }

    /// Handle a layer whose contents must not be interpreted
    fn discard(&self, expected: u32, found: u32, writable: bool) -> Result<LayerStatus> {
        if !writable {
            return Err(Error::VersionMismatch {
                path: self.root().to_path_buf(),
                expected,
                found,
            });
        }
        warn!(
            "Layer {} has format version {}, expected {}; rebuilding",
            self.descriptor, found, expected
        );
        self.wipe()?;
        self.init_header(expected)?;
        Ok(LayerStatus::Rebuilt { found })
    }

    /// Remove all units and the manifest
    fn wipe(&self) -> Result<()> {
        let root = self.root();
        let units = root.join(UNITS_DIR);
        if units.exists() {
            std::fs::remove_dir_all(&units)?;
        }
        let manifest = root.join(MANIFEST_FILE);
        if manifest.exists() {
            std::fs::remove_file(&manifest)?;
        }
        std::fs::create_dir_all(&units)?;
        self.manifest.reset();
        Ok(())
    }

    #[must_use]
    pub fn descriptor(&self) -> &LayerDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.descriptor.root()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn header(&self) -> Option<LayerHeader> {
        self.header.read().clone()
    }

    #[must_use]
    pub fn manifest(&self) -> &LayerManifest {
        &self.manifest
    }

    #[must_use]
    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    #[must_use]
    pub fn stats(&self) -> &LayerStats {
        &self.stats
    }

    #[must_use]
    pub fn unit_dir(&self, unit: UnitId) -> PathBuf {
        unit_dir(self.root(), unit)
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "layer {} is not started",
                self.descriptor
            )))
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_started()?;
        if self.is_writable() {
            Ok(())
        } else {
            Err(Error::ReadOnly(self.root().to_path_buf()))
        }
    }

    /// Store of an existing unit, opening it on first use
    fn store(&self, unit: UnitId) -> Result<Option<Arc<UnitStore>>> {
        if let Some(store) = self.units.read().get(&unit) {
            return Ok(Some(store.clone()));
        }
        let gate = self.gate(unit);
        let _gate = gate.lock();
        self.load_store(unit, false)
    }

    /// Store of a unit, created empty if it has nothing on disk yet
    fn open_store(&self, unit: UnitId) -> Result<Arc<UnitStore>> {
        if let Some(store) = self.units.read().get(&unit) {
            return Ok(store.clone());
        }
        let gate = self.gate(unit);
        let _gate = gate.lock();
        self.load_store(unit, true)?
            .ok_or_else(|| Error::internal(format!("unit {unit} was not created")))
    }

    fn gate(&self, unit: UnitId) -> Arc<Mutex<()>> {
        self.gates.lock().entry(unit).or_default().clone()
    }

    /// Find or open a store; the caller holds the unit's gate
    ///
    /// Disk I/O happens outside the `units` lock so other units stay
    /// readable meanwhile.
    fn load_store(&self, unit: UnitId, create: bool) -> Result<Option<Arc<UnitStore>>> {
        if let Some(store) = self.units.read().get(&unit) {
            return Ok(Some(store.clone()));
        }

        let dir = self.unit_dir(unit);
        if !create && !dir.exists() {
            return Ok(None);
        }
        let writable = self.is_writable();
        let store = match UnitStore::open(unit, &dir, writable, self.config.sync) {
            Ok(store) => store,
            Err(e @ Error::Io(_)) => return Err(e),
            Err(e) => {
                warn!("Unit {} in {} is damaged, treating as empty: {}", unit, self.descriptor, e);
                if writable {
                    std::fs::remove_dir_all(&dir)?;
                }
                UnitStore::open_empty(unit, &dir, writable, self.config.sync)
            }
        };

        let store = Arc::new(store);
        self.units.write().insert(unit, store.clone());
        Ok(Some(store))
    }

    /// Look up the committed state of one record
    pub fn lookup(&self, key: RecordKey) -> Result<RecordLookup> {
        self.ensure_started()?;
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        let Some(store) = self.store(key.unit)? else {
            self.stats.absent.fetch_add(1, Ordering::Relaxed);
            return Ok(RecordLookup::Absent);
        };

        let snapshot = store.snapshot();
        let entry = match snapshot.entry(key.index) {
            None => {
                self.stats.absent.fetch_add(1, Ordering::Relaxed);
                return Ok(RecordLookup::Absent);
            }
            Some(entry) if entry.is_removed() => {
                self.stats.removed.fetch_add(1, Ordering::Relaxed);
                return Ok(RecordLookup::Removed);
            }
            Some(entry) => *entry,
        };

        if entry.is_cacheable() {
            if let Some(data) = self.cache.get(&key, entry.seq) {
                self.stats.found.fetch_add(1, Ordering::Relaxed);
                return Ok(RecordLookup::Found(data));
            }
        }

        let data = snapshot.read(key, &entry).inspect_err(|e| {
            self.stats.corrupt_records.fetch_add(1, Ordering::Relaxed);
            error!("Layer {}: {}", self.descriptor, e);
        })?;

        if entry.is_cacheable() {
            self.cache.insert(key, entry.seq, data.clone());
        }
        self.stats.found.fetch_add(1, Ordering::Relaxed);
        Ok(RecordLookup::Found(data))
    }

    /// Committed payload of one record, `None` if absent or removed
    pub fn read(&self, key: RecordKey) -> Result<Option<Bytes>> {
        match self.lookup(key)? {
            RecordLookup::Found(data) => Ok(Some(data)),
            RecordLookup::Removed | RecordLookup::Absent => Ok(None),
        }
    }

    /// Buffer a record until the unit is committed
    pub fn write(&self, key: RecordKey, data: Bytes, behavior: Behavior) -> Result<()> {
        self.ensure_writable()?;
        record_len(data.len()).map_err(|_| {
            Error::storage(format!("record {key} is too large: {} bytes", data.len()))
        })?;
        self.open_store(key.unit)?
            .stage(key.index, PendingOp::Put { data, behavior })?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Buffer the removal of a record until the unit is committed
    pub fn remove(&self, key: RecordKey) -> Result<()> {
        self.ensure_writable()?;
        self.open_store(key.unit)?
            .stage(key.index, PendingOp::Remove)?;
        self.stats.removes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writer whose buffered records are committed when it goes out of scope
    pub fn writer(&self, unit: UnitId) -> Result<UnitWriter<'_>> {
        self.ensure_writable()?;
        Ok(UnitWriter {
            layer: self,
            unit,
            finished: false,
        })
    }

    /// Make the buffered changes of a unit durable and visible
    pub fn commit(&self, unit: UnitId) -> Result<CommitStats> {
        self.ensure_writable()?;
        self.manifest
            .persist(&self.root().join(MANIFEST_FILE), self.config.sync)?;

        let Some(store) = self.units.read().get(&unit).cloned() else {
            return Ok(CommitStats::default());
        };
        self.commit_store(&store)
    }

    fn commit_store(&self, store: &UnitStore) -> Result<CommitStats> {
        let (stats, indices) = store.commit()?;
        if indices.is_empty() {
            return Ok(stats);
        }

        let unit = store.unit();
        for index in indices {
            self.cache.invalidate(&RecordKey::new(unit, index));
        }
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.stats
            .committed_records
            .fetch_add((stats.records + stats.removed) as u64, Ordering::Relaxed);
        self.stats
            .committed_bytes
            .fetch_add(stats.bytes, Ordering::Relaxed);

        if self.config.compaction.enabled && store.needs_compaction(&self.config.compaction) {
            match store.compact() {
                Ok(_) => {
                    self.stats.compactions.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("Compaction of unit {} failed: {}", unit, e),
            }
        }
        Ok(stats)
    }

    /// Commit every open unit; keeps going past failing units
    pub fn commit_all(&self) -> Result<CommitStats> {
        self.ensure_writable()?;
        self.manifest
            .persist(&self.root().join(MANIFEST_FILE), self.config.sync)?;

        let stores: Vec<Arc<UnitStore>> = self.units.read().values().cloned().collect();
        let mut total = CommitStats::default();
        let mut first_error = None;
        for store in stores {
            match self.commit_store(&store) {
                Ok(stats) => total += stats,
                Err(e) => {
                    error!("Commit of unit {} failed: {}", store.unit(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Release a unit's in-memory state
    ///
    /// With `write_back` buffered changes are committed first, except for the
    /// records in `exclude`, which are dropped (and removed if they were
    /// committed before). With `expunge` the unit's directory and manifest
    /// entry are deleted; other units are untouched.
    pub fn close_unit(
        &self,
        unit: UnitId,
        write_back: bool,
        exclude: &[u32],
        expunge: bool,
    ) -> Result<()> {
        self.ensure_started()?;
        let writable = self.is_writable();
        if expunge && !writable {
            return Err(Error::ReadOnly(self.root().to_path_buf()));
        }

        if write_back && writable && !expunge {
            self.manifest
                .persist(&self.root().join(MANIFEST_FILE), self.config.sync)?;
        }

        // A concurrent open of this unit waits until it is fully closed
        let gate = self.gate(unit);
        let _gate = gate.lock();
        let mut result = Ok(());
        let store = self.units.read().get(&unit).cloned();
        if let Some(store) = store {
            let write_back = write_back && writable && !expunge;
            match store.close(write_back, exclude) {
                Ok(Some(stats)) => debug!(
                    "Closed unit {} with write-back: {} records, {} removed",
                    unit, stats.records, stats.removed
                ),
                Ok(None) => debug!("Closed unit {}", unit),
                Err(e) => result = Err(e),
            }
            self.units.write().remove(&unit);
        }
        self.cache.invalidate_unit(unit);

        if expunge {
            let dir = self.unit_dir(unit);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            if self.manifest.remove_unit(unit).is_some() {
                self.manifest
                    .persist(&self.root().join(MANIFEST_FILE), self.config.sync)?;
            }
            info!("Expunged unit {} from {}", unit, self.descriptor);
        }
        result
    }

    /// Rewrite a unit's data file without dead records
    pub fn compact_unit(&self, unit: UnitId) -> Result<Option<CompactStats>> {
        self.ensure_writable()?;
        let Some(store) = self.store(unit)? else {
            return Ok(None);
        };
        let stats = store.compact()?;
        if stats.is_some() {
            self.stats.compactions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(stats)
    }

    /// Units that have a directory in this layer
    pub fn units(&self) -> Result<Vec<UnitId>> {
        let dir = self.root().join(UNITS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut units = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_string_lossy().parse::<u32>() {
                Ok(id) => units.push(UnitId::new(id)),
                Err(_) => warn!("Ignoring unexpected entry {:?}", entry.path()),
            }
        }
        units.sort();
        Ok(units)
    }

    /// Committed index entries of a unit, in index order
    pub fn record_indices(&self, unit: UnitId) -> Result<Vec<(u32, IndexEntry)>> {
        self.ensure_started()?;
        Ok(match self.store(unit)? {
            Some(store) => store
                .snapshot()
                .entries
                .iter()
                .map(|(index, entry)| (*index, *entry))
                .collect(),
            None => Vec::new(),
        })
    }

    pub fn unit_stats(&self, unit: UnitId) -> Result<Option<UnitStats>> {
        self.ensure_started()?;
        Ok(self.store(unit)?.map(|store| store.stats()))
    }

    /// Allocate (or find) the layer-local id of a unit
    pub fn register_unit(&self, desc: &UnitDescriptor) -> Result<UnitId> {
        self.ensure_writable()?;
        Ok(self.manifest.register_unit(desc))
    }

    /// Allocate (or find) the layer-local id of a filesystem
    pub fn register_filesystem(&self, fs: &FilesystemId) -> Result<FsId> {
        self.ensure_writable()?;
        Ok(self.manifest.register_fs(fs))
    }

    #[must_use]
    pub fn find_unit(&self, desc: &UnitDescriptor) -> Option<UnitId> {
        self.manifest.find_unit(desc)
    }

    #[must_use]
    pub fn unit_descriptor(&self, unit: UnitId) -> Option<UnitDescriptor> {
        self.manifest.unit(unit)
    }

    /// Re-read every live record of every unit
    pub fn verify(&self) -> Result<VerifyReport> {
        self.ensure_started()?;
        let mut report = VerifyReport::default();
        for unit in self.units()? {
            report.units += 1;
            let dir = self.unit_dir(unit);
            // Open independently so damaged units are reported, not reset
            match UnitStore::open(unit, &dir, false, self.config.sync) {
                Ok(store) => {
                    let (checked, corrupt) = store.verify();
                    report.records += checked;
                    report.corrupt.extend(corrupt);
                }
                Err(e) => report.bad_units.push((unit, e.to_string())),
            }
        }
        Ok(report)
    }

    /// Commit everything and release all units
    pub fn shutdown(&self) -> Result<()> {
        if !self.is_started() {
            return Ok(());
        }
        let result = if self.is_writable() {
            self.commit_all().map(|_| ())
        } else {
            Ok(())
        };
        for store in self.units.write().drain().map(|(_, store)| store) {
            if let Err(e) = store.close(false, &[]) {
                warn!("Failed to close unit {}: {}", store.unit(), e);
            }
        }
        self.cache.clear();
        self.started.store(false, Ordering::Release);
        info!("Shut down layer {}", self.descriptor);
        result
    }
}

/// Scoped writer for one unit that commits when dropped
///
/// Obtained from [`DiskLayer::writer`]. A commit that fails during drop can
/// only be logged; call [`UnitWriter::finish`] to observe it.
pub struct UnitWriter<'a> {
    layer: &'a DiskLayer,
    unit: UnitId,
    finished: bool,
}

impl UnitWriter<'_> {
    #[must_use]
    pub const fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn write(&self, index: u32, data: impl Into<Bytes>, behavior: Behavior) -> Result<()> {
        self.layer
            .write(RecordKey::new(self.unit, index), data.into(), behavior)
    }

    pub fn remove(&self, index: u32) -> Result<()> {
        self.layer.remove(RecordKey::new(self.unit, index))
    }

    /// Commit now and report the outcome
    pub fn finish(mut self) -> Result<CommitStats> {
        self.finished = true;
        self.layer.commit(self.unit)
    }
}

impl Drop for UnitWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.layer.commit(self.unit) {
                error!("Implicit commit of unit {} failed: {}", self.unit, e);
            }
        }
    }
}

impl Drop for DiskLayer {
    fn drop(&mut self) {
        if self.is_started() && self.is_writable() {
            if let Err(e) = self.shutdown() {
                error!("Failed to shut down layer {}: {}", self.descriptor, e);
            }
        }
    }
}

/// Whether `root` looks like an initialized layer
#[must_use]
pub fn is_layer(root: &Path) -> bool {
    root.join(HEADER_FILE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelrepo_common::DirectoryFingerprint;
    use rand::Rng;
    use std::sync::Barrier;
    use tempfile::tempdir;

    fn rk(unit: u32, index: u32) -> RecordKey {
        RecordKey::new(UnitId::new(unit), index)
    }

    fn open_layer(root: &Path) -> DiskLayer {
        let layer = DiskLayer::new(LayerDescriptor::new(root), DiskLayerConfig::default());
        layer.startup(1, false, true).unwrap();
        layer
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("layer");

        let layer = DiskLayer::new(LayerDescriptor::new(&root), DiskLayerConfig::default());
        assert_eq!(layer.startup(1, false, true).unwrap(), LayerStatus::Created);
        assert!(is_layer(&root));
        let uuid = layer.header().unwrap().layer_uuid;
        layer.shutdown().unwrap();

        assert_eq!(layer.startup(1, false, true).unwrap(), LayerStatus::Opened);
        assert_eq!(layer.header().unwrap().layer_uuid, uuid);
        assert_eq!(DiskLayer::probe(&root).unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_missing_layer() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("absent");
        let layer = DiskLayer::new(LayerDescriptor::new(&root), DiskLayerConfig::default());

        assert!(matches!(
            layer.startup(1, false, false),
            Err(Error::LayerMissing(_))
        ));
        assert!(matches!(
            layer.startup(1, true, true),
            Err(Error::LayerMissing(_))
        ));
        assert!(!root.exists());
        assert!(layer.read(rk(1, 1)).is_err());
    }

    #[test]
    fn test_writer_commits_on_drop() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        let unit = layer.register_unit(&UnitDescriptor::local("w.c")).unwrap();

        {
            let writer = layer.writer(unit).unwrap();
            writer.write(1, b"one".to_vec(), Behavior::Default).unwrap();
            writer.write(2, b"two".to_vec(), Behavior::Default).unwrap();
            assert_eq!(layer.read(RecordKey::new(unit, 1)).unwrap(), None);
        }
        assert_eq!(
            layer.read(RecordKey::new(unit, 2)).unwrap().as_deref(),
            Some(&b"two"[..])
        );

        let writer = layer.writer(unit).unwrap();
        writer.remove(1).unwrap();
        let stats = writer.finish().unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(layer.lookup(RecordKey::new(unit, 1)).unwrap(), RecordLookup::Removed);
    }

    #[test]
    fn test_write_commit_read_scenario() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        let key = rk(7, 3);

        layer
            .write(key, Bytes::from_static(b"abc"), Behavior::Default)
            .unwrap();
        assert_eq!(layer.read(key).unwrap(), None);
        layer.commit(UnitId::new(7)).unwrap();
        assert_eq!(layer.read(key).unwrap(), Some(Bytes::from_static(b"abc")));

        layer
            .write(key, Bytes::from_static(b"xyz"), Behavior::Default)
            .unwrap();
        let stats = layer.commit(UnitId::new(7)).unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(layer.read(key).unwrap(), Some(Bytes::from_static(b"xyz")));

        // Buffered but discarded on close
        layer
            .write(key, Bytes::from_static(b"zzz"), Behavior::Default)
            .unwrap();
        layer.close_unit(UnitId::new(7), false, &[], false).unwrap();
        assert_eq!(layer.read(key).unwrap(), Some(Bytes::from_static(b"xyz")));
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());

        // Removing a record this layer never had still masks lower layers
        layer.remove(rk(2, 9)).unwrap();
        layer.commit(UnitId::new(2)).unwrap();
        assert_eq!(layer.lookup(rk(2, 9)).unwrap(), RecordLookup::Removed);
        assert_eq!(layer.lookup(rk(2, 10)).unwrap(), RecordLookup::Absent);
        assert_eq!(layer.lookup(rk(3, 1)).unwrap(), RecordLookup::Absent);
        assert_eq!(layer.read(rk(2, 9)).unwrap(), None);
    }

    #[test]
    fn test_cache_serves_committed_versions_only() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        let key = rk(1, 1);

        layer
            .write(key, Bytes::from_static(b"v1"), Behavior::Default)
            .unwrap();
        layer.commit(UnitId::new(1)).unwrap();
        layer.read(key).unwrap();
        layer.read(key).unwrap();
        assert_eq!(layer.cache().stats().hits.load(Ordering::Relaxed), 1);

        layer
            .write(key, Bytes::from_static(b"v2"), Behavior::Default)
            .unwrap();
        layer.commit(UnitId::new(1)).unwrap();
        assert_eq!(layer.read(key).unwrap(), Some(Bytes::from_static(b"v2")));

        let big = rk(1, 2);
        layer
            .write(big, Bytes::from_static(b"large"), Behavior::LargeAndMutable)
            .unwrap();
        layer.commit(UnitId::new(1)).unwrap();
        assert!(layer.read(big).unwrap().is_some());
        assert!(!layer.cache().contains(&big));
    }

    #[test]
    fn test_version_mismatch_rebuilds_writable_layer() {
        let dir = tempdir().unwrap();
        {
            let layer = open_layer(dir.path());
            layer
                .write(rk(1, 1), Bytes::from_static(b"old format"), Behavior::Default)
                .unwrap();
            layer.commit(UnitId::new(1)).unwrap();
            layer.shutdown().unwrap();
        }

        let layer = DiskLayer::new(LayerDescriptor::new(dir.path()), DiskLayerConfig::default());
        assert_eq!(
            layer.startup(2, false, true).unwrap(),
            LayerStatus::Rebuilt { found: 1 }
        );
        assert_eq!(layer.read(rk(1, 1)).unwrap(), None);
        assert!(layer.units().unwrap().is_empty());
        assert_eq!(layer.header().unwrap().version, 2);
    }

    #[test]
    fn test_version_mismatch_read_only_fails_untouched() {
        let dir = tempdir().unwrap();
        {
            let layer = open_layer(dir.path());
            layer
                .write(rk(1, 1), Bytes::from_static(b"v1 data"), Behavior::Default)
                .unwrap();
            layer.commit(UnitId::new(1)).unwrap();
            layer.shutdown().unwrap();
        }
        let before = DirectoryFingerprint::compute(dir.path()).unwrap();

        let layer = DiskLayer::new(LayerDescriptor::new(dir.path()), DiskLayerConfig::default());
        match layer.startup(2, true, false) {
            Err(Error::VersionMismatch {
                expected, found, ..
            }) => {
                assert_eq!(expected, 2);
                assert_eq!(found, 1);
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
        assert_eq!(DirectoryFingerprint::compute(dir.path()).unwrap(), before);
    }

    #[test]
    fn test_corrupt_header_rebuilds() {
        let dir = tempdir().unwrap();
        open_layer(dir.path()).shutdown().unwrap();
        std::fs::write(dir.path().join(HEADER_FILE), b"garbage").unwrap();

        let layer = DiskLayer::new(LayerDescriptor::new(dir.path()), DiskLayerConfig::default());
        assert_eq!(
            layer.startup(1, false, true).unwrap(),
            LayerStatus::Rebuilt { found: 0 }
        );
    }

    #[test]
    fn test_io_error_on_startup_keeps_layer() {
        let dir = tempdir().unwrap();
        {
            let layer = open_layer(dir.path());
            layer
                .write(rk(1, 1), Bytes::from_static(b"kept"), Behavior::Default)
                .unwrap();
            layer.commit(UnitId::new(1)).unwrap();
            layer.shutdown().unwrap();
        }

        // A header that cannot be read is an I/O failure, not a corrupt layer
        let header = dir.path().join(HEADER_FILE);
        let saved = std::fs::read(&header).unwrap();
        std::fs::remove_file(&header).unwrap();
        std::fs::create_dir(&header).unwrap();

        let layer = DiskLayer::new(LayerDescriptor::new(dir.path()), DiskLayerConfig::default());
        assert!(matches!(layer.startup(1, false, true), Err(Error::Io(_))));
        assert!(!layer.is_started());
        assert!(layer.unit_dir(UnitId::new(1)).exists());

        // Same for the manifest
        std::fs::remove_dir(&header).unwrap();
        std::fs::write(&header, saved).unwrap();
        let manifest = dir.path().join(MANIFEST_FILE);
        if manifest.exists() {
            std::fs::remove_file(&manifest).unwrap();
        }
        std::fs::create_dir(&manifest).unwrap();
        assert!(matches!(layer.startup(1, false, true), Err(Error::Io(_))));
        assert!(layer.unit_dir(UnitId::new(1)).exists());

        std::fs::remove_dir(&manifest).unwrap();
        assert_eq!(layer.startup(1, false, true).unwrap(), LayerStatus::Opened);
        assert_eq!(
            layer.read(rk(1, 1)).unwrap(),
            Some(Bytes::from_static(b"kept"))
        );
    }

    #[test]
    fn test_startup_twice_keeps_pending_writes() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        layer
            .write(rk(1, 1), Bytes::from_static(b"buffered"), Behavior::Default)
            .unwrap();

        assert!(matches!(
            layer.startup(1, false, true),
            Err(Error::InvalidState(_))
        ));
        layer.commit(UnitId::new(1)).unwrap();
        assert_eq!(
            layer.read(rk(1, 1)).unwrap(),
            Some(Bytes::from_static(b"buffered"))
        );
    }

    #[test]
    fn test_read_only_layer_rejects_writes() {
        let dir = tempdir().unwrap();
        {
            let layer = open_layer(dir.path());
            layer
                .write(rk(1, 1), Bytes::from_static(b"shared"), Behavior::Default)
                .unwrap();
            layer.commit(UnitId::new(1)).unwrap();
        }

        let layer = DiskLayer::new(LayerDescriptor::new(dir.path()), DiskLayerConfig::default());
        assert_eq!(layer.startup(1, true, false).unwrap(), LayerStatus::Opened);
        assert_eq!(
            layer.read(rk(1, 1)).unwrap(),
            Some(Bytes::from_static(b"shared"))
        );
        assert!(matches!(
            layer.write(rk(1, 1), Bytes::new(), Behavior::Default),
            Err(Error::ReadOnly(_))
        ));
        assert!(layer.register_unit(&UnitDescriptor::local("x.c")).is_err());
        assert!(layer.close_unit(UnitId::new(1), true, &[], true).is_err());
    }

    #[test]
    fn test_busy_unit_does_not_block_others() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        for unit in [1, 2, 3] {
            layer
                .write(rk(unit, 1), Bytes::from(vec![unit as u8; 8]), Behavior::Default)
                .unwrap();
        }
        layer.commit_all().unwrap();
        layer.close_unit(UnitId::new(3), true, &[], false).unwrap();

        // Unit 1 is in the middle of opening or closing
        let gate = layer.gate(UnitId::new(1));
        let busy = gate.lock();

        assert_eq!(layer.read(rk(2, 1)).unwrap(), Some(Bytes::from(vec![2u8; 8])));
        layer
            .write(rk(2, 2), Bytes::from_static(b"more"), Behavior::Default)
            .unwrap();
        layer.commit(UnitId::new(2)).unwrap();
        // Unit 3 has to be reopened from disk
        assert_eq!(layer.read(rk(3, 1)).unwrap(), Some(Bytes::from(vec![3u8; 8])));
        layer.close_unit(UnitId::new(2), true, &[], false).unwrap();

        drop(busy);
        layer.close_unit(UnitId::new(1), true, &[], false).unwrap();
        assert_eq!(layer.read(rk(1, 1)).unwrap(), Some(Bytes::from(vec![1u8; 8])));
    }

    #[test]
    fn test_close_racing_reads_of_other_unit() {
        let dir = tempdir().unwrap();
        let config = DiskLayerConfig {
            sync: SyncMode::Never,
            ..DiskLayerConfig::default()
        };
        let layer = DiskLayer::new(LayerDescriptor::new(dir.path()), config);
        layer.startup(1, false, true).unwrap();
        layer
            .write(rk(2, 1), Bytes::from_static(b"steady"), Behavior::Default)
            .unwrap();
        layer.commit(UnitId::new(2)).unwrap();

        std::thread::scope(|scope| {
            let layer = &layer;
            scope.spawn(move || {
                for round in 0..200u32 {
                    layer
                        .write(rk(1, 1), Bytes::from(round.to_le_bytes().to_vec()), Behavior::Default)
                        .unwrap();
                    layer.close_unit(UnitId::new(1), true, &[], false).unwrap();
                }
            });
            for _ in 0..2_000 {
                assert_eq!(
                    layer.read(rk(2, 1)).unwrap(),
                    Some(Bytes::from_static(b"steady"))
                );
            }
        });

        assert_eq!(
            layer.read(rk(1, 1)).unwrap(),
            Some(Bytes::from(199u32.to_le_bytes().to_vec()))
        );
    }

    #[test]
    fn test_expunge_isolation() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        let a = layer.register_unit(&UnitDescriptor::local("a.c")).unwrap();
        let b = layer.register_unit(&UnitDescriptor::local("b.c")).unwrap();

        for index in 0..16 {
            layer
                .write(RecordKey::new(a, index), Bytes::from(vec![1u8; 64]), Behavior::Default)
                .unwrap();
            layer
                .write(RecordKey::new(b, index), Bytes::from(vec![2u8; 64]), Behavior::Default)
                .unwrap();
        }
        layer.commit(a).unwrap();
        layer.commit(b).unwrap();

        let b_before = DirectoryFingerprint::compute(layer.unit_dir(b)).unwrap();
        layer.close_unit(a, true, &[], true).unwrap();

        assert!(!layer.unit_dir(a).exists());
        assert_eq!(layer.units().unwrap(), vec![b]);
        assert!(layer.find_unit(&UnitDescriptor::local("a.c")).is_none());
        assert_eq!(
            DirectoryFingerprint::compute(layer.unit_dir(b)).unwrap(),
            b_before
        );
        assert_eq!(layer.read(RecordKey::new(a, 0)).unwrap(), None);
        assert_eq!(
            layer.read(RecordKey::new(b, 0)).unwrap(),
            Some(Bytes::from(vec![2u8; 64]))
        );

        // Manifest change survived
        layer.shutdown().unwrap();
        layer.startup(1, false, true).unwrap();
        assert!(layer.find_unit(&UnitDescriptor::local("a.c")).is_none());
        assert_eq!(layer.find_unit(&UnitDescriptor::local("b.c")), Some(b));
    }

    #[test]
    fn test_damaged_unit_index_treated_as_empty() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        layer
            .write(rk(1, 1), Bytes::from_static(b"one"), Behavior::Default)
            .unwrap();
        layer
            .write(rk(2, 1), Bytes::from_static(b"two"), Behavior::Default)
            .unwrap();
        layer.commit_all().unwrap();
        layer.shutdown().unwrap();

        std::fs::write(layer.unit_dir(UnitId::new(1)).join("index"), b"broken").unwrap();
        let report = {
            let inspector =
                DiskLayer::new(LayerDescriptor::new(dir.path()), DiskLayerConfig::default());
            inspector.startup(1, true, false).unwrap();
            inspector.verify().unwrap()
        };
        assert_eq!(report.bad_units.len(), 1);
        assert!(!report.is_clean());

        layer.startup(1, false, true).unwrap();
        assert_eq!(layer.read(rk(1, 1)).unwrap(), None);
        assert_eq!(layer.read(rk(2, 1)).unwrap(), Some(Bytes::from_static(b"two")));
    }

    #[test]
    fn test_corrupt_record_counted() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        layer
            .write(rk(1, 1), Bytes::from_static(b"payload"), Behavior::Default)
            .unwrap();
        layer
            .write(rk(1, 2), Bytes::from_static(b"intact"), Behavior::Default)
            .unwrap();
        layer.commit(UnitId::new(1)).unwrap();

        let data = layer.unit_dir(UnitId::new(1)).join("data.0");
        let mut bytes = std::fs::read(&data).unwrap();
        bytes[6] ^= 0x55;
        std::fs::write(&data, bytes).unwrap();

        let err = layer.read(rk(1, 1)).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(layer.stats().corrupt_records.load(Ordering::Relaxed), 1);
        assert_eq!(
            layer.read(rk(1, 2)).unwrap(),
            Some(Bytes::from_static(b"intact"))
        );

        let report = layer.verify().unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.corrupt.len(), 1);
        assert_eq!(report.corrupt[0].0, rk(1, 1));
    }

    #[test]
    fn test_close_with_excluded_keys() {
        let dir = tempdir().unwrap();
        let layer = open_layer(dir.path());
        let unit = UnitId::new(4);
        layer
            .write(rk(4, 1), Bytes::from_static(b"stale"), Behavior::Default)
            .unwrap();
        layer.commit(unit).unwrap();
        layer
            .write(rk(4, 2), Bytes::from_static(b"fresh"), Behavior::Default)
            .unwrap();
        layer
            .write(rk(4, 3), Bytes::from_static(b"dropped"), Behavior::Default)
            .unwrap();

        layer.close_unit(unit, true, &[1, 3], false).unwrap();
        assert_eq!(layer.read(rk(4, 1)).unwrap(), None);
        assert_eq!(layer.read(rk(4, 2)).unwrap(), Some(Bytes::from_static(b"fresh")));
        assert_eq!(layer.lookup(rk(4, 3)).unwrap(), RecordLookup::Absent);
    }

    #[test]
    fn test_auto_compaction() {
        let dir = tempdir().unwrap();
        let config = DiskLayerConfig {
            compaction: CompactionConfig {
                enabled: true,
                dead_ratio: 0.5,
                min_file_bytes: 256,
            },
            ..Default::default()
        };
        let layer = DiskLayer::new(LayerDescriptor::new(dir.path()), config);
        layer.startup(1, false, true).unwrap();

        for round in 0..8u8 {
            layer
                .write(rk(1, 1), Bytes::from(vec![round; 100]), Behavior::Default)
                .unwrap();
            layer.commit(UnitId::new(1)).unwrap();
        }
        assert!(layer.stats().compactions.load(Ordering::Relaxed) > 0);
        assert_eq!(layer.read(rk(1, 1)).unwrap(), Some(Bytes::from(vec![7u8; 100])));
        let stats = layer.unit_stats(UnitId::new(1)).unwrap().unwrap();
        assert!(stats.generation > 0);
        assert!(stats.data_bytes < 8 * 104);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_records() {
        const READERS: usize = 4;
        const CYCLES: u8 = 200;
        const RECORDS: u32 = 8;

        let dir = tempdir().unwrap();
        let config = DiskLayerConfig {
            sync: SyncMode::Never,
            ..Default::default()
        };
        let layer = Arc::new(DiskLayer::new(LayerDescriptor::new(dir.path()), config));
        layer.startup(1, false, true).unwrap();
        let unit = UnitId::new(1);

        for index in 0..RECORDS {
            layer
                .write(rk(1, index), Bytes::from(vec![0u8; 512]), Behavior::Default)
                .unwrap();
        }
        layer.commit(unit).unwrap();

        let barrier = Arc::new(Barrier::new(READERS + 1));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let layer = layer.clone();
                let barrier = barrier.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut last_seen = vec![0u8; RECORDS as usize];
                    barrier.wait();
                    let mut reads = 0u64;
                    while !done.load(Ordering::Acquire) {
                        let index = rng.gen_range(0..RECORDS);
                        let data = layer.read(rk(1, index)).unwrap().unwrap();
                        let version = data[0];
                        assert_eq!(data.len(), 512 + version as usize);
                        assert!(data.iter().all(|b| *b == version), "torn record");
                        assert!(version >= last_seen[index as usize], "went back in time");
                        last_seen[index as usize] = version;
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        barrier.wait();
        for version in 1..=CYCLES {
            for index in 0..RECORDS {
                let payload = vec![version; 512 + version as usize];
                layer
                    .write(rk(1, index), Bytes::from(payload), Behavior::Default)
                    .unwrap();
            }
            layer.commit(unit).unwrap();
        }
        done.store(true, Ordering::Release);

        let total: u64 = readers.into_iter().map(|r| r.join().unwrap()).sum();
        assert!(total > 0);
        for index in 0..RECORDS {
            let data = layer.read(rk(1, index)).unwrap().unwrap();
            assert_eq!(data[0], CYCLES);
        }
    }
}
