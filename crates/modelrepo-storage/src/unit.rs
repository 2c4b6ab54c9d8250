//! Per-unit record store
//!
//! Each unit owns an append-only data file and an index mapping record
//! indices to their location in that file. The committed state is an
//! immutable [`UnitSnapshot`] behind an `Arc`:
//! - Readers clone the `Arc` and read with positional I/O, without locks
//! - Writers buffer records in a pending map until `commit`
//! - `commit` appends records, persists the index via temp + rename and then
//!   swaps the snapshot pointer
//!
//! A reader therefore observes a record either fully before or fully after a
//! commit, never a partially written one.

use crate::layer::CommitStats;
use crate::layout::{
    FLAG_NO_CACHE, INDEX_FILE, IndexEntry, RECORD_PREFIX_SIZE, UnitIndexFile, data_file_name,
    encode_record, read_exact_at, write_file_atomic,
};
use bytes::{Bytes, BytesMut};
use modelrepo_common::checksum::{compute_crc32c, verify_crc32c};
use modelrepo_common::{
    Behavior, CompactionConfig, Error, RecordKey, Result, SyncMode, UnitId,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// A buffered, uncommitted change to one record
#[derive(Clone, Debug)]
pub(crate) enum PendingOp {
    Put { data: Bytes, behavior: Behavior },
    Remove,
}

/// Immutable committed state of a unit
#[derive(Debug, Default)]
pub struct UnitSnapshot {
    /// Generation of the data file
    pub generation: u32,
    /// Record index -> location
    pub entries: BTreeMap<u32, IndexEntry>,
    /// Read handle of the data file; `None` until the first record is written
    data: Option<Arc<File>>,
    /// Committed length of the data file
    pub data_len: u64,
}

impl UnitSnapshot {
    #[must_use]
    pub fn entry(&self, index: u32) -> Option<&IndexEntry> {
        self.entries.get(&index)
    }

    /// Read and verify the payload an entry points to
    pub fn read(&self, key: RecordKey, entry: &IndexEntry) -> Result<Bytes> {
        let file = self
            .data
            .as_ref()
            .ok_or_else(|| Error::corrupt(key, "no data file"))?;
        if entry.offset + entry.footprint() > self.data_len {
            return Err(Error::corrupt(key, "entry beyond end of data file"));
        }

        let mut buf = vec![0u8; RECORD_PREFIX_SIZE as usize + entry.len as usize];
        read_exact_at(file, &mut buf, entry.offset)
            .map_err(|e| Error::corrupt(key, format!("read failed: {e}")))?;

        let prefix = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if prefix != entry.len {
            return Err(Error::corrupt(
                key,
                format!("length prefix {prefix} does not match index length {}", entry.len),
            ));
        }

        let data = Bytes::from(buf).slice(RECORD_PREFIX_SIZE as usize..);
        if !verify_crc32c(&data, entry.crc) {
            return Err(Error::corrupt(key, "crc mismatch"));
        }
        Ok(data)
    }

    /// Bytes of the data file still referenced by the index
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.entries.values().map(IndexEntry::footprint).sum()
    }
}

/// Result of compacting a unit's data file
#[derive(Clone, Debug, Default, Serialize)]
pub struct CompactStats {
    pub generation: u32,
    pub records: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Point-in-time statistics of one unit
#[derive(Clone, Debug, Default, Serialize)]
pub struct UnitStats {
    pub unit: u32,
    pub generation: u32,
    pub records: usize,
    pub tombstones: usize,
    pub live_bytes: u64,
    pub data_bytes: u64,
    pub pending: usize,
}

/// Records of one unit in one layer
pub struct UnitStore {
    /// Layer-local unit id
    unit: UnitId,
    /// Unit directory
    dir: PathBuf,
    writable: bool,
    sync: SyncMode,
    /// Committed state
    snapshot: RwLock<Arc<UnitSnapshot>>,
    /// Buffered writes, last writer wins
    pending: Mutex<HashMap<u32, PendingOp>>,
    /// Serializes committers; holds the append handle of the current data file
    commit_lock: Mutex<Option<File>>,
    /// Next commit sequence
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl UnitStore {
    /// Open the unit stored in `dir`, or an empty unit if nothing was committed yet
    pub fn open(unit: UnitId, dir: &Path, writable: bool, sync: SyncMode) -> Result<Self> {
        let index_path = dir.join(INDEX_FILE);
        if !index_path.exists() {
            return Ok(Self::open_empty(unit, dir, writable, sync));
        }

        let index = UnitIndexFile::decode(&std::fs::read(&index_path)?)?;
        let data_path = dir.join(data_file_name(index.generation));
        let data = if data_path.exists() {
            let file = File::open(&data_path)?;
            let len = file.metadata()?.len();
            if len < index.data_len {
                return Err(Error::storage(format!(
                    "data file {} truncated: {} < {}",
                    data_path.display(),
                    len,
                    index.data_len
                )));
            }
            Some(Arc::new(file))
        } else if index.data_len > 0 {
            return Err(Error::storage(format!(
                "data file {} missing",
                data_path.display()
            )));
        } else {
            None
        };

        if writable {
            remove_stale_files(dir, index.generation);
        }

        let next_seq = index.max_seq() + 1;
        debug!(
            "Opened unit {} (generation {}, {} entries)",
            unit,
            index.generation,
            index.entries.len()
        );

        Ok(Self::with_snapshot(
            unit,
            dir,
            writable,
            sync,
            UnitSnapshot {
                generation: index.generation,
                entries: index.entries,
                data,
                data_len: index.data_len,
            },
            next_seq,
        ))
    }

    /// A unit with no committed records
    pub fn open_empty(unit: UnitId, dir: &Path, writable: bool, sync: SyncMode) -> Self {
        Self::with_snapshot(unit, dir, writable, sync, UnitSnapshot::default(), 1)
    }

    fn with_snapshot(
        unit: UnitId,
        dir: &Path,
        writable: bool,
        sync: SyncMode,
        snapshot: UnitSnapshot,
        next_seq: u64,
    ) -> Self {
        Self {
            unit,
            dir: dir.to_path_buf(),
            writable,
            sync,
            snapshot: RwLock::new(Arc::new(snapshot)),
            pending: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(None),
            next_seq: AtomicU64::new(next_seq),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn unit(&self) -> UnitId {
        self.unit
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current committed state
    #[must_use]
    pub fn snapshot(&self) -> Arc<UnitSnapshot> {
        self.snapshot.read().clone()
    }

    /// Read one committed record
    pub fn read_record(&self, index: u32) -> Result<Option<Bytes>> {
        let snapshot = self.snapshot();
        match snapshot.entry(index) {
            Some(entry) if !entry.is_removed() => snapshot
                .read(RecordKey::new(self.unit, index), entry)
                .map(Some),
            _ => Ok(None),
        }
    }

    /// Buffer a change until the next commit
    pub(crate) fn stage(&self, index: u32, op: PendingOp) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly(self.dir.clone()));
        }
        // `close` flips the flag under the same lock
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Err(Error::UnitClosed(self.unit));
        }
        pending.insert(index, op);
        Ok(())
    }

    /// Number of buffered changes
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Make all buffered changes durable and visible
    ///
    /// Returns the committed record indices alongside the statistics. On
    /// failure the changes are put back, unless newer ones were staged for the
    /// same index in the meantime.
    pub fn commit(&self) -> Result<(CommitStats, Vec<u32>)> {
        let mut writer = self.commit_lock.lock();

        let ops: BTreeMap<u32, PendingOp> = std::mem::take(&mut *self.pending.lock())
            .into_iter()
            .collect();
        if ops.is_empty() {
            return Ok((CommitStats::default(), Vec::new()));
        }

        match self.commit_ops(&mut writer, &ops) {
            Ok(stats) => Ok((stats, ops.into_keys().collect())),
            Err(e) => {
                // Reopen and truncate the data file on the next attempt
                *writer = None;
                let mut pending = self.pending.lock();
                for (index, op) in ops {
                    pending.entry(index).or_insert(op);
                }
                Err(e)
            }
        }
    }

    fn commit_ops(
        &self,
        writer: &mut Option<File>,
        ops: &BTreeMap<u32, PendingOp>,
    ) -> Result<CommitStats> {
        let current = self.snapshot();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut entries = current.entries.clone();
        let mut buf = BytesMut::new();
        let mut offset = current.data_len;
        let mut stats = CommitStats::default();

        for (&index, op) in ops {
            match op {
                PendingOp::Put { data, behavior } => {
                    let len = encode_record(data, &mut buf)?;
                    let flags = if behavior.is_cacheable() { 0 } else { FLAG_NO_CACHE };
                    let entry = IndexEntry::record(offset, len, compute_crc32c(data), seq, flags);
                    offset += entry.footprint();
                    entries.insert(index, entry);
                    stats.records += 1;
                    stats.bytes += u64::from(len);
                }
                PendingOp::Remove => {
                    entries.insert(index, IndexEntry::tombstone(seq));
                    stats.removed += 1;
                }
            }
        }

        std::fs::create_dir_all(&self.dir)?;
        let data_path = self.dir.join(data_file_name(current.generation));

        if !buf.is_empty() {
            if writer.is_none() {
                *writer = Some(open_append(&data_path, current.data_len)?);
            }
            if let Some(file) = writer.as_mut() {
                file.write_all(&buf)?;
                if self.sync != SyncMode::Never {
                    file.sync_data()?;
                }
            }
        }

        let index = UnitIndexFile {
            generation: current.generation,
            data_len: offset,
            entries,
        };
        write_file_atomic(&self.dir.join(INDEX_FILE), &index.encode()?, self.sync)?;

        let data = match &current.data {
            Some(file) => Some(file.clone()),
            None if offset > 0 => Some(Arc::new(File::open(&data_path)?)),
            None => None,
        };

        *self.snapshot.write() = Arc::new(UnitSnapshot {
            generation: index.generation,
            entries: index.entries,
            data,
            data_len: offset,
        });

        debug!(
            "Committed unit {}: {} records, {} removed, seq={}",
            self.unit, stats.records, stats.removed, seq
        );
        Ok(stats)
    }

    /// Stop accepting writes and optionally flush buffered ones
    ///
    /// Records in `exclude` are never persisted by this close; if they were
    /// committed before, a write-back close removes them.
    pub fn close(&self, write_back: bool, exclude: &[u32]) -> Result<Option<CommitStats>> {
        {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::Release);
            if !self.writable {
                pending.clear();
                return Ok(None);
            }
            if write_back {
                let snapshot = self.snapshot();
                for index in exclude {
                    match snapshot.entry(*index) {
                        Some(entry) if !entry.is_removed() => {
                            pending.insert(*index, PendingOp::Remove);
                        }
                        _ => {
                            pending.remove(index);
                        }
                    }
                }
            } else {
                pending.clear();
            }
        }

        if write_back {
            let (stats, _) = self.commit()?;
            Ok(Some(stats))
        } else {
            Ok(None)
        }
    }

    /// Whether the data file carries enough dead bytes to be rewritten
    #[must_use]
    pub fn needs_compaction(&self, config: &CompactionConfig) -> bool {
        let snapshot = self.snapshot();
        if !self.writable || snapshot.data_len < config.min_file_bytes.max(1) {
            return false;
        }
        let dead = snapshot.data_len - snapshot.live_bytes().min(snapshot.data_len);
        dead as f64 / snapshot.data_len as f64 >= config.dead_ratio
    }

    /// Copy live records into a new data file generation
    ///
    /// Readers holding the previous snapshot keep reading the old file through
    /// their handle.
    pub fn compact(&self) -> Result<Option<CompactStats>> {
        if !self.writable {
            return Err(Error::ReadOnly(self.dir.clone()));
        }

        let mut writer = self.commit_lock.lock();
        let current = self.snapshot();
        if current.data_len == 0 {
            return Ok(None);
        }

        let generation = current.generation + 1;
        let new_path = self.dir.join(data_file_name(generation));
        let mut buf = BytesMut::with_capacity(current.live_bytes() as usize);
        let mut entries = BTreeMap::new();
        let mut records = 0;

        for (&index, entry) in &current.entries {
            if entry.is_removed() {
                entries.insert(index, *entry);
                continue;
            }
            let data = current.read(RecordKey::new(self.unit, index), entry)?;
            let offset = buf.len() as u64;
            encode_record(&data, &mut buf)?;
            entries.insert(index, IndexEntry { offset, ..*entry });
            records += 1;
        }

        let data_len = buf.len() as u64;
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&new_path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }

        let index = UnitIndexFile {
            generation,
            data_len,
            entries,
        };
        write_file_atomic(&self.dir.join(INDEX_FILE), &index.encode()?, self.sync)?;

        *self.snapshot.write() = Arc::new(UnitSnapshot {
            generation,
            entries: index.entries,
            data: Some(Arc::new(File::open(&new_path)?)),
            data_len,
        });
        *writer = None;

        let old_path = self.dir.join(data_file_name(current.generation));
        if let Err(e) = std::fs::remove_file(&old_path) {
            warn!("Failed to remove old data file {:?}: {}", old_path, e);
        }

        info!(
            "Compacted unit {}: {} -> {} bytes ({} records, generation {})",
            self.unit, current.data_len, data_len, records, generation
        );
        Ok(Some(CompactStats {
            generation,
            records,
            bytes_before: current.data_len,
            bytes_after: data_len,
        }))
    }

    /// Re-read every live record and collect the ones that fail verification
    pub fn verify(&self) -> (usize, Vec<(RecordKey, String)>) {
        let snapshot = self.snapshot();
        let mut checked = 0;
        let mut corrupt = Vec::new();
        for (&index, entry) in &snapshot.entries {
            if entry.is_removed() {
                continue;
            }
            checked += 1;
            let key = RecordKey::new(self.unit, index);
            if let Err(e) = snapshot.read(key, entry) {
                corrupt.push((key, e.to_string()));
            }
        }
        (checked, corrupt)
    }

    #[must_use]
    pub fn stats(&self) -> UnitStats {
        let snapshot = self.snapshot();
        let tombstones = snapshot.entries.values().filter(|e| e.is_removed()).count();
        UnitStats {
            unit: self.unit.get(),
            generation: snapshot.generation,
            records: snapshot.entries.len() - tombstones,
            tombstones,
            live_bytes: snapshot.live_bytes(),
            data_bytes: snapshot.data_len,
            pending: self.pending_len(),
        }
    }
}

/// Open the data file for appending after its committed prefix
fn open_append(path: &Path, committed_len: u64) -> Result<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    // Drop the tail of a commit that never reached the index
    file.set_len(committed_len)?;
    file.seek(SeekFrom::Start(committed_len))?;
    Ok(file)
}

/// Remove data files of other generations and temp files left by a crash
fn remove_stale_files(dir: &Path, generation: u32) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let current = data_file_name(generation);
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stale = (name.starts_with("data.") && name != current) || name.ends_with(".tmp");
        if stale {
            debug!("Removing stale file {:?}", entry.path());
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!("Failed to remove stale file {:?}: {}", entry.path(), e);
            }
        }
    }
}
