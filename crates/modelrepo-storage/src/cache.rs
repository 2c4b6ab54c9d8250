//! Read cache for committed records
//!
//! Decoded objects are never cached; the cache holds the raw committed
//! payload of a record together with the commit sequence it was read at.
//! A hit is only served if that sequence still matches the unit's index, so
//! a racing reader can never resurrect a value that a commit has replaced.

use bytes::Bytes;
use modelrepo_common::{RecordKey, UnitId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Bookkeeping charged per entry on top of the payload
const ENTRY_OVERHEAD: usize = 32;

/// Individual cache entry with LRU tracking
struct CacheEntry {
    /// Commit sequence of the cached payload
    seq: u64,
    /// Record payload
    data: Bytes,
    /// Last access time for LRU eviction
    last_access: AtomicU64,
}

impl CacheEntry {
    fn new(seq: u64, data: Bytes, clock: u64) -> Self {
        Self {
            seq,
            data,
            last_access: AtomicU64::new(clock),
        }
    }

    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }

    fn charge(&self) -> usize {
        self.data.len() + ENTRY_OVERHEAD
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses, including stale entries
    pub misses: AtomicU64,
    /// Number of entries evicted
    pub evictions: AtomicU64,
    /// Number of entries inserted
    pub inserts: AtomicU64,
    /// Inserts refused because a newer version was already cached or the
    /// payload exceeds the whole budget
    pub rejected: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.inserts.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }
}

/// LRU cache of committed record payloads bounded by a byte budget
pub struct ReadCache {
    /// Cached entries protected by RwLock
    entries: RwLock<HashMap<RecordKey, CacheEntry>>,
    /// Maximum bytes charged to the cache
    budget: usize,
    /// Bytes currently charged
    used: AtomicUsize,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    /// Cache statistics
    stats: CacheStats,
}

impl ReadCache {
    /// Create a cache holding at most `budget` bytes; zero disables caching
    pub fn new(budget: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            budget,
            used: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Get the current number of entries in the cache
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Bytes currently charged against the budget
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up the payload of `key` as committed at `seq`
    pub fn get(&self, key: &RecordKey, seq: u64) -> Option<Bytes> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.seq == seq => {
                entry.touch(self.tick());
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data.clone())
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert the payload of `key` as committed at `seq`
    ///
    /// An entry of a newer sequence is kept; payloads larger than the whole
    /// budget are not cached.
    pub fn insert(&self, key: RecordKey, seq: u64, data: Bytes) {
        let charge = data.len() + ENTRY_OVERHEAD;
        if charge > self.budget {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let clock = self.tick();
        let mut entries = self.entries.write();

        if let Some(old) = entries.get(&key) {
            if old.seq > seq {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let old_charge = old.charge();
            entries.remove(&key);
            self.used.fetch_sub(old_charge, Ordering::Relaxed);
        }

        // Evict until the new entry fits
        while self.used.load(Ordering::Relaxed) + charge > self.budget {
            let Some(evict_key) = Self::find_lru_entry(&entries) else {
                break;
            };
            if let Some(evicted) = entries.remove(&evict_key) {
                self.used.fetch_sub(evicted.charge(), Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(key, CacheEntry::new(seq, data, clock));
        self.used.fetch_add(charge, Ordering::Relaxed);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Invalidate (remove) a record from the cache
    pub fn invalidate(&self, key: &RecordKey) -> Option<Bytes> {
        let mut entries = self.entries.write();
        let entry = entries.remove(key)?;
        self.used.fetch_sub(entry.charge(), Ordering::Relaxed);
        Some(entry.data)
    }

    /// Drop every record of `unit`
    pub fn invalidate_unit(&self, unit: UnitId) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let mut freed = 0;
        entries.retain(|key, entry| {
            if key.unit == unit {
                freed += entry.charge();
                false
            } else {
                true
            }
        });
        self.used.fetch_sub(freed, Ordering::Relaxed);
        before - entries.len()
    }

    /// Check if a record is in the cache
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Find the LRU entry key
    fn find_lru_entry(entries: &HashMap<RecordKey, CacheEntry>) -> Option<RecordKey> {
        entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| *key)
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.used.store(0, Ordering::Relaxed);
    }
}
