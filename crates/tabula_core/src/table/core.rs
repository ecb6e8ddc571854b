//! Shared state behind a cached table.

use super::{Flushable, SaveCounts};
use crate::error::CoreResult;
use crate::lock::LockPool;
use crate::stats::{TableStats, TableStatsSnapshot};
use crate::types::{LockId, OwnerId, TableId};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tabula_codec::{Bean, TableKey};
use tabula_storage::StorageTable;
use tracing::{debug, warn};

/// A record value shared between the caches and procedure handles.
pub(crate) type Cell<V> = Arc<Mutex<V>>;

/// Pending change waiting for the checkpoint.
pub(crate) enum Dirty<V> {
    /// Latest committed value.
    Value(Cell<V>),
    /// The record was removed.
    Removed,
}

impl<V> Clone for Dirty<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(cell) => Self::Value(Arc::clone(cell)),
            Self::Removed => Self::Removed,
        }
    }
}

impl<V> Dirty<V> {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => Arc::ptr_eq(a, b),
            (Self::Removed, Self::Removed) => true,
            _ => false,
        }
    }
}

/// Result of probing the caches without touching storage.
pub(crate) enum Cached<V> {
    Hit(Cell<V>),
    Removed,
    Miss,
}

/// Auto-increment state of an integer-keyed table.
#[derive(Debug)]
pub(crate) struct AutoId {
    pub(crate) counter: AtomicU64,
    pub(crate) low_bits: AtomicU32,
    pub(crate) offset: AtomicU64,
}

/// Cache and write-back state of one table.
///
/// `read_cache` and `write_back` are never locked at the same time.
pub(crate) struct TableCore<K: TableKey, V: Bean> {
    pub(crate) id: TableId,
    pub(crate) name: Arc<str>,
    salt: u32,
    storage: Option<Arc<dyn StorageTable>>,
    read_cache: Mutex<LruCache<K, Cell<V>>>,
    write_back: Mutex<HashMap<K, Dirty<V>>>,
    pub(crate) stats: TableStats,
    mod_count: Arc<AtomicU64>,
    pub(crate) auto_id: Option<AutoId>,
}

impl<K: TableKey, V: Bean> TableCore<K, V> {
    pub(crate) fn new(
        id: TableId,
        name: &str,
        salt: u32,
        capacity: NonZeroUsize,
        storage: Option<Arc<dyn StorageTable>>,
        mod_count: Arc<AtomicU64>,
        auto_id: Option<AutoId>,
    ) -> Self {
        Self {
            id,
            name: Arc::from(name),
            salt,
            storage,
            read_cache: Mutex::new(LruCache::new(capacity)),
            write_back: Mutex::new(HashMap::new()),
            stats: TableStats::default(),
            mod_count,
            auto_id,
        }
    }

    pub(crate) fn lock_id(&self, key: &K) -> LockId {
        LockId(self.salt ^ key.lock_hash())
    }

    pub(crate) fn is_memory(&self) -> bool {
        self.storage.is_none()
    }

    pub(crate) fn storage(&self) -> Option<&Arc<dyn StorageTable>> {
        self.storage.as_ref()
    }

    pub(crate) fn cache_len(&self) -> usize {
        self.read_cache.lock().len()
    }

    /// Inserts into the read cache, reporting whatever falls out.
    pub(crate) fn cache_put(&self, key: K, cell: Cell<V>) {
        let evicted = {
            let mut cache = self.read_cache.lock();
            match cache.push(key, cell) {
                Some((old_key, old)) if !cache.contains(&old_key) => Some((old_key, old)),
                _ => None,
            }
        };
        if let Some((key, _)) = evicted {
            self.stats.record_eviction();
            if self.is_memory() {
                warn!(table = %self.name, key = ?key, "memory table evicted a record");
            }
        }
    }

    pub(crate) fn cache_remove(&self, key: &K) {
        self.read_cache.lock().pop(key);
    }

    pub(crate) fn cached_keys(&self) -> Vec<K> {
        self.read_cache.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Looks in the read cache, then the write-back cache.
    pub(crate) fn probe(&self, key: &K) -> Cached<V> {
        if let Some(cell) = self.read_cache.lock().get(key) {
            return Cached::Hit(Arc::clone(cell));
        }
        if self.storage.is_none() {
            return Cached::Miss;
        }
        match self.write_back.lock().get(key) {
            Some(Dirty::Value(cell)) => Cached::Hit(Arc::clone(cell)),
            Some(Dirty::Removed) => Cached::Removed,
            None => Cached::Miss,
        }
    }

    /// Finds a record through both caches and storage.
    ///
    /// With `fill`, a hit below the read cache is promoted into it.
    pub(crate) fn load(&self, key: &K, fill: bool) -> CoreResult<Option<Cell<V>>> {
        self.stats.record_read();
        let from_write_back = match self.probe(key) {
            Cached::Hit(cell) => Some(cell),
            Cached::Removed => return Ok(None),
            Cached::Miss => None,
        };
        if let Some(cell) = from_write_back {
            if fill {
                self.cache_put(key.clone(), Arc::clone(&cell));
            }
            return Ok(Some(cell));
        }

        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        self.stats.record_storage_read();
        let Some(bytes) = storage.get(&key.encode_key())? else {
            return Ok(None);
        };
        let cell = Arc::new(Mutex::new(V::unmarshal(&bytes)?));
        if fill {
            self.cache_put(key.clone(), Arc::clone(&cell));
        }
        Ok(Some(cell))
    }

    /// Current cache entries for `key`, captured before a replacement.
    pub(crate) fn capture(&self, key: &K) -> (Option<Cell<V>>, Option<Dirty<V>>) {
        let cached = self.read_cache.lock().peek(key).cloned();
        let dirty = if self.storage.is_some() {
            self.write_back.lock().get(key).cloned()
        } else {
            None
        };
        (cached, dirty)
    }

    /// Puts back what [`TableCore::capture`] returned.
    pub(crate) fn restore(&self, key: K, cached: Option<Cell<V>>, dirty: Option<Dirty<V>>) {
        if self.storage.is_some() {
            let mut write_back = self.write_back.lock();
            match dirty {
                Some(entry) => {
                    write_back.insert(key.clone(), entry);
                }
                None => {
                    if write_back.remove(&key).is_some() {
                        let _ = self
                            .mod_count
                            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
                    }
                }
            }
        }
        match cached {
            Some(cell) => self.cache_put(key, cell),
            None => self.cache_remove(&key),
        }
    }

    /// Records a replacement in the write-back cache.
    pub(crate) fn mark(&self, key: K, entry: Dirty<V>) {
        if self.storage.is_none() {
            return;
        }
        if self.write_back.lock().insert(key, entry).is_none() {
            self.mod_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publishes a record changed in place through a record handle.
    pub(crate) fn modify(&self, key: K, cell: Cell<V>) {
        if self.storage.is_some() {
            let mut write_back = self.write_back.lock();
            match write_back.get(&key) {
                None => {
                    write_back.insert(key.clone(), Dirty::Value(Arc::clone(&cell)));
                    self.mod_count.fetch_add(1, Ordering::Relaxed);
                }
                Some(Dirty::Value(current)) if Arc::ptr_eq(current, &cell) => {}
                Some(_) => {
                    warn!(table = %self.name, key = ?key, "modified record no longer matches write-back entry; skipped");
                    return;
                }
            }
        }
        self.cache_put(key, cell);
    }

    fn persist(&self, storage: &dyn StorageTable, key: &K, entry: &Dirty<V>) -> CoreResult<()> {
        let encoded = key.encode_key();
        match entry {
            Dirty::Value(cell) => {
                let bytes = cell.lock().marshal()?;
                storage.put(&encoded, &bytes)?;
            }
            Dirty::Removed => storage.remove(&encoded)?,
        }
        Ok(())
    }

    fn remove_if_same(&self, key: &K, entry: &Dirty<V>) -> bool {
        let mut write_back = self.write_back.lock();
        if write_back.get(key).is_some_and(|current| current.same(entry)) {
            write_back.remove(key);
            return true;
        }
        false
    }
}

impl<K: TableKey, V: Bean> Flushable for TableCore<K, V> {
    fn table_id(&self) -> TableId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dirty_count(&self) -> usize {
        self.write_back.lock().len()
    }

    fn try_save_dirty(&self, pool: &LockPool) -> CoreResult<SaveCounts> {
        let Some(storage) = &self.storage else {
            return Ok(SaveCounts::default());
        };
        let keys: Vec<K> = self.write_back.lock().keys().cloned().collect();
        let mut counts = SaveCounts {
            total: keys.len(),
            ..SaveCounts::default()
        };

        for key in keys {
            let Some(_guard) = pool.try_acquire(self.lock_id(&key), OwnerId::CHECKPOINT) else {
                continue;
            };
            let Some(entry) = self.write_back.lock().get(&key).cloned() else {
                continue;
            };
            self.persist(storage.as_ref(), &key, &entry)?;
            if self.remove_if_same(&key, &entry) {
                counts.saved += 1;
            }
        }

        counts.remaining = self.dirty_count();
        debug!(table = %self.name, total = counts.total, saved = counts.saved, remaining = counts.remaining, "opportunistic save");
        Ok(counts)
    }

    fn save_dirty(&self) -> CoreResult<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let entries: Vec<(K, Dirty<V>)> = self
            .write_back
            .lock()
            .iter()
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect();

        let mut saved = 0;
        for (key, entry) in entries {
            self.persist(storage.as_ref(), &key, &entry)?;
            if self.remove_if_same(&key, &entry) {
                saved += 1;
            }
        }
        Ok(saved)
    }

    fn save_id_counter(&self) {
        if let (Some(storage), Some(auto)) = (&self.storage, &self.auto_id) {
            storage.set_id_counter(auto.counter.load(Ordering::Acquire));
        }
    }

    fn stats(&self) -> TableStatsSnapshot {
        TableStatsSnapshot {
            name: self.name.to_string(),
            reads: self.stats.reads(),
            storage_reads: self.stats.storage_reads(),
            evictions: self.stats.evictions(),
            cached: self.cache_len(),
            dirty: self.dirty_count(),
        }
    }
}
