//! Cached tables.
//!
//! A table keeps recently used records in an LRU read cache and committed
//! changes in a write-back cache until a checkpoint moves them to storage.
//! Procedures only see tables through [`CachedTable`] and
//! [`CachedTableByLong`]; the checkpoint sees them through [`Flushable`].

mod by_long;
mod cached;
pub(crate) mod core;

pub use by_long::CachedTableByLong;
pub use cached::CachedTable;

use crate::error::CoreResult;
use crate::lock::LockPool;
use crate::stats::TableStatsSnapshot;
use crate::types::TableId;

/// Options for opening a table.
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    /// Read-cache capacity; the database default when unset.
    pub cache_capacity: Option<usize>,
    /// Lock name shared with other tables; the table id salts lock ids when unset.
    pub lock_name: Option<String>,
}

impl TableOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read-cache capacity.
    #[must_use]
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    /// Shares lock ids with every table opened under the same lock name.
    #[must_use]
    pub fn lock_name(mut self, name: impl Into<String>) -> Self {
        self.lock_name = Some(name.into());
        self
    }
}

/// Key range for [`CachedTable::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange<K> {
    /// Lower bound, unbounded when `None`.
    pub from: Option<K>,
    /// Upper bound, unbounded when `None`.
    pub to: Option<K>,
    /// Whether both bounds are included.
    pub inclusive: bool,
    /// Walk from the upper bound down.
    pub reverse: bool,
}

impl<K> KeyRange<K> {
    /// Every key, ascending.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            from: None,
            to: None,
            inclusive: true,
            reverse: false,
        }
    }

    /// Keys between two bounds.
    #[must_use]
    pub const fn between(from: Option<K>, to: Option<K>, inclusive: bool) -> Self {
        Self {
            from,
            to,
            inclusive,
            reverse: false,
        }
    }

    /// Same range, descending.
    #[must_use]
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// Counts from one opportunistic save pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveCounts {
    /// Dirty records when the pass started.
    pub total: usize,
    /// Records written and cleared.
    pub saved: usize,
    /// Dirty records left afterwards.
    pub remaining: usize,
}

/// The checkpoint's view of a table.
pub(crate) trait Flushable: Send + Sync {
    fn table_id(&self) -> TableId;

    fn name(&self) -> &str;

    fn dirty_count(&self) -> usize;

    /// Saves every dirty record whose lock is free right now.
    fn try_save_dirty(&self, pool: &LockPool) -> CoreResult<SaveCounts>;

    /// Saves every dirty record. Callers must have paused all procedures.
    fn save_dirty(&self) -> CoreResult<usize>;

    fn save_id_counter(&self);

    fn stats(&self) -> TableStatsSnapshot;
}

/// A storage-backed table over `storage`, for unit tests.
#[cfg(test)]
pub(crate) fn test_table<K, V>(storage: &tabula_storage::MemoryStorage, id: u32) -> CachedTable<K, V>
where
    K: tabula_codec::TableKey,
    V: tabula_codec::Bean,
{
    use std::num::NonZeroUsize;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use tabula_storage::Storage;

    let name = format!("t{id}");
    let table = storage.open_table(id, &name).unwrap();
    let core = self::core::TableCore::new(
        TableId(id),
        &name,
        TableId(id).lock_salt(),
        NonZeroUsize::new(16).unwrap(),
        Some(table),
        Arc::new(AtomicU64::new(0)),
        None,
    );
    CachedTable::from_core(Arc::new(core))
}
