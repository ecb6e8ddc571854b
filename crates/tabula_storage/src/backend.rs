//! Storage engine contract.

use crate::error::StorageResult;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

/// Key range for an ordered table walk.
///
/// `None` bounds are open. `inclusive` applies to both ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkRange<'a> {
    /// Smallest key to visit, `None` for the first key.
    pub from: Option<&'a [u8]>,
    /// Largest key to visit, `None` for the last key.
    pub to: Option<&'a [u8]>,
    /// Whether `from` and `to` themselves are visited.
    pub inclusive: bool,
    /// Visit keys in descending order.
    pub reverse: bool,
}

impl<'a> WalkRange<'a> {
    /// A range covering the whole table in ascending order.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            from: None,
            to: None,
            inclusive: true,
            reverse: false,
        }
    }

    /// A range between two optional keys.
    #[must_use]
    pub const fn between(from: Option<&'a [u8]>, to: Option<&'a [u8]>, inclusive: bool) -> Self {
        Self {
            from,
            to,
            inclusive,
            reverse: false,
        }
    }

    /// Returns the same range walked in descending order.
    #[must_use]
    pub const fn reversed(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    /// Returns `true` if no key can fall inside the range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match (self.from, self.to) {
            (Some(from), Some(to)) => from > to || (from == to && !self.inclusive),
            _ => false,
        }
    }

    /// Converts the range into `std` bounds.
    ///
    /// Callers must check [`WalkRange::is_empty`] first; `BTreeMap::range`
    /// panics on inverted bounds.
    #[must_use]
    pub fn bounds(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let bound = |key: Option<&[u8]>| match key {
            None => Bound::Unbounded,
            Some(k) if self.inclusive => Bound::Included(k.to_vec()),
            Some(k) => Bound::Excluded(k.to_vec()),
        };
        (bound(self.from), bound(self.to))
    }
}

/// One table inside a storage engine.
///
/// Keys and values are opaque bytes. Keys compare bytewise, which is the
/// order [`StorageTable::walk`] uses.
///
/// # Concurrency
///
/// Reads may run concurrently with each other and with writes. Writes for a
/// given key are never issued concurrently by the database layer, so an engine
/// only needs per-table consistency, not per-key serialization.
pub trait StorageTable: Send + Sync {
    /// Numeric id the table was opened with.
    fn id(&self) -> u32;

    /// Name the table was opened with.
    fn name(&self) -> &str;

    /// Returns the stored value for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot read the key.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the write.
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Deletes `key`. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the delete.
    fn remove(&self, key: &[u8]) -> StorageResult<()>;

    /// Visits keys inside `range` in key order.
    ///
    /// The visitor returns `false` to stop early. Returns `Ok(true)` if every
    /// key in the range was visited, `Ok(false)` if the visitor stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot iterate.
    fn walk(&self, range: WalkRange<'_>, visitor: &mut dyn FnMut(&[u8]) -> bool)
        -> StorageResult<bool>;

    /// Current auto-increment counter.
    fn id_counter(&self) -> u64;

    /// Stores the auto-increment counter.
    fn set_id_counter(&self, value: u64);

    /// Number of stored keys.
    fn len(&self) -> usize;

    /// Returns `true` if the table holds no keys.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A storage engine: a set of named tables plus a batch lifecycle.
///
/// The checkpoint cycle drives the lifecycle once per cycle:
///
/// ```text
/// begin_batch -> put/remove* -> flush(false) -> put/remove* -> flush(true) -> commit
/// ```
///
/// Writes made between `begin_batch` and `commit` become durable only once
/// `commit` returns `Ok(true)`.
pub trait Storage: Send + Sync {
    /// Opens (or creates) a table.
    ///
    /// Opening the same id and name twice returns the same table.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is bound to another name or the engine is closed.
    fn open_table(&self, id: u32, name: &str) -> StorageResult<Arc<dyn StorageTable>>;

    /// Names of every table known to the engine.
    fn table_names(&self) -> Vec<String>;

    /// Starts a write batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed.
    fn begin_batch(&self) -> StorageResult<()>;

    /// Pushes buffered writes toward durable state.
    ///
    /// `is_final` is `true` for the last flush before `commit`.
    ///
    /// # Errors
    ///
    /// Returns an error if buffered writes cannot be flushed.
    fn flush(&self, is_final: bool) -> StorageResult<()>;

    /// Makes the current batch durable.
    ///
    /// Returns `Ok(false)` if the engine declined to commit without failing.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    fn commit(&self) -> StorageResult<bool>;

    /// Writes a consistent copy of the committed state to `path`.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the backup cannot be written.
    fn backup(&self, path: &Path) -> StorageResult<u64>;

    /// Closes the engine. Further calls fail with [`crate::StorageError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if final cleanup fails.
    fn close(&self) -> StorageResult<()>;
}
