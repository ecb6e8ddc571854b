//! Generic cached table.

use super::core::{Cached, Cell, Dirty, TableCore};
use super::KeyRange;
use crate::error::{CoreError, CoreResult};
use crate::procedure::Context;
use crate::safe::Safe;
use crate::stats::TableStatsSnapshot;
use crate::table::Flushable;
use crate::types::{LockId, TableId};
use crate::undo::{TrackedRecord, UndoEntry};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tabula_codec::{Bean, TableKey};
use tabula_storage::WalkRange;
use tracing::error;

/// A table of `V` records keyed by `K`.
///
/// Reads go through the LRU read cache, then the write-back cache, then
/// storage. Writes are only visible to other procedures after commit, and
/// only reach storage at the next checkpoint.
///
/// Every accessor taking a [`Context`] requires the procedure to hold the
/// key's lock (see [`CachedTable::lock_id`]).
///
/// A memory table has no storage: the read cache is the whole table and an
/// evicted record is gone.
///
/// # Example
///
/// ```rust,ignore
/// let users: CachedTable<String, User> = db.open_table(1, "users")?;
/// db.execute(procedure_fn("rename", |ctx| {
///     ctx.lock(users.lock_id(&name))?;
///     let user = users.get_for_update(ctx, &name)?.unwrap();
///     user.set(ctx, |u| &mut u.display, "new".into())?;
///     Ok(Outcome::Done)
/// }))?;
/// ```
pub struct CachedTable<K: TableKey, V: Bean> {
    pub(crate) core: Arc<TableCore<K, V>>,
}

impl<K: TableKey, V: Bean> Clone for CachedTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K: TableKey, V: Bean> CachedTable<K, V> {
    pub(crate) fn from_core(core: Arc<TableCore<K, V>>) -> Self {
        Self { core }
    }

    /// Table id.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.core.id
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Returns `true` for a table without storage.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.core.is_memory()
    }

    /// Lock id guarding `key`.
    #[must_use]
    pub fn lock_id(&self, key: &K) -> LockId {
        self.core.lock_id(key)
    }

    fn check(&self, ctx: &Context<'_>, key: &K) -> CoreResult<()> {
        ctx.check_access(self.core.lock_id(key), &self.core.name, key)
    }

    /// Cell of a record this procedure already holds for update.
    fn tracked(&self, ctx: &Context<'_>, key: &K) -> Option<(usize, Cell<V>)> {
        let index = ctx.undo().find_record(self.core.id, key)?;
        let record = ctx.undo().record(index)?;
        let cell = Arc::clone(&record.cell).downcast::<Mutex<V>>().ok()?;
        Some((index, cell))
    }

    /// Returns a copy of the record.
    ///
    /// # Errors
    ///
    /// [`CoreError::IllegalUnlockedAccess`] without the key's lock,
    /// [`CoreError::Interrupted`], or a storage or decode failure.
    pub fn get(&self, ctx: &Context<'_>, key: &K) -> CoreResult<Option<V>> {
        self.check(ctx, key)?;
        if let Some((_, cell)) = self.tracked(ctx, key) {
            return Ok(Some(cell.lock().clone()));
        }
        Ok(self.core.load(key, true)?.map(|cell| cell.lock().clone()))
    }

    /// Returns a handle for changing the record in place.
    ///
    /// Asking twice for the same key in one procedure returns handles to the
    /// same record.
    ///
    /// # Errors
    ///
    /// See [`CachedTable::get`].
    pub fn get_for_update(&self, ctx: &mut Context<'_>, key: &K) -> CoreResult<Option<Safe<K, V>>> {
        self.check(ctx, key)?;
        let lock = self.core.lock_id(key);
        if let Some((index, cell)) = self.tracked(ctx, key) {
            return Ok(Some(self.safe(ctx, key, lock, cell, index)));
        }

        let Some(cell) = self.core.load(key, true)? else {
            return Ok(None);
        };
        let publish = {
            let core = Arc::clone(&self.core);
            let key = key.clone();
            let cell = Arc::clone(&cell);
            Box::new(move || core.modify(key, cell))
        };
        let shared: Arc<dyn Any + Send + Sync> = Arc::clone(&cell) as Arc<dyn Any + Send + Sync>;
        let index = ctx
            .undo_mut()
            .track(TrackedRecord::new(self.core.id, Box::new(key.clone()), shared, publish));
        Ok(Some(self.safe(ctx, key, lock, cell, index)))
    }

    fn safe(&self, ctx: &Context<'_>, key: &K, lock: LockId, cell: Cell<V>, index: usize) -> Safe<K, V> {
        Safe::new(
            self.core.id,
            Arc::clone(&self.core.name),
            key.clone(),
            lock,
            cell,
            index,
            ctx.generation(),
        )
    }

    /// Reads without filling the read cache.
    ///
    /// # Errors
    ///
    /// See [`CachedTable::get`].
    pub fn get_no_cache(&self, ctx: &Context<'_>, key: &K) -> CoreResult<Option<V>> {
        self.check(ctx, key)?;
        if let Some((_, cell)) = self.tracked(ctx, key) {
            return Ok(Some(cell.lock().clone()));
        }
        Ok(self.core.load(key, false)?.map(|cell| cell.lock().clone()))
    }

    /// Reads from the caches only, never from storage.
    ///
    /// # Errors
    ///
    /// [`CoreError::IllegalUnlockedAccess`] or [`CoreError::Interrupted`].
    pub fn get_cached(&self, ctx: &Context<'_>, key: &K) -> CoreResult<Option<V>> {
        self.check(ctx, key)?;
        if let Some((_, cell)) = self.tracked(ctx, key) {
            return Ok(Some(cell.lock().clone()));
        }
        Ok(match self.core.probe(key) {
            Cached::Hit(cell) => Some(cell.lock().clone()),
            Cached::Removed | Cached::Miss => None,
        })
    }

    /// Reads the cached or stored value without holding the lock.
    ///
    /// The caches also hold values put by procedures that have not
    /// committed yet, so the result may be uncommitted. It may also be
    /// stale by the time the caller looks at it.
    ///
    /// # Errors
    ///
    /// A storage or decode failure.
    pub fn get_no_lock(&self, key: &K) -> CoreResult<Option<V>> {
        Ok(self.core.load(key, false)?.map(|cell| cell.lock().clone()))
    }

    /// Stores `value` under `key`, replacing any existing record.
    ///
    /// # Errors
    ///
    /// See [`CachedTable::get`].
    pub fn put(&self, ctx: &mut Context<'_>, key: K, value: V) -> CoreResult<()> {
        self.check(ctx, &key)?;
        let cell = Arc::new(Mutex::new(value));
        self.replace(ctx, key, Some(cell));
        Ok(())
    }

    /// Removes the record under `key`.
    ///
    /// Returns `false` if there was nothing to remove.
    ///
    /// # Errors
    ///
    /// See [`CachedTable::get`].
    pub fn remove(&self, ctx: &mut Context<'_>, key: &K) -> CoreResult<bool> {
        self.check(ctx, key)?;
        let exists = self.tracked(ctx, key).is_some() || self.core.load(key, false)?.is_some();
        if !exists {
            return Ok(false);
        }
        self.replace(ctx, key.clone(), None);
        Ok(true)
    }

    fn replace(&self, ctx: &mut Context<'_>, key: K, cell: Option<Cell<V>>) {
        let (cached, dirty) = self.core.capture(&key);
        ctx.undo_mut().detach_record(self.core.id, &key);

        let undo = {
            let core = Arc::clone(&self.core);
            let key = key.clone();
            Box::new(move || core.restore(key, cached, dirty))
        };
        match &cell {
            Some(_) => ctx.undo_mut().push_dirty(UndoEntry::PutReplace(undo)),
            None => ctx.undo_mut().push_dirty(UndoEntry::RemoveRestore(undo)),
        }

        match cell {
            Some(cell) => {
                self.core.cache_put(key.clone(), Arc::clone(&cell));
                self.core.mark(key, Dirty::Value(cell));
            }
            None => {
                self.core.cache_remove(&key);
                self.core.mark(key, Dirty::Removed);
            }
        }
    }

    /// Inserts a record that must not exist yet, without locking.
    ///
    /// Callers must guarantee the key is unique, e.g. a freshly allocated
    /// id. Rollback leaves a removal marker so a concurrent checkpoint can
    /// never persist the discarded value.
    pub(crate) fn insert_unlocked(&self, ctx: &mut Context<'_>, key: K, value: V) {
        let cell = Arc::new(Mutex::new(value));
        let undo = {
            let core = Arc::clone(&self.core);
            let key = key.clone();
            Box::new(move || {
                core.cache_remove(&key);
                core.mark(key, Dirty::Removed);
            })
        };
        ctx.undo_mut().push_dirty(UndoEntry::PutReplace(undo));
        self.core.cache_put(key.clone(), Arc::clone(&cell));
        self.core.mark(key, Dirty::Value(cell));
    }

    /// Visits keys in storage order.
    ///
    /// Only keys already flushed to storage are visited; uncommitted and
    /// write-back changes are not. The visitor returns `false` to stop.
    /// A memory table walks its read cache instead, in no particular order
    /// and ignoring the range.
    ///
    /// Returns `true` if the walk reached the end of the range.
    ///
    /// # Errors
    ///
    /// A storage or key decode failure.
    pub fn walk(&self, range: &KeyRange<K>, mut visitor: impl FnMut(K) -> bool) -> CoreResult<bool> {
        let Some(storage) = self.core.storage() else {
            return Ok(self.walk_cache(visitor));
        };
        let from = range.from.as_ref().map(K::encode_key);
        let to = range.to.as_ref().map(K::encode_key);
        let mut walk_range = WalkRange::between(from.as_deref(), to.as_deref(), range.inclusive);
        if range.reverse {
            walk_range = walk_range.reversed();
        }

        let mut failure: Option<CoreError> = None;
        let completed = storage.walk(walk_range, &mut |bytes| match K::decode_key(bytes) {
            Ok(key) => visitor(key),
            Err(e) => {
                error!(table = %self.core.name, error = %e, "walk stopped on undecodable key");
                failure = Some(e.into());
                false
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    /// Visits keys currently in the read cache.
    ///
    /// Returns `true` if every key was visited.
    pub fn walk_cache(&self, mut visitor: impl FnMut(K) -> bool) -> bool {
        self.core.cached_keys().into_iter().all(|key| visitor(key))
    }

    /// Committed changes not yet saved to storage.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.core.dirty_count()
    }

    /// Records in the read cache.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.core.cache_len()
    }

    /// Table counters.
    #[must_use]
    pub fn stats(&self) -> TableStatsSnapshot {
        Flushable::stats(self.core.as_ref())
    }
}

impl<K: TableKey, V: Bean> std::fmt::Debug for CachedTable<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTable")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("memory", &self.core.is_memory())
            .finish()
    }
}
