//! Record handles for in-place updates.

use crate::error::{CoreError, CoreResult};
use crate::procedure::Context;
use crate::table::core::Cell;
use crate::types::{LockId, TableId};
use crate::undo::UndoEntry;
use std::sync::Arc;
use tabula_codec::{Bean, TableKey};

/// A record obtained with [`crate::CachedTable::get_for_update`].
///
/// Every access checks that the procedure still holds the record's lock
/// and registers the inverse operation before changing anything. The
/// change is published to the table's write-back cache when the procedure
/// commits, and undone if it rolls back.
///
/// A handle is only valid inside the procedure attempt that produced it.
/// It returns [`CoreError::StaleRecord`] after a redo or rollback, after a
/// `lock*` call released the record's lock, and after a `put` or `remove`
/// on the same key replaced the record.
///
/// # Example
///
/// ```rust,ignore
/// let player = players.get_for_update(ctx, &id)?.unwrap();
/// player.set(ctx, |p| &mut p.level, 10)?;
/// player.update(ctx, |p| p.items.push(sword))?;
/// ```
pub struct Safe<K: TableKey, V: Bean> {
    table: TableId,
    table_name: Arc<str>,
    key: K,
    lock: LockId,
    cell: Cell<V>,
    record: usize,
    generation: u64,
}

impl<K: TableKey, V: Bean> Safe<K, V> {
    pub(crate) fn new(
        table: TableId,
        table_name: Arc<str>,
        key: K,
        lock: LockId,
        cell: Cell<V>,
        record: usize,
        generation: u64,
    ) -> Self {
        Self {
            table,
            table_name,
            key,
            lock,
            cell,
            record,
            generation,
        }
    }

    /// Key of the record.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Table the record belongs to.
    #[must_use]
    pub fn table(&self) -> TableId {
        self.table
    }

    fn check(&self, ctx: &Context<'_>) -> CoreResult<()> {
        let live = ctx.generation() == self.generation
            && ctx.undo().record(self.record).is_some_and(|r| !r.detached);
        if !live {
            return Err(CoreError::StaleRecord {
                table: self.table_name.to_string(),
            });
        }
        ctx.check_access(self.lock, &self.table_name, &self.key)
    }

    /// Reads the record through a closure.
    ///
    /// # Errors
    ///
    /// [`CoreError::IllegalUnlockedAccess`], [`CoreError::Interrupted`] or
    /// [`CoreError::StaleRecord`].
    pub fn read<R>(&self, ctx: &Context<'_>, f: impl FnOnce(&V) -> R) -> CoreResult<R> {
        self.check(ctx)?;
        Ok(f(&*self.cell.lock()))
    }

    /// Returns a copy of the record.
    ///
    /// # Errors
    ///
    /// See [`Safe::read`].
    pub fn get(&self, ctx: &Context<'_>) -> CoreResult<V> {
        self.read(ctx, V::clone)
    }

    /// Replaces one field, undoing just that field on rollback.
    ///
    /// # Errors
    ///
    /// See [`Safe::read`].
    pub fn set<T>(&self, ctx: &mut Context<'_>, field: fn(&mut V) -> &mut T, value: T) -> CoreResult<()>
    where
        T: Send + 'static,
    {
        self.check(ctx)?;
        let old = std::mem::replace(field(&mut *self.cell.lock()), value);
        if !self.has_full_undo(ctx) {
            let cell = Arc::clone(&self.cell);
            ctx.undo_mut().push(UndoEntry::FieldSet(Box::new(move || {
                *field(&mut *cell.lock()) = old;
            })));
        }
        self.mark_dirty(ctx);
        Ok(())
    }

    /// Changes the record through a closure.
    ///
    /// The first call copies the whole record so rollback can restore it;
    /// later field undo entries for this record are skipped.
    ///
    /// # Errors
    ///
    /// See [`Safe::read`].
    pub fn update<R>(&self, ctx: &mut Context<'_>, f: impl FnOnce(&mut V) -> R) -> CoreResult<R> {
        self.check(ctx)?;
        if !self.has_full_undo(ctx) {
            let saved = self.cell.lock().clone();
            let cell = Arc::clone(&self.cell);
            ctx.undo_mut().push(UndoEntry::Snapshot(Box::new(move || {
                *cell.lock() = saved;
            })));
            if let Some(record) = ctx.undo_mut().record_mut(self.record) {
                record.full_undo = true;
            }
        }
        let result = f(&mut *self.cell.lock());
        self.mark_dirty(ctx);
        Ok(result)
    }

    /// Replaces the whole value in place.
    ///
    /// # Errors
    ///
    /// See [`Safe::read`].
    pub fn assign(&self, ctx: &mut Context<'_>, value: V) -> CoreResult<()> {
        self.update(ctx, |v| *v = value)
    }

    /// Returns `true` once this procedure changed the record.
    #[must_use]
    pub fn is_dirty(&self, ctx: &Context<'_>) -> bool {
        ctx.generation() == self.generation
            && ctx.undo().record(self.record).is_some_and(|r| r.dirty && !r.detached)
    }

    fn has_full_undo(&self, ctx: &Context<'_>) -> bool {
        ctx.undo().record(self.record).is_some_and(|r| r.full_undo)
    }

    fn mark_dirty(&self, ctx: &mut Context<'_>) {
        if let Some(record) = ctx.undo_mut().record_mut(self.record) {
            record.dirty = true;
        }
    }
}

impl<K: TableKey, V: Bean> std::fmt::Debug for Safe<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Safe")
            .field("table", &self.table_name)
            .field("key", &self.key)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
