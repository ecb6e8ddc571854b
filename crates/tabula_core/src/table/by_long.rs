//! Integer-keyed cached table with id allocation.

use super::cached::CachedTable;
use crate::config::validate_auto_id;
use crate::error::{CoreError, CoreResult};
use crate::procedure::Context;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use tabula_codec::Bean;
use tracing::debug;

/// A [`CachedTable`] keyed by `u64` that can allocate keys.
///
/// Allocated ids are `(counter << low_bits) + offset`. The low bits let
/// several tables or processes share one id space without collisions; an
/// id that already holds a record is skipped.
///
/// # Example
///
/// ```rust,ignore
/// let orders: CachedTableByLong<Order> = db.open_table_by_long(2, "orders")?;
/// orders.set_auto_id(4, 1)?;
/// db.execute(procedure_fn("place", |ctx| {
///     let id = orders.insert(ctx, Order::default())?;
///     Ok(Outcome::Done)
/// }))?;
/// ```
pub struct CachedTableByLong<V: Bean> {
    table: CachedTable<u64, V>,
}

impl<V: Bean> Clone for CachedTableByLong<V> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<V: Bean> CachedTableByLong<V> {
    pub(crate) fn new(table: CachedTable<u64, V>) -> Self {
        Self { table }
    }

    /// The underlying generic table.
    #[must_use]
    pub fn table(&self) -> &CachedTable<u64, V> {
        &self.table
    }

    /// Changes the id layout for future allocations.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidConfig`] if `low_bits >= 32` or `offset` does
    /// not fit in the low bits.
    pub fn set_auto_id(&self, low_bits: u32, offset: u64) -> CoreResult<()> {
        validate_auto_id(low_bits, offset)?;
        let auto = self.auto()?;
        auto.low_bits.store(low_bits, Ordering::Release);
        auto.offset.store(offset, Ordering::Release);
        Ok(())
    }

    /// Last allocated counter value.
    #[must_use]
    pub fn id_counter(&self) -> u64 {
        self.table
            .core
            .auto_id
            .as_ref()
            .map_or(0, |auto| auto.counter.load(Ordering::Acquire))
    }

    fn auto(&self) -> CoreResult<&super::core::AutoId> {
        self.table
            .core
            .auto_id
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("table has no id counter"))
    }

    /// Allocates an unused id.
    ///
    /// Ids are unique but not contiguous: an id whose record already
    /// exists is skipped, and ids of rolled back inserts are not reused.
    ///
    /// # Errors
    ///
    /// A storage or decode failure while checking for an existing record.
    pub fn next_id(&self) -> CoreResult<u64> {
        let auto = self.auto()?;
        loop {
            let counter = auto.counter.fetch_add(1, Ordering::AcqRel) + 1;
            let low_bits = auto.low_bits.load(Ordering::Acquire);
            let id = (counter << low_bits) + auto.offset.load(Ordering::Acquire);
            if self.table.core.load(&id, false)?.is_none() {
                return Ok(id);
            }
            debug!(table = %self.table.name(), id, "allocated id already in use; skipping");
        }
    }

    /// Inserts `value` under a newly allocated id and returns the id.
    ///
    /// No lock is needed since nobody else can know the id yet. On
    /// rollback the record is removed; the id is not reused.
    ///
    /// # Errors
    ///
    /// [`CoreError::Interrupted`], or a failure from [`Self::next_id`].
    pub fn insert(&self, ctx: &mut Context<'_>, value: V) -> CoreResult<u64> {
        ctx.check_interrupted()?;
        let id = self.next_id()?;
        self.table.insert_unlocked(ctx, id, value);
        Ok(id)
    }
}

impl<V: Bean> Deref for CachedTableByLong<V> {
    type Target = CachedTable<u64, V>;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl<V: Bean> std::fmt::Debug for CachedTableByLong<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTableByLong")
            .field("table", &self.table)
            .field("id_counter", &self.id_counter())
            .finish()
    }
}
