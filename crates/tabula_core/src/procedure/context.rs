//! Execution context handed to a running procedure.

use super::registry::ProcedureHandle;
use crate::error::{CoreError, CoreResult};
use crate::lock::LockPool;
use crate::types::{LockId, OwnerId, SessionId};
use crate::undo::{CommitReport, UndoLog};
use std::fmt::Debug;

/// Everything a procedure touches during one run.
///
/// The context owns the procedure's lock set and undo log. Locks are always
/// acquired in ascending slot order, which is what keeps two procedures from
/// deadlocking on each other. Every `lock*` call first releases whatever the
/// procedure already holds, so all records a procedure writes must be
/// covered by a single call, and record handles taken before the call must
/// be fetched again.
///
/// # Example
///
/// ```rust,ignore
/// db.execute(procedure_fn("transfer", |ctx| {
///     ctx.lock2(accounts.lock_id(&from), accounts.lock_id(&to))?;
///     let a = accounts.get_for_update(ctx, &from)?.unwrap();
///     a.update(ctx, |acc| acc.balance -= 10)?;
///     Ok(Outcome::Done)
/// }))?;
/// ```
pub struct Context<'a> {
    pool: &'a LockPool,
    handle: &'a ProcedureHandle,
    max_locks: usize,
    held: Vec<usize>,
    undo: UndoLog,
    generation: u64,
}

impl<'a> Context<'a> {
    pub(crate) fn new(pool: &'a LockPool, handle: &'a ProcedureHandle, max_locks: usize) -> Self {
        Self {
            pool,
            handle,
            max_locks,
            held: Vec::new(),
            undo: UndoLog::new(),
            generation: 0,
        }
    }

    /// Name of the running procedure.
    #[must_use]
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Session the procedure was scheduled on, if any.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.handle.session()
    }

    /// Lock owner id of this run.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.handle.owner()
    }

    /// Acquires one lock, releasing any locks already held.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnlockAfterDirty`] if records were already modified,
    /// [`CoreError::Interrupted`] if the watchdog fires while waiting.
    pub fn lock(&mut self, id: LockId) -> CoreResult<()> {
        let slots = [self.pool.slot_index(id)];
        self.acquire_sorted(&slots)
    }

    /// Acquires two locks in slot order, releasing any locks already held.
    ///
    /// # Errors
    ///
    /// See [`Context::lock`].
    pub fn lock2(&mut self, a: LockId, b: LockId) -> CoreResult<()> {
        let mut slots = [self.pool.slot_index(a), self.pool.slot_index(b)];
        slots.sort_unstable();
        self.acquire_sorted(&slots)
    }

    /// Acquires three locks in slot order, releasing any locks already held.
    ///
    /// # Errors
    ///
    /// See [`Context::lock`].
    pub fn lock3(&mut self, a: LockId, b: LockId, c: LockId) -> CoreResult<()> {
        let mut slots = [a, b, c].map(|id| self.pool.slot_index(id));
        slots.sort_unstable();
        self.acquire_sorted(&slots)
    }

    /// Acquires four locks in slot order, releasing any locks already held.
    ///
    /// # Errors
    ///
    /// See [`Context::lock`].
    pub fn lock4(&mut self, a: LockId, b: LockId, c: LockId, d: LockId) -> CoreResult<()> {
        let mut slots = [a, b, c, d].map(|id| self.pool.slot_index(id));
        slots.sort_unstable();
        self.acquire_sorted(&slots)
    }

    /// Acquires any number of locks in slot order, releasing any locks
    /// already held. Duplicate ids and ids sharing a slot count once.
    ///
    /// # Errors
    ///
    /// [`CoreError::LockLimitExceeded`] if more distinct slots are requested
    /// than the configured limit; otherwise see [`Context::lock`].
    pub fn lock_all(&mut self, ids: &[LockId]) -> CoreResult<()> {
        let mut slots: Vec<usize> = ids.iter().map(|&id| self.pool.slot_index(id)).collect();
        slots.sort_unstable();
        slots.dedup();
        if slots.len() > self.max_locks {
            return Err(CoreError::LockLimitExceeded {
                requested: slots.len(),
                max: self.max_locks,
            });
        }
        self.acquire_sorted(&slots)
    }

    /// Releases every held lock.
    ///
    /// Records obtained for update before the call are forgotten: other
    /// procedures may change them once the locks are gone, so their handles
    /// turn stale and the next read loads the current value.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnlockAfterDirty`] once any record has been changed;
    /// locks stay held until the procedure ends in that case.
    pub fn unlock(&mut self) -> CoreResult<()> {
        if self.undo.has_dirty() {
            return Err(CoreError::UnlockAfterDirty);
        }
        self.release_all();
        self.undo.forget_records();
        self.generation += 1;
        Ok(())
    }

    /// Returns `true` if this procedure holds the slot `id` maps to.
    #[must_use]
    pub fn holds(&self, id: LockId) -> bool {
        self.pool.is_held_by(id, self.handle.owner())
    }

    /// Fails if the watchdog has interrupted this procedure.
    ///
    /// Long loops that touch no records should call this periodically.
    ///
    /// # Errors
    ///
    /// [`CoreError::Interrupted`].
    pub fn check_interrupted(&self) -> CoreResult<()> {
        if self.handle.is_interrupted() {
            return Err(CoreError::Interrupted {
                procedure: self.handle.name().to_string(),
            });
        }
        Ok(())
    }

    /// Tells the watchdog never to interrupt this run.
    pub fn set_uninterruptible(&self) {
        self.handle.set_uninterruptible();
    }

    /// Runs `callback` after the procedure commits.
    ///
    /// Callbacks run in registration order and are discarded on rollback.
    /// A failing callback is logged; it does not undo the commit.
    pub fn on_commit<F>(&mut self, callback: F)
    where
        F: FnOnce() -> CoreResult<()> + Send + 'static,
    {
        self.undo.on_commit(Box::new(callback));
    }

    /// Runs `hook` if the procedure rolls back, in reverse order with the
    /// data changes made around it.
    pub fn on_rollback<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.undo.on_rollback(Box::new(hook));
    }

    /// Returns `true` once any record has been changed in this attempt.
    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.undo.has_dirty()
    }

    pub(crate) fn check_access(&self, lock: LockId, table: &str, key: &dyn Debug) -> CoreResult<()> {
        self.check_interrupted()?;
        if !self.holds(lock) {
            return Err(CoreError::IllegalUnlockedAccess {
                table: table.to_string(),
                key: format!("{key:?}"),
            });
        }
        Ok(())
    }

    pub(crate) fn undo(&self) -> &UndoLog {
        &self.undo
    }

    pub(crate) fn undo_mut(&mut self) -> &mut UndoLog {
        &mut self.undo
    }

    /// Bumped on every commit, rollback and unlock; record handles from an
    /// earlier generation are stale.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn commit(&mut self) -> CommitReport {
        let report = self.undo.commit();
        self.generation += 1;
        self.release_all();
        report
    }

    pub(crate) fn rollback(&mut self) -> usize {
        let applied = self.undo.rollback();
        self.generation += 1;
        self.release_all();
        applied
    }

    fn acquire_sorted(&mut self, slots: &[usize]) -> CoreResult<()> {
        self.unlock()?;
        let owner = self.handle.owner();
        let mut previous = None;
        for &slot in slots {
            if previous == Some(slot) {
                continue;
            }
            previous = Some(slot);

            self.handle.set_waiting(slot);
            let acquired = self
                .pool
                .acquire_slot(slot, owner, self.handle.interrupt_flag());
            self.handle.clear_waiting();

            if !acquired {
                self.release_all();
                return Err(CoreError::Interrupted {
                    procedure: self.handle.name().to_string(),
                });
            }
            self.held.push(slot);
        }
        Ok(())
    }

    fn release_all(&mut self) {
        let owner = self.handle.owner();
        while let Some(slot) = self.held.pop() {
            self.pool.release_slot(slot, owner);
        }
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("procedure", &self.handle.name())
            .field("owner", &self.handle.owner())
            .field("held", &self.held)
            .field("undo", &self.undo)
            .finish()
    }
}
