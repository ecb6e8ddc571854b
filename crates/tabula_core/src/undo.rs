//! Per-procedure undo log.
//!
//! Every mutation a procedure makes registers an [`UndoEntry`] that restores
//! the previous state. Commit discards the entries and publishes dirty
//! records to their tables; rollback replays the entries newest first.

use crate::error::{panic_message, CoreResult};
use crate::types::TableId;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Action that restores state on rollback.
pub type RollbackFn = Box<dyn FnOnce() + Send>;

/// Callback run after a successful commit.
pub type CommitFn = Box<dyn FnOnce() -> CoreResult<()> + Send>;

/// One inverse operation.
///
/// The variant records what kind of change is being undone; the payload
/// holds the captured previous value and knows how to put it back.
pub enum UndoEntry {
    /// Restores a single field of a record.
    FieldSet(RollbackFn),
    /// Restores a whole record from a copy taken before its first change.
    Snapshot(RollbackFn),
    /// Restores the cache state a `put` replaced.
    PutReplace(RollbackFn),
    /// Restores the cache state a `remove` replaced.
    RemoveRestore(RollbackFn),
    /// User rollback hook.
    Hook(RollbackFn),
}

impl UndoEntry {
    /// Short name of the entry kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FieldSet(_) => "field-set",
            Self::Snapshot(_) => "snapshot",
            Self::PutReplace(_) => "put-replace",
            Self::RemoveRestore(_) => "remove-restore",
            Self::Hook(_) => "hook",
        }
    }

    fn into_action(self) -> RollbackFn {
        match self {
            Self::FieldSet(f)
            | Self::Snapshot(f)
            | Self::PutReplace(f)
            | Self::RemoveRestore(f)
            | Self::Hook(f) => f,
        }
    }
}

impl std::fmt::Debug for UndoEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// A record a procedure obtained for update.
pub(crate) struct TrackedRecord {
    pub(crate) table: TableId,
    pub(crate) key: Box<dyn Any + Send>,
    pub(crate) cell: Arc<dyn Any + Send + Sync>,
    pub(crate) dirty: bool,
    pub(crate) full_undo: bool,
    /// Set once a later `put`/`remove` replaced the record's value.
    pub(crate) detached: bool,
    publish: Option<Box<dyn FnOnce() + Send>>,
}

impl TrackedRecord {
    pub(crate) fn new(
        table: TableId,
        key: Box<dyn Any + Send>,
        cell: Arc<dyn Any + Send + Sync>,
        publish: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            table,
            key,
            cell,
            dirty: false,
            full_undo: false,
            detached: false,
            publish: Some(publish),
        }
    }
}

/// Outcome of [`UndoLog::commit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Dirty records pushed to write-back caches.
    pub published: usize,
    /// Commit callbacks that returned an error or panicked.
    pub failed_callbacks: usize,
}

/// The undo state of one procedure attempt.
#[derive(Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
    records: Vec<TrackedRecord>,
    on_commit: Vec<CommitFn>,
    has_dirty: bool,
}

impl UndoLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry that does not by itself make the procedure dirty.
    pub fn push(&mut self, entry: UndoEntry) {
        self.entries.push(entry);
    }

    /// Appends an entry for a data change.
    pub fn push_dirty(&mut self, entry: UndoEntry) {
        self.entries.push(entry);
        self.has_dirty = true;
    }

    /// Registers a callback to run after commit, in registration order.
    pub fn on_commit(&mut self, callback: CommitFn) {
        self.on_commit.push(callback);
    }

    /// Registers a hook to run on rollback, interleaved with data undo.
    pub fn on_rollback(&mut self, hook: RollbackFn) {
        self.entries.push(UndoEntry::Hook(hook));
    }

    /// Number of pending undo entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing would be undone.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` once any record has been changed.
    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.has_dirty || self.records.iter().any(|r| r.dirty)
    }

    pub(crate) fn track(&mut self, record: TrackedRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    pub(crate) fn find_record<K: PartialEq + 'static>(&self, table: TableId, key: &K) -> Option<usize> {
        self.records.iter().position(|r| {
            !r.detached && r.table == table && r.key.downcast_ref::<K>() == Some(key)
        })
    }

    pub(crate) fn detach_record<K: PartialEq + 'static>(&mut self, table: TableId, key: &K) {
        if let Some(index) = self.find_record(table, key) {
            self.records[index].detached = true;
        }
    }

    /// Drops tracked records once their locks are released.
    ///
    /// Only called while nothing is dirty, so no change is lost.
    pub(crate) fn forget_records(&mut self) {
        debug_assert!(!self.has_dirty());
        self.records.clear();
    }

    pub(crate) fn record(&self, index: usize) -> Option<&TrackedRecord> {
        self.records.get(index)
    }

    pub(crate) fn record_mut(&mut self, index: usize) -> Option<&mut TrackedRecord> {
        self.records.get_mut(index)
    }

    /// Publishes dirty records, drops undo entries and runs commit callbacks.
    ///
    /// Callback failures are logged and counted; they cannot undo the commit.
    pub fn commit(&mut self) -> CommitReport {
        let mut report = CommitReport::default();
        self.entries.clear();

        for record in self.records.drain(..) {
            if record.dirty && !record.detached {
                if let Some(publish) = record.publish {
                    publish();
                    report.published += 1;
                }
            }
        }

        for callback in self.on_commit.drain(..) {
            match catch_unwind(AssertUnwindSafe(callback)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "commit callback failed");
                    report.failed_callbacks += 1;
                }
                Err(payload) => {
                    error!(panic = %panic_message(payload.as_ref()), "commit callback panicked");
                    report.failed_callbacks += 1;
                }
            }
        }

        self.has_dirty = false;
        report
    }

    /// Replays undo entries newest first and forgets tracked records.
    ///
    /// Returns the number of entries applied.
    pub fn rollback(&mut self) -> usize {
        self.records.clear();
        self.on_commit.clear();

        let applied = self.entries.len();
        while let Some(entry) = self.entries.pop() {
            let kind = entry.kind();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(entry.into_action())) {
                error!(kind, panic = %panic_message(payload.as_ref()), "rollback entry panicked");
            }
        }

        self.has_dirty = false;
        applied
    }
}

impl std::fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoLog")
            .field("entries", &self.entries)
            .field("records", &self.records.len())
            .field("on_commit", &self.on_commit.len())
            .field("has_dirty", &self.has_dirty)
            .finish()
    }
}
