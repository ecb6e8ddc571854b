//! Database statistics.
//!
//! Counters are atomic and may be read while procedures run. Values only
//! grow; gauges such as the dirty-record count are sampled on demand.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = db.stats();
//! println!("committed: {}", stats.procedures_committed);
//! println!("checkpoints: {}", stats.checkpoints);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    // Procedure counters
    procedures_committed: AtomicU64,
    procedures_aborted: AtomicU64,
    procedures_failed: AtomicU64,
    procedures_redone: AtomicU64,
    procedures_interrupted: AtomicU64,
    commit_callbacks_failed: AtomicU64,

    // Checkpoint counters
    checkpoints: AtomicU64,
    checkpoint_failures: AtomicU64,
    records_saved: AtomicU64,
    backups: AtomicU64,
}

impl DatabaseStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_commit(&self, failed_callbacks: usize) {
        self.procedures_committed.fetch_add(1, Ordering::Relaxed);
        self.commit_callbacks_failed
            .fetch_add(failed_callbacks as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.procedures_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, interrupted: bool) {
        self.procedures_failed.fetch_add(1, Ordering::Relaxed);
        if interrupted {
            self.procedures_interrupted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_redo(&self) {
        self.procedures_redone.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self, saved: u64) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.records_saved.fetch_add(saved, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint_failure(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backup(&self) {
        self.backups.fetch_add(1, Ordering::Relaxed);
    }

    /// Procedures that committed.
    pub fn procedures_committed(&self) -> u64 {
        self.procedures_committed.load(Ordering::Relaxed)
    }

    /// Procedures that returned [`crate::Outcome::Abort`].
    pub fn procedures_aborted(&self) -> u64 {
        self.procedures_aborted.load(Ordering::Relaxed)
    }

    /// Procedures that ended with an error.
    pub fn procedures_failed(&self) -> u64 {
        self.procedures_failed.load(Ordering::Relaxed)
    }

    /// Redo requests across all procedures.
    pub fn procedures_redone(&self) -> u64 {
        self.procedures_redone.load(Ordering::Relaxed)
    }

    /// Failed procedures whose error was an interruption.
    pub fn procedures_interrupted(&self) -> u64 {
        self.procedures_interrupted.load(Ordering::Relaxed)
    }

    /// Completed checkpoints.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            procedures_committed: self.procedures_committed(),
            procedures_aborted: self.procedures_aborted(),
            procedures_failed: self.procedures_failed(),
            procedures_redone: self.procedures_redone(),
            procedures_interrupted: self.procedures_interrupted(),
            commit_callbacks_failed: self.commit_callbacks_failed.load(Ordering::Relaxed),
            checkpoints: self.checkpoints(),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            records_saved: self.records_saved.load(Ordering::Relaxed),
            backups: self.backups.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of database statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Procedures that committed.
    pub procedures_committed: u64,
    /// Procedures that aborted without error.
    pub procedures_aborted: u64,
    /// Procedures that ended with an error.
    pub procedures_failed: u64,
    /// Redo requests.
    pub procedures_redone: u64,
    /// Failures caused by interruption.
    pub procedures_interrupted: u64,
    /// Commit callbacks that failed.
    pub commit_callbacks_failed: u64,
    /// Completed checkpoints.
    pub checkpoints: u64,
    /// Checkpoints aborted by an error.
    pub checkpoint_failures: u64,
    /// Records written to storage by checkpoints.
    pub records_saved: u64,
    /// Backups taken.
    pub backups: u64,
}

/// Per-table counters.
#[derive(Debug, Default)]
pub struct TableStats {
    reads: AtomicU64,
    storage_reads: AtomicU64,
    evictions: AtomicU64,
}

impl TableStats {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_storage_read(&self) {
        self.storage_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Total lookups.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Lookups that missed both caches and went to storage.
    pub fn storage_reads(&self) -> u64 {
        self.storage_reads.load(Ordering::Relaxed)
    }

    /// Entries pushed out of the read cache.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// A point-in-time snapshot of one table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableStatsSnapshot {
    /// Table name.
    pub name: String,
    /// Total lookups.
    pub reads: u64,
    /// Lookups served by storage.
    pub storage_reads: u64,
    /// Read-cache evictions.
    pub evictions: u64,
    /// Entries currently in the read cache.
    pub cached: usize,
    /// Entries waiting in the write-back cache.
    pub dirty: usize,
}
