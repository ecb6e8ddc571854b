//! Checkpoint: moves write-back caches into storage.
//!
//! One cycle runs these phases, each logged with its counts:
//!
//! 1. Opportunistic pass: save every dirty record whose lock is free.
//! 2. Resave pass: if at least `resave_threshold` records are still dirty,
//!    run the opportunistic pass once more.
//! 3. Pause pass: if anything is still dirty, take the commit lock
//!    exclusively, which waits for running procedures and blocks new ones,
//!    and save the rest. Id counters and the final storage flush happen
//!    while the lock is still held.
//! 4. Storage commit, then a backup when one is due.
//!
//! An error aborts the cycle. Records are only dropped from a write-back
//! cache after storage accepted them, so the next cycle retries the rest.

use crate::database::Shared;
use crate::error::CoreResult;
use crate::signal::{Signal, Wake};
use crate::table::Flushable;
use chrono::Local;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabula_storage::Storage;
use tracing::{debug, error, info, warn};

/// Format of the timestamp appended to backup file names.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%y-%m-%d-%H-%M-%S";

/// What one checkpoint cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Dirty records when the cycle started.
    pub dirty_at_start: usize,
    /// Records saved by the opportunistic pass.
    pub saved_opportunistic: usize,
    /// Records saved by the resave pass.
    pub saved_resave: usize,
    /// Records saved while procedures were paused.
    pub saved_paused: usize,
    /// Whether the pause pass ran.
    pub paused: bool,
    /// Whether storage reported a successful commit.
    pub committed: bool,
    /// Backup written by this cycle.
    pub backup: Option<PathBuf>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl CheckpointReport {
    /// Records written to storage by the cycle.
    #[must_use]
    pub fn saved(&self) -> usize {
        self.saved_opportunistic + self.saved_resave + self.saved_paused
    }
}

/// Checkpoint bookkeeping shared by every trigger.
#[derive(Debug)]
pub(crate) struct CheckpointState {
    cycle: Mutex<()>,
    last_run: Mutex<Instant>,
    last_backup: Mutex<Instant>,
    backup_next: AtomicBool,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            cycle: Mutex::new(()),
            last_run: Mutex::new(Instant::now()),
            last_backup: Mutex::new(Instant::now()),
            backup_next: AtomicBool::new(false),
        }
    }
}

impl CheckpointState {
    pub(crate) fn request_backup(&self) {
        self.backup_next.store(true, Ordering::Release);
    }

    fn since_last_run(&self) -> Duration {
        self.last_run.lock().elapsed()
    }
}

/// Runs one full checkpoint cycle. Cycles never overlap.
pub(crate) fn run(shared: &Shared) -> CoreResult<CheckpointReport> {
    let _cycle = shared.checkpoint.cycle.lock();
    let started = Instant::now();
    *shared.checkpoint.last_run.lock() = started;
    shared.mod_count.store(0, Ordering::Release);

    match run_phases(shared, started) {
        Ok(report) => {
            if report.committed {
                shared.stats.record_checkpoint(report.saved() as u64);
            } else {
                shared.stats.record_checkpoint_failure();
            }
            info!(
                saved = report.saved(),
                paused = report.paused,
                committed = report.committed,
                duration_ms = report.duration.as_millis() as u64,
                "checkpoint finished"
            );
            Ok(report)
        }
        Err(e) => {
            shared.stats.record_checkpoint_failure();
            error!(error = %e, "checkpoint aborted; dirty records kept for the next cycle");
            Err(e)
        }
    }
}

fn run_phases(shared: &Shared, started: Instant) -> CoreResult<CheckpointReport> {
    let tables: Vec<Arc<dyn Flushable>> = shared.tables.read().clone();
    let storage = shared.storage.as_ref();
    let mut report = CheckpointReport {
        dirty_at_start: dirty_count(&tables),
        ..CheckpointReport::default()
    };

    storage.begin_batch()?;

    let (saved, remaining) = opportunistic_pass(shared, &tables)?;
    report.saved_opportunistic = saved;
    info!(phase = 1, dirty = report.dirty_at_start, saved, remaining, "checkpoint opportunistic pass");

    if remaining > 0 && remaining >= shared.config.resave_threshold {
        let (saved, remaining) = opportunistic_pass(shared, &tables)?;
        report.saved_resave = saved;
        info!(phase = 2, saved, remaining, "checkpoint resave pass");
    }

    storage.flush(false)?;

    if dirty_count(&tables) > 0 {
        let pause_started = Instant::now();
        let _pause = shared.commit_lock.write();
        for table in &tables {
            report.saved_paused += table.save_dirty()?;
        }
        final_flush(storage, &tables)?;
        report.paused = true;
        info!(
            phase = 3,
            saved = report.saved_paused,
            pause_ms = pause_started.elapsed().as_millis() as u64,
            "checkpoint pause pass"
        );
    } else {
        final_flush(storage, &tables)?;
    }

    report.committed = storage.commit()?;
    if !report.committed {
        warn!("storage rejected the checkpoint commit");
    }

    if report.committed && backup_due(shared) {
        report.backup = backup(shared)?;
    }

    report.duration = started.elapsed();
    Ok(report)
}

fn final_flush(storage: &dyn Storage, tables: &[Arc<dyn Flushable>]) -> CoreResult<()> {
    for table in tables {
        table.save_id_counter();
    }
    storage.flush(true)?;
    Ok(())
}

fn opportunistic_pass(shared: &Shared, tables: &[Arc<dyn Flushable>]) -> CoreResult<(usize, usize)> {
    let mut saved = 0;
    let mut remaining = 0;
    for table in tables {
        let counts = table.try_save_dirty(&shared.pool)?;
        saved += counts.saved;
        remaining += counts.remaining;
    }
    Ok((saved, remaining))
}

fn dirty_count(tables: &[Arc<dyn Flushable>]) -> usize {
    tables.iter().map(|t| t.dirty_count()).sum()
}

fn backup_due(shared: &Shared) -> bool {
    if shared.config.backup_dir.is_none() {
        return false;
    }
    if shared.checkpoint.backup_next.load(Ordering::Acquire) {
        return true;
    }
    let period = shared.config.backup_period;
    !period.is_zero() && shared.checkpoint.last_backup.lock().elapsed() >= period
}

/// Writes `<backup_dir>/<db_name>.<timestamp>`.
fn backup(shared: &Shared) -> CoreResult<Option<PathBuf>> {
    let Some(dir) = &shared.config.backup_dir else {
        return Ok(None);
    };
    let stamp = Local::now().format(BACKUP_TIMESTAMP_FORMAT);
    let path = dir.join(format!("{}.{stamp}", shared.config.db_name));

    let bytes = shared.storage.backup(&path)?;
    shared.checkpoint.backup_next.store(false, Ordering::Release);
    *shared.checkpoint.last_backup.lock() = Instant::now();
    shared.stats.record_backup();
    info!(path = %path.display(), bytes, "backup written");
    Ok(Some(path))
}

/// Background thread that runs checkpoints on the period, on the
/// dirty-record threshold, or when triggered.
pub(crate) struct Checkpointer {
    signal: Arc<Signal>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Checkpointer {
    pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<Self> {
        let signal = Arc::new(Signal::default());
        let s = Arc::clone(&signal);
        let thread = std::thread::Builder::new()
            .name("tabula-checkpoint".to_string())
            .spawn(move || checkpoint_loop(&shared, &s))?;
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    pub(crate) fn trigger(&self) {
        self.signal.trigger();
    }

    pub(crate) fn stop(&mut self) {
        self.signal.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("checkpoint thread panicked");
            }
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn checkpoint_loop(shared: &Shared, signal: &Signal) {
    let period = shared.config.commit_period;
    let threshold = shared.config.commit_dirty_threshold;
    loop {
        let due = match signal.wait(shared.config.checkpoint_tick) {
            Wake::Stop => return,
            Wake::Trigger => true,
            Wake::Timeout => {
                (!period.is_zero() && shared.checkpoint.since_last_run() >= period)
                    || (threshold > 0 && shared.mod_count.load(Ordering::Acquire) >= threshold as u64)
            }
        };
        if due {
            debug!("checkpoint due");
            // Failures are logged inside; the next cycle retries.
            let _ = run(shared);
        }
    }
}
