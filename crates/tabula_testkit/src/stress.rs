//! Stress helpers for Tabula.
//!
//! Drive many concurrent procedures against a database and report what
//! happened. The scenario tests assert invariants on top of these.

use crate::fixtures::Account;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tabula_core::{procedure_fn, CachedTable, CachedTableByLong, Database, LockId, Outcome};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total procedures run.
    pub total_ops: usize,
    /// Procedures that committed.
    pub successful_ops: usize,
    /// Procedures that failed or aborted.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Procedures per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total procedures: {}", self.total_ops);
        println!("Committed: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} procedures/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Procedures per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct records.
    pub record_count: u64,
    /// Locks each procedure takes in the lock-order run.
    pub locks_per_procedure: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 500,
            threads: 8,
            record_count: 64,
            locks_per_procedure: 4,
        }
    }
}

fn run_threads<F>(threads: usize, operations: usize, op: F) -> StressTestResult
where
    F: Fn(usize) -> bool + Sync,
{
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for t in 0..threads {
            let (op, successful, failed) = (&op, &successful, &failed);
            s.spawn(move || {
                for i in 0..operations {
                    if op(t * operations + i) {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Moves random amounts between random accounts from many threads.
///
/// Each transfer locks both accounts with `lock2`, passing them in random
/// order. The sum of balances must not change.
pub fn stress_transfers(db: &Database, accounts: &CachedTable<u64, Account>, config: &StressConfig) -> StressTestResult {
    run_threads(config.threads, config.operations, |_| {
        let mut rng = rand::thread_rng();
        let from = rng.gen_range(0..config.record_count);
        let to = rng.gen_range(0..config.record_count);
        let amount = rng.gen_range(1..=50);

        db.execute(procedure_fn("transfer", |ctx| {
            ctx.lock2(accounts.lock_id(&from), accounts.lock_id(&to))?;
            if from == to {
                return Ok(Outcome::Abort);
            }
            let (Some(src), Some(dst)) = (accounts.get_for_update(ctx, &from)?, accounts.get_for_update(ctx, &to)?) else {
                return Ok(Outcome::Abort);
            };
            if src.read(ctx, |a| a.balance)? < amount {
                return Ok(Outcome::Abort);
            }
            src.update(ctx, |a| a.balance -= amount)?;
            dst.update(ctx, |a| a.balance += amount)?;
            Ok(Outcome::Done)
        }))
        .map(|c| c.is_committed())
        .unwrap_or(false)
    })
}

/// Takes overlapping lock sets in shuffled order from many threads.
///
/// Every procedure increments a counter per locked record, so the final
/// counters sum to the number of committed procedures times the lock count.
pub fn stress_lock_order(db: &Database, counters: &CachedTable<u64, u64>, config: &StressConfig) -> StressTestResult {
    let width = config.locks_per_procedure.max(1);
    run_threads(config.threads, config.operations, |_| {
        let mut rng = rand::thread_rng();
        let mut keys: Vec<u64> = (0..config.record_count).collect();
        keys.shuffle(&mut rng);
        keys.truncate(width);

        db.execute(procedure_fn("lock_order", |ctx| {
            let ids: Vec<LockId> = keys.iter().map(|k| counters.lock_id(k)).collect();
            ctx.lock_all(&ids)?;
            for key in &keys {
                let current = counters.get(ctx, key)?.unwrap_or(0);
                counters.put(ctx, *key, current + 1)?;
            }
            Ok(Outcome::Done)
        }))
        .map(|c| c.is_committed())
        .unwrap_or(false)
    })
}

/// Inserts records with allocated ids from many threads.
///
/// Returns every id handed out, in no particular order.
pub fn stress_inserts(db: &Database, table: &CachedTableByLong<u64>, config: &StressConfig) -> Vec<u64> {
    let ids = parking_lot::Mutex::new(Vec::with_capacity(config.threads * config.operations));
    run_threads(config.threads, config.operations, |n| {
        let mut id = None;
        let committed = db
            .execute(procedure_fn("insert", |ctx| {
                id = Some(table.insert(ctx, n as u64)?);
                Ok(Outcome::Done)
            }))
            .map(|c| c.is_committed())
            .unwrap_or(false);
        if let (true, Some(id)) = (committed, id) {
            ids.lock().push(id);
        }
        committed
    });
    ids.into_inner()
}
