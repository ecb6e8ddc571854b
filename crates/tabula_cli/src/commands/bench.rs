//! Bench command: concurrent transfers against a file database.

use rand::Rng;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tabula_core::{procedure_fn, CachedTable, Config, Database, Outcome};
use tabula_storage::FileStorage;
use tracing::info;

const ACCOUNTS_TABLE: u32 = 1;
const START_BALANCE: i64 = 1_000;

/// Bench parameters.
#[derive(Debug, Clone)]
pub struct BenchOptions {
    /// Threads executing procedures.
    pub threads: usize,
    /// Procedures per thread.
    pub procedures: usize,
    /// Number of accounts.
    pub accounts: u64,
}

/// Bench result.
#[derive(Debug, Serialize)]
pub struct BenchResult {
    /// Procedures executed.
    pub procedures: usize,
    /// Procedures that committed.
    pub committed: usize,
    /// Procedures that aborted or failed.
    pub not_committed: usize,
    /// Wall time of the transfer phase in milliseconds.
    pub duration_ms: u128,
    /// Procedures per second.
    pub per_second: f64,
    /// Records written by the final checkpoint.
    pub checkpoint_saved: usize,
    /// Whether the final checkpoint had to pause procedures.
    pub checkpoint_paused: bool,
    /// Sum of balances before the run.
    pub total_before: i64,
    /// Sum of balances after the run.
    pub total_after: i64,
}

/// Runs the bench against the database directory at `path`.
pub fn run(path: &Path, options: &BenchOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = bench(path, options)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    if result.total_before != result.total_after {
        return Err("balance total changed during the run".into());
    }
    Ok(())
}

fn bench(path: &Path, options: &BenchOptions) -> Result<BenchResult, Box<dyn std::error::Error>> {
    let storage = Arc::new(FileStorage::open(path)?);
    let config = Config::default().worker_threads(options.threads);
    let db = Database::startup(storage, config)?;
    let accounts: CachedTable<u64, i64> = db.open_table(ACCOUNTS_TABLE, "accounts")?;

    for id in 0..options.accounts {
        db.execute(procedure_fn("open_account", |ctx| {
            ctx.lock(accounts.lock_id(&id))?;
            if accounts.get(ctx, &id)?.is_none() {
                accounts.put(ctx, id, START_BALANCE)?;
            }
            Ok(Outcome::Done)
        }))?;
    }
    let total_before = total(&accounts, options.accounts)?;
    info!(accounts = options.accounts, total = total_before, "accounts ready");

    let committed = AtomicUsize::new(0);
    let started = Instant::now();
    thread::scope(|s| {
        for _ in 0..options.threads {
            s.spawn(|| {
                let mut rng = rand::thread_rng();
                for _ in 0..options.procedures {
                    let from = rng.gen_range(0..options.accounts);
                    let to = rng.gen_range(0..options.accounts);
                    let amount = rng.gen_range(1..=100);
                    let outcome = db.execute(procedure_fn("transfer", |ctx| {
                        ctx.lock2(accounts.lock_id(&from), accounts.lock_id(&to))?;
                        let balance = accounts.get(ctx, &from)?.unwrap_or(0);
                        if from == to || balance < amount {
                            return Ok(Outcome::Abort);
                        }
                        let target = accounts.get(ctx, &to)?.unwrap_or(0);
                        accounts.put(ctx, from, balance - amount)?;
                        accounts.put(ctx, to, target + amount)?;
                        Ok(Outcome::Done)
                    }));
                    if matches!(outcome, Ok(c) if c.is_committed()) {
                        committed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    let elapsed = started.elapsed();

    let report = db.checkpoint()?;
    let total_after = total(&accounts, options.accounts)?;
    db.shutdown()?;

    let procedures = options.threads * options.procedures;
    let committed = committed.into_inner();
    Ok(BenchResult {
        procedures,
        committed,
        not_committed: procedures - committed,
        duration_ms: elapsed.as_millis(),
        per_second: if elapsed.as_secs_f64() > 0.0 {
            procedures as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        },
        checkpoint_saved: report.saved(),
        checkpoint_paused: report.paused,
        total_before,
        total_after,
    })
}

fn total(accounts: &CachedTable<u64, i64>, count: u64) -> Result<i64, Box<dyn std::error::Error>> {
    let mut sum = 0;
    for id in 0..count {
        sum += accounts.get_no_lock(&id)?.unwrap_or(0);
    }
    Ok(sum)
}

fn print_text_output(result: &BenchResult) {
    println!("Tabula Bench");
    println!("============");
    println!();
    println!("Procedures: {}", result.procedures);
    println!("Committed:  {}", result.committed);
    println!("Other:      {}", result.not_committed);
    println!("Duration:   {} ms", result.duration_ms);
    println!("Throughput: {:.2} procedures/sec", result.per_second);
    println!();
    println!(
        "Checkpoint: {} records saved{}",
        result.checkpoint_saved,
        if result.checkpoint_paused { " (paused)" } else { "" }
    );
    println!("Balance:    {} -> {}", result.total_before, result.total_after);
}
