//! # Tabula Core
//!
//! In-process transactional data layer for Tabula.
//!
//! Business logic runs as *procedures*: short units of work that lock the
//! records they touch, change cached values in place and either commit or
//! roll back as a whole. Committed changes stay in per-table write-back
//! caches until a background checkpoint moves them into storage.
//!
//! This crate provides:
//! - [`LockPool`] - a fixed pool of mutexes addressed by hashed lock ids
//! - [`CachedTable`] / [`CachedTableByLong`] - LRU read caches with write-back
//! - [`Safe`] - a locked, undo-tracked handle to one cached record
//! - [`Procedure`] and [`Context`] - the unit of work and its lock/undo state
//! - [`Database`] - startup, scheduling, watchdog, checkpoints and shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tabula_core::{procedure_fn, Config, Database, Outcome};
//! use tabula_storage::MemoryStorage;
//!
//! # fn main() -> tabula_core::CoreResult<()> {
//! let db = Database::startup(Arc::new(MemoryStorage::new()), Config::default())?;
//! let balances = db.open_table::<u64, i64>(1, "balances")?;
//!
//! let table = balances.clone();
//! db.execute(procedure_fn("deposit", move |ctx| {
//!     ctx.lock(table.lock_id(&7))?;
//!     let current = table.get(ctx, &7)?.unwrap_or(0);
//!     table.put(ctx, 7, current + 100)?;
//!     Ok(Outcome::Done)
//! }))?;
//!
//! db.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod database;
mod error;
mod lock;
mod procedure;
mod safe;
mod scheduler;
mod signal;
mod stats;
mod table;
mod types;
mod undo;

pub use checkpoint::{CheckpointReport, BACKUP_TIMESTAMP_FORMAT};
pub use config::Config;
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use lock::{LockGuard, LockPool};
pub use procedure::{
    procedure_fn, Completion, Context, ErrorHandler, FnProcedure, Outcome, Procedure, RunningProcedure,
};
pub use safe::Safe;
pub use scheduler::{Scheduler, SchedulerStats};
pub use stats::{DatabaseStats, StatsSnapshot, TableStats, TableStatsSnapshot};
pub use table::{CachedTable, CachedTableByLong, KeyRange, SaveCounts, TableOptions};
pub use types::{lock_salt_for_name, LockId, OwnerId, SessionId, TableId};
pub use undo::{CommitFn, CommitReport, RollbackFn, UndoEntry, UndoLog};

pub use tabula_codec::{impl_serde_bean, Bean, TableKey};
