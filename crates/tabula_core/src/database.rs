//! Database service: startup, table registry, procedure entry points and
//! shutdown.

use crate::checkpoint::{self, CheckpointReport, CheckpointState, Checkpointer};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::lock::LockPool;
use crate::procedure::registry::ProcedureRegistry;
use crate::procedure::watchdog::{self, Limits, Watchdog};
use crate::procedure::{default_error_handler, runner, Completion, ErrorHandler, Procedure, RunningProcedure};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::stats::{DatabaseStats, StatsSnapshot, TableStatsSnapshot};
use crate::table::core::{AutoId, TableCore};
use crate::table::{CachedTable, CachedTableByLong, Flushable, TableOptions};
use crate::types::{lock_salt_for_name, SessionId, TableId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tabula_codec::{Bean, TableKey};
use tabula_storage::{Storage, StorageTable};
use tracing::{error, info, warn};

/// State shared by procedures, workers and background threads.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) pool: LockPool,
    pub(crate) registry: ProcedureRegistry,
    /// Read side held by every running procedure; write side by the
    /// checkpoint pause.
    pub(crate) commit_lock: RwLock<()>,
    pub(crate) tables: RwLock<Vec<Arc<dyn Flushable>>>,
    /// Write-back insertions since the last checkpoint started.
    pub(crate) mod_count: Arc<AtomicU64>,
    pub(crate) stats: DatabaseStats,
    pub(crate) error_handler: RwLock<ErrorHandler>,
    pub(crate) exiting: AtomicBool,
    pub(crate) checkpoint: CheckpointState,
}

/// The transactional data layer.
///
/// A `Database` owns the lock pool, the tables opened through it, a worker
/// pool for scheduled procedures, the watchdog and the checkpoint thread.
/// It is created by [`Database::startup`] and closed by
/// [`Database::shutdown`] (also run on drop).
///
/// # Example
///
/// ```rust,ignore
/// use tabula_core::{procedure_fn, Config, Database, Outcome};
/// use tabula_storage::MemoryStorage;
/// use std::sync::Arc;
///
/// let db = Database::startup(Arc::new(MemoryStorage::new()), Config::default())?;
/// let names = db.open_table::<u64, String>(1, "names")?;
///
/// db.execute(procedure_fn("add", |ctx| {
///     ctx.lock(names.lock_id(&1))?;
///     names.put(ctx, 1, "alice".to_string())?;
///     Ok(Outcome::Done)
/// }))?;
///
/// db.shutdown()?;
/// ```
pub struct Database {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    checkpointer: Mutex<Option<Checkpointer>>,
    watchdog: Mutex<Option<Watchdog>>,
    opened: Mutex<HashMap<u32, String>>,
    shut_down: AtomicBool,
}

impl Database {
    /// Starts a database over `storage`.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidConfig`] for a bad configuration, or
    /// [`CoreError::Io`] if a background thread cannot be started.
    pub fn startup(storage: Arc<dyn Storage>, config: Config) -> CoreResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            pool: LockPool::new(config.effective_lock_pool_size()),
            registry: ProcedureRegistry::default(),
            commit_lock: RwLock::new(()),
            tables: RwLock::new(Vec::new()),
            mod_count: Arc::new(AtomicU64::new(0)),
            stats: DatabaseStats::new(),
            error_handler: RwLock::new(default_error_handler()),
            exiting: AtomicBool::new(false),
            checkpoint: CheckpointState::default(),
            storage,
            config,
        });

        let scheduler = Scheduler::new(
            shared.config.effective_worker_threads(),
            shared.config.max_session_procedures,
            shared.config.max_batch_procedures,
        )?;

        let watchdog = if shared.config.watchdog_interval.is_zero() {
            None
        } else {
            let s = Arc::clone(&shared);
            let limits = Limits {
                procedure_timeout: s.config.procedure_timeout,
                deadlock_timeout: s.config.deadlock_timeout,
            };
            Some(Watchdog::spawn(shared.config.watchdog_interval, move || {
                watchdog::scan(&s.registry, &s.pool, limits);
            })?)
        };
        let checkpointer = Checkpointer::spawn(Arc::clone(&shared))?;

        info!(
            name = %shared.config.db_name,
            lock_slots = shared.pool.len(),
            workers = shared.config.effective_worker_threads(),
            "database started"
        );

        Ok(Self {
            shared,
            scheduler,
            checkpointer: Mutex::new(Some(checkpointer)),
            watchdog: Mutex::new(watchdog),
            opened: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Configuration the database runs with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The storage engine.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.shared.storage
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CoreError::DatabaseClosed);
        }
        Ok(())
    }

    fn reserve(&self, id: u32, name: &str) -> CoreResult<()> {
        self.check_open()?;
        let mut opened = self.opened.lock();
        if opened.contains_key(&id) || opened.values().any(|n| n == name) {
            return Err(CoreError::TableExists {
                name: name.to_string(),
            });
        }
        opened.insert(id, name.to_string());
        Ok(())
    }

    fn build_core<K: TableKey, V: Bean>(
        &self,
        id: u32,
        name: &str,
        options: &TableOptions,
        storage: Option<Arc<dyn StorageTable>>,
        auto_id: Option<AutoId>,
    ) -> CoreResult<Arc<TableCore<K, V>>> {
        let capacity = options
            .cache_capacity
            .unwrap_or(self.shared.config.default_cache_capacity);
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| CoreError::invalid_config("cache capacity must be at least 1"))?;
        let salt = options
            .lock_name
            .as_deref()
            .map_or_else(|| TableId(id).lock_salt(), lock_salt_for_name);

        let core = Arc::new(TableCore::new(
            TableId(id),
            name,
            salt,
            capacity,
            storage,
            Arc::clone(&self.shared.mod_count),
            auto_id,
        ));
        self.shared
            .tables
            .write()
            .push(Arc::clone(&core) as Arc<dyn Flushable>);
        info!(table = name, id, capacity = capacity.get(), memory = core.is_memory(), "table opened");
        Ok(core)
    }

    fn open_storage_table(&self, id: u32, name: &str) -> CoreResult<Arc<dyn StorageTable>> {
        self.reserve(id, name)?;
        self.shared.storage.open_table(id, name).map_err(|e| {
            self.opened.lock().remove(&id);
            CoreError::from(e)
        })
    }

    /// Opens a storage-backed table with default options.
    ///
    /// # Errors
    ///
    /// [`CoreError::TableExists`] if the id or name is already open,
    /// or a storage error.
    pub fn open_table<K: TableKey, V: Bean>(&self, id: u32, name: &str) -> CoreResult<CachedTable<K, V>> {
        self.open_table_with(id, name, &TableOptions::default())
    }

    /// Opens a storage-backed table.
    ///
    /// # Errors
    ///
    /// See [`Database::open_table`].
    pub fn open_table_with<K: TableKey, V: Bean>(
        &self,
        id: u32,
        name: &str,
        options: &TableOptions,
    ) -> CoreResult<CachedTable<K, V>> {
        let storage = self.open_storage_table(id, name)?;
        let core = self.build_core(id, name, options, Some(storage), None)?;
        Ok(CachedTable::from_core(core))
    }

    /// Opens an integer-keyed table that can allocate ids.
    ///
    /// The id counter resumes from the value storage saved at the last
    /// checkpoint; the id layout starts from the database configuration.
    ///
    /// # Errors
    ///
    /// See [`Database::open_table`].
    pub fn open_table_by_long<V: Bean>(&self, id: u32, name: &str) -> CoreResult<CachedTableByLong<V>> {
        self.open_table_by_long_with(id, name, &TableOptions::default())
    }

    /// Opens an integer-keyed table with options.
    ///
    /// # Errors
    ///
    /// See [`Database::open_table`].
    pub fn open_table_by_long_with<V: Bean>(
        &self,
        id: u32,
        name: &str,
        options: &TableOptions,
    ) -> CoreResult<CachedTableByLong<V>> {
        let storage = self.open_storage_table(id, name)?;
        let auto_id = AutoId {
            counter: AtomicU64::new(storage.id_counter()),
            low_bits: AtomicU32::new(self.shared.config.auto_id_low_bits),
            offset: AtomicU64::new(self.shared.config.auto_id_offset),
        };
        let core = self.build_core(id, name, options, Some(storage), Some(auto_id))?;
        Ok(CachedTableByLong::new(CachedTable::from_core(core)))
    }

    /// Opens a table that lives only in its read cache.
    ///
    /// # Errors
    ///
    /// [`CoreError::TableExists`] if the id or name is already open.
    pub fn open_memory_table<K: TableKey, V: Bean>(
        &self,
        id: u32,
        name: &str,
        options: &TableOptions,
    ) -> CoreResult<CachedTable<K, V>> {
        self.reserve(id, name)?;
        let core = self.build_core(id, name, options, None, None)?;
        Ok(CachedTable::from_core(core))
    }

    /// Runs a procedure on the calling thread and waits for it.
    ///
    /// Must not be called from inside another procedure. After shutdown
    /// has begun the call never returns.
    ///
    /// # Errors
    ///
    /// The error that failed the procedure, after rollback and after its
    /// error handler ran.
    pub fn execute(&self, mut procedure: impl Procedure) -> CoreResult<Completion> {
        runner::execute(&self.shared, &mut procedure, None)
    }

    /// Queues a procedure on the worker pool.
    ///
    /// # Errors
    ///
    /// [`CoreError::DatabaseClosed`] once shutdown has begun.
    pub fn submit(&self, procedure: impl Procedure + 'static) -> CoreResult<()> {
        let shared = Arc::clone(&self.shared);
        self.scheduler.submit(move || {
            let mut procedure = procedure;
            // Failures were already reported to the procedure's handlers.
            let _ = runner::execute(&shared, &mut procedure, None);
        })
    }

    /// Queues a procedure behind earlier procedures of the same session.
    ///
    /// # Errors
    ///
    /// [`CoreError::SessionOverflow`] if the session queue was full and has
    /// been dropped, [`CoreError::DatabaseClosed`] once shutdown has begun.
    pub fn submit_session(&self, session: SessionId, procedure: impl Procedure + 'static) -> CoreResult<()> {
        let shared = Arc::clone(&self.shared);
        self.scheduler.submit_session(session, move || {
            let mut procedure = procedure;
            let _ = runner::execute(&shared, &mut procedure, Some(session));
        })
    }

    /// Drops a session's pending procedures. Returns how many were dropped.
    pub fn stop_session(&self, session: SessionId) -> usize {
        self.scheduler.stop_session(session)
    }

    /// Runs a checkpoint now and waits for it.
    ///
    /// Must not be called from inside a procedure: the pause phase waits
    /// for every running procedure.
    ///
    /// # Errors
    ///
    /// The error that aborted the cycle; dirty records stay queued.
    pub fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        self.check_open()?;
        checkpoint::run(&self.shared)
    }

    /// Asks the checkpoint thread to run a cycle soon.
    pub fn checkpoint_async(&self) {
        if let Some(checkpointer) = self.checkpointer.lock().as_ref() {
            checkpointer.trigger();
        }
    }

    /// Makes the next checkpoint also take a backup.
    pub fn backup_next_checkpoint(&self) {
        self.shared.checkpoint.request_backup();
    }

    /// Replaces the handler for failures a procedure's `on_error` left
    /// unhandled. The default logs them.
    pub fn set_default_error_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &CoreError) + Send + Sync + 'static,
    {
        *self.shared.error_handler.write() = Box::new(handler);
    }

    /// Committed changes not yet saved to storage, across all tables.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.shared.tables.read().iter().map(|t| t.dirty_count()).sum()
    }

    /// Procedures executing right now.
    #[must_use]
    pub fn running_procedures(&self) -> Vec<RunningProcedure> {
        self.shared.registry.describe()
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Per-table counters.
    #[must_use]
    pub fn table_stats(&self) -> Vec<TableStatsSnapshot> {
        self.shared.tables.read().iter().map(|t| t.stats()).collect()
    }

    /// Worker pool counters.
    #[must_use]
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Returns `true` once shutdown has begun.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Shuts the database down.
    ///
    /// Stops accepting scheduled procedures, waits up to
    /// `shutdown_timeout` for queued ones, stops the background threads,
    /// runs a final checkpoint and closes storage. Procedures started
    /// afterwards park forever. Calling it again does nothing.
    ///
    /// # Errors
    ///
    /// The final checkpoint or storage close failure. Storage is closed
    /// even if the checkpoint failed.
    pub fn shutdown(&self) -> CoreResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(name = %self.shared.config.db_name, "database shutting down");

        self.scheduler.close();
        let drained = self.scheduler.drain(self.shared.config.shutdown_timeout);
        if !drained {
            warn!(
                timeout_ms = self.shared.config.shutdown_timeout.as_millis() as u64,
                "scheduled procedures did not drain before shutdown"
            );
        }
        self.shared.exiting.store(true, Ordering::Release);

        if let Some(mut watchdog) = self.watchdog.lock().take() {
            watchdog.stop();
        }
        if let Some(mut checkpointer) = self.checkpointer.lock().take() {
            checkpointer.stop();
        }

        let checkpoint = checkpoint::run(&self.shared).map(|_| ());
        let closed = self.shared.storage.close().map_err(CoreError::from);
        self.scheduler.shutdown(drained);

        info!(name = %self.shared.config.db_name, "database stopped");
        checkpoint.and(closed)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.shared.config.db_name)
            .field("tables", &self.opened.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{procedure_fn, Outcome};
    use crate::types::OwnerId;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;
    use std::thread;
    use std::time::Duration;
    use tabula_storage::{MemoryStorage, StorageResult};

    fn test_config() -> Config {
        Config::default()
            .worker_threads(2)
            .lock_pool_size(256)
            .max_redo(3)
    }

    fn start() -> (Arc<MemoryStorage>, Database) {
        let storage = Arc::new(MemoryStorage::new());
        let db = Database::startup(storage.clone(), test_config()).unwrap();
        (storage, db)
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (storage, db) = start();
        db.shutdown().unwrap();
        db.shutdown().unwrap();
        assert!(db.is_shut_down());
        assert!(storage.is_closed());
    }

    #[test]
    fn table_ids_and_names_are_unique() {
        let (_storage, db) = start();
        db.open_table::<u64, String>(1, "users").unwrap();
        assert!(matches!(
            db.open_table::<u64, String>(1, "other"),
            Err(CoreError::TableExists { .. })
        ));
        assert!(matches!(
            db.open_memory_table::<u64, String>(2, "users", &TableOptions::default()),
            Err(CoreError::TableExists { .. })
        ));
    }

    #[test]
    fn zero_cache_capacity_is_rejected() {
        let (_storage, db) = start();
        let options = TableOptions::new().cache_capacity(0);
        assert!(matches!(
            db.open_memory_table::<u64, u64>(3, "tiny", &options),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn committed_put_reaches_storage_at_checkpoint() {
        let (storage, db) = start();
        let users = db.open_table::<u64, String>(1, "users").unwrap();

        let completion = db
            .execute(procedure_fn("add", |ctx| {
                ctx.lock(users.lock_id(&1))?;
                users.put(ctx, 1, "ada".to_string())?;
                Ok(Outcome::Done)
            }))
            .unwrap();
        assert_eq!(completion, Completion::Committed { attempts: 1 });
        assert_eq!(db.dirty_count(), 1);

        let stored = storage.open_table(1, "users").unwrap();
        assert_eq!(stored.get(&1u64.encode_key()).unwrap(), None);

        let report = db.checkpoint().unwrap();
        assert_eq!(report.saved(), 1);
        assert!(report.committed);
        assert_eq!(db.dirty_count(), 0);
        let bytes = stored.get(&1u64.encode_key()).unwrap().unwrap();
        assert_eq!(String::unmarshal(&bytes).unwrap(), "ada");
    }

    #[test]
    fn failed_procedure_rolls_back_and_reports() {
        let (_storage, db) = start();
        let users = db.open_table::<u64, String>(1, "users").unwrap();
        let reported = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&reported);
        db.set_default_error_handler(move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let result = db.execute(procedure_fn("broken", |ctx| {
            ctx.lock(users.lock_id(&1))?;
            users.put(ctx, 1, "a".to_string())?;
            Err(CoreError::procedure_failed("boom"))
        }));

        assert!(matches!(result, Err(CoreError::ProcedureFailed { .. })));
        assert_eq!(users.get_no_lock(&1).unwrap(), None);
        assert_eq!(db.dirty_count(), 0);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(db.stats().procedures_failed, 1);
    }

    #[test]
    fn abort_discards_changes() {
        let (_storage, db) = start();
        let users = db.open_table::<u64, String>(1, "users").unwrap();
        let completion = db
            .execute(procedure_fn("abort", |ctx| {
                ctx.lock(users.lock_id(&1))?;
                users.put(ctx, 1, "a".to_string())?;
                Ok(Outcome::Abort)
            }))
            .unwrap();
        assert!(!completion.is_committed());
        assert_eq!(users.get_no_lock(&1).unwrap(), None);
    }

    #[test]
    fn redo_is_bounded() {
        let (_storage, db) = start();
        let attempts = AtomicUsize::new(0);
        let result = db.execute(procedure_fn("spin", |_ctx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Redo)
        }));
        assert!(matches!(result, Err(CoreError::RedoExhausted { attempts: 3, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(db.stats().procedures_redone, 3);
    }

    #[test]
    fn session_procedures_run_in_order() {
        let (_storage, db) = start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            db.submit_session(
                SessionId(9),
                procedure_fn("ordered", move |_ctx| {
                    seen.lock().push(i);
                    Ok(Outcome::Done)
                }),
            )
            .unwrap();
        }
        db.shutdown().unwrap();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let (_storage, db) = start();
        db.shutdown().unwrap();
        let result = db.submit(procedure_fn("late", |_ctx| Ok(Outcome::Done)));
        assert!(matches!(result, Err(CoreError::DatabaseClosed)));
    }

    #[test]
    fn shutdown_saves_dirty_records() {
        let (storage, db) = start();
        let scores = db.open_table::<u64, u64>(4, "scores").unwrap();
        for key in 0..10u64 {
            let table = scores.clone();
            db.submit(procedure_fn("score", move |ctx| {
                ctx.lock(table.lock_id(&key))?;
                table.put(ctx, key, key * 10)?;
                Ok(Outcome::Done)
            }))
            .unwrap();
        }
        db.shutdown().unwrap();

        let restored = MemoryStorage::from_snapshot(storage.snapshot());
        let table = restored.open_table(4, "scores").unwrap();
        assert_eq!(table.len(), 10);
    }

    #[test]
    fn id_counter_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let db = Database::startup(storage.clone(), test_config()).unwrap();
        let items = db.open_table_by_long::<String>(5, "items").unwrap();
        for _ in 0..3 {
            db.execute(procedure_fn("insert", |ctx| {
                items.insert(ctx, "x".to_string())?;
                Ok(Outcome::Done)
            }))
            .unwrap();
        }
        db.shutdown().unwrap();

        let reopened = Arc::new(MemoryStorage::from_snapshot(storage.snapshot()));
        let db = Database::startup(reopened, test_config()).unwrap();
        let items = db.open_table_by_long::<String>(5, "items").unwrap();
        assert_eq!(items.id_counter(), 3);
        let mut id = 0;
        db.execute(procedure_fn("insert", |ctx| {
            id = items.insert(ctx, "y".to_string())?;
            Ok(Outcome::Done)
        }))
        .unwrap();
        assert_eq!(id, 4);
        assert!(items.get_no_lock(&id).unwrap().is_some());
    }

    #[test]
    fn backup_is_written_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config().backup_dir(dir.path()).db_name("game");
        let db = Database::startup(Arc::new(MemoryStorage::new()), config).unwrap();
        db.backup_next_checkpoint();
        let report = db.checkpoint().unwrap();
        let path = report.backup.unwrap();
        assert!(path.exists());
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("game."));
        assert_eq!(db.stats().backups, 1);
    }

    #[test]
    fn running_procedures_are_listed() {
        let (_storage, db) = start();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        db.submit(procedure_fn("sleeper", move |_ctx| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
            Ok(Outcome::Done)
        }))
        .unwrap();

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let running = db.running_procedures();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "sleeper");
        release_tx.send(()).unwrap();
    }

    /// Memory storage that notes, at every final flush, whether procedures
    /// were paused.
    struct PauseWatch {
        inner: MemoryStorage,
        shared: Mutex<Weak<Shared>>,
        final_flushes: Mutex<Vec<bool>>,
    }

    impl PauseWatch {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                shared: Mutex::new(Weak::new()),
                final_flushes: Mutex::new(Vec::new()),
            }
        }
    }

    impl Storage for PauseWatch {
        fn open_table(&self, id: u32, name: &str) -> StorageResult<Arc<dyn StorageTable>> {
            self.inner.open_table(id, name)
        }

        fn table_names(&self) -> Vec<String> {
            self.inner.table_names()
        }

        fn begin_batch(&self) -> StorageResult<()> {
            self.inner.begin_batch()
        }

        fn flush(&self, is_final: bool) -> StorageResult<()> {
            if is_final {
                let paused = self
                    .shared
                    .lock()
                    .upgrade()
                    .is_some_and(|shared| shared.commit_lock.is_locked_exclusive());
                self.final_flushes.lock().push(paused);
            }
            self.inner.flush(is_final)
        }

        fn commit(&self) -> StorageResult<bool> {
            self.inner.commit()
        }

        fn backup(&self, path: &Path) -> StorageResult<u64> {
            self.inner.backup(path)
        }

        fn close(&self) -> StorageResult<()> {
            self.inner.close()
        }
    }

    #[test]
    fn final_flush_happens_inside_the_pause() {
        let storage = Arc::new(PauseWatch::new());
        let db = Database::startup(storage.clone(), test_config()).unwrap();
        *storage.shared.lock() = Arc::downgrade(&db.shared);
        let table = db.open_table::<u64, u64>(1, "numbers").unwrap();
        db.execute(procedure_fn("put", |ctx| {
            ctx.lock(table.lock_id(&1))?;
            table.put(ctx, 1, 10)?;
            Ok(Outcome::Done)
        }))
        .unwrap();

        // A held record lock leaves the record to the pause pass.
        let held = db.shared.pool.try_acquire(table.lock_id(&1), OwnerId(1_000)).unwrap();
        let report = db.checkpoint().unwrap();
        drop(held);
        assert!(report.paused);
        assert_eq!(report.saved_paused, 1);

        let report = db.checkpoint().unwrap();
        assert!(!report.paused);
        assert_eq!(*storage.final_flushes.lock(), vec![true, false]);
    }

    #[test]
    fn waiting_for_a_pause_does_not_count_as_running() {
        let (_, db) = start();
        let pause = db.shared.commit_lock.write();
        thread::scope(|s| {
            let late = s.spawn(|| db.execute(procedure_fn("late", |_| Ok(Outcome::Done))));
            thread::sleep(Duration::from_millis(100));
            assert!(db.running_procedures().is_empty());

            drop(pause);
            assert!(late.join().unwrap().unwrap().is_committed());
        });
    }
}
