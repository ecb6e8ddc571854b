//! Database configuration.

use crate::error::{CoreError, CoreResult};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for starting a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of lock slots. Rounded up to a power of two.
    pub lock_pool_size: usize,

    /// Maximum number of locks one `Context::lock_all` call may take.
    pub max_locks_per_procedure: usize,

    /// Maximum number of attempts for a procedure that keeps asking for redo.
    pub max_redo: u32,

    /// Worker threads for scheduled procedures (0 = available parallelism).
    pub worker_threads: usize,

    /// Maximum queued procedures per session before the queue is dropped.
    pub max_session_procedures: usize,

    /// Procedures a session runs per dispatch before yielding its worker.
    pub max_batch_procedures: usize,

    /// Read-cache capacity for tables opened without an explicit one.
    pub default_cache_capacity: usize,

    /// How often the checkpoint runs (zero = only on demand).
    pub commit_period: Duration,

    /// Dirty-record count that triggers a checkpoint before the period ends.
    pub commit_dirty_threshold: usize,

    /// Dirty records left after the opportunistic pass that trigger a second pass.
    pub resave_threshold: usize,

    /// How often a checkpoint also takes a backup (zero = never).
    pub backup_period: Duration,

    /// Directory for backups. Backups are skipped when unset.
    pub backup_dir: Option<PathBuf>,

    /// Database name, used as the backup file prefix.
    pub db_name: String,

    /// Running time after which the watchdog interrupts a procedure.
    pub procedure_timeout: Duration,

    /// Running time after which a deadlocked procedure is interrupted.
    pub deadlock_timeout: Duration,

    /// Watchdog scan interval (zero disables the watchdog).
    pub watchdog_interval: Duration,

    /// Granularity of the checkpoint thread's timer.
    pub checkpoint_tick: Duration,

    /// How long shutdown waits for scheduled procedures to drain.
    pub shutdown_timeout: Duration,

    /// Low bits reserved below every auto-increment id.
    pub auto_id_low_bits: u32,

    /// Value added to every auto-increment id.
    pub auto_id_offset: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_pool_size: 65536,
            max_locks_per_procedure: 16,
            max_redo: 256,
            worker_threads: 0,
            max_session_procedures: 65536,
            max_batch_procedures: 256,
            default_cache_capacity: 10_000,
            commit_period: Duration::from_secs(60),
            commit_dirty_threshold: 200_000,
            resave_threshold: 200_000,
            backup_period: Duration::from_secs(3600),
            backup_dir: None,
            db_name: "tabula".to_string(),
            procedure_timeout: Duration::from_secs(60),
            deadlock_timeout: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(10),
            checkpoint_tick: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            auto_id_low_bits: 0,
            auto_id_offset: 0,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of lock slots.
    #[must_use]
    pub const fn lock_pool_size(mut self, size: usize) -> Self {
        self.lock_pool_size = size;
        self
    }

    /// Sets the per-procedure lock limit.
    #[must_use]
    pub const fn max_locks_per_procedure(mut self, max: usize) -> Self {
        self.max_locks_per_procedure = max;
        self
    }

    /// Sets the redo limit.
    #[must_use]
    pub const fn max_redo(mut self, max: u32) -> Self {
        self.max_redo = max;
        self
    }

    /// Sets the worker thread count.
    #[must_use]
    pub const fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets the session queue limit.
    #[must_use]
    pub const fn max_session_procedures(mut self, max: usize) -> Self {
        self.max_session_procedures = max;
        self
    }

    /// Sets how many session procedures run per dispatch.
    #[must_use]
    pub const fn max_batch_procedures(mut self, max: usize) -> Self {
        self.max_batch_procedures = max;
        self
    }

    /// Sets the default read-cache capacity.
    #[must_use]
    pub const fn default_cache_capacity(mut self, capacity: usize) -> Self {
        self.default_cache_capacity = capacity;
        self
    }

    /// Sets the checkpoint period.
    #[must_use]
    pub const fn commit_period(mut self, period: Duration) -> Self {
        self.commit_period = period;
        self
    }

    /// Sets the dirty-record count that forces an early checkpoint.
    #[must_use]
    pub const fn commit_dirty_threshold(mut self, count: usize) -> Self {
        self.commit_dirty_threshold = count;
        self
    }

    /// Sets the resave threshold.
    #[must_use]
    pub const fn resave_threshold(mut self, count: usize) -> Self {
        self.resave_threshold = count;
        self
    }

    /// Sets the backup period.
    #[must_use]
    pub const fn backup_period(mut self, period: Duration) -> Self {
        self.backup_period = period;
        self
    }

    /// Sets the backup directory.
    #[must_use]
    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    /// Sets the database name.
    #[must_use]
    pub fn db_name(mut self, name: impl Into<String>) -> Self {
        self.db_name = name.into();
        self
    }

    /// Sets the procedure timeout.
    #[must_use]
    pub const fn procedure_timeout(mut self, timeout: Duration) -> Self {
        self.procedure_timeout = timeout;
        self
    }

    /// Sets the deadlock timeout.
    #[must_use]
    pub const fn deadlock_timeout(mut self, timeout: Duration) -> Self {
        self.deadlock_timeout = timeout;
        self
    }

    /// Sets the watchdog scan interval.
    #[must_use]
    pub const fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Sets the checkpoint timer granularity.
    #[must_use]
    pub const fn checkpoint_tick(mut self, tick: Duration) -> Self {
        self.checkpoint_tick = tick;
        self
    }

    /// Sets the shutdown drain timeout.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the auto-increment layout for new integer-keyed tables.
    #[must_use]
    pub const fn auto_id(mut self, low_bits: u32, offset: u64) -> Self {
        self.auto_id_low_bits = low_bits;
        self.auto_id_offset = offset;
        self
    }

    /// Lock pool size rounded up to a power of two.
    #[must_use]
    pub fn effective_lock_pool_size(&self) -> usize {
        self.lock_pool_size.max(1).next_power_of_two()
    }

    /// Worker count with `0` resolved to the machine's parallelism.
    #[must_use]
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism().map_or(4, |n| n.get())
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the first bad parameter.
    pub fn validate(&self) -> CoreResult<()> {
        if self.lock_pool_size == 0 || self.lock_pool_size > 1 << 30 {
            return Err(CoreError::invalid_config("lock_pool_size must be in 1..=2^30"));
        }
        if self.max_locks_per_procedure < 4 {
            return Err(CoreError::invalid_config(
                "max_locks_per_procedure must be at least 4",
            ));
        }
        if self.max_redo == 0 {
            return Err(CoreError::invalid_config("max_redo must be at least 1"));
        }
        if self.max_session_procedures == 0 || self.max_batch_procedures == 0 {
            return Err(CoreError::invalid_config(
                "session queue and batch limits must be at least 1",
            ));
        }
        validate_auto_id(self.auto_id_low_bits, self.auto_id_offset)?;
        if self.checkpoint_tick.is_zero() {
            return Err(CoreError::invalid_config("checkpoint_tick must be non-zero"));
        }
        Ok(())
    }
}

/// Checks an auto-increment layout.
pub(crate) fn validate_auto_id(low_bits: u32, offset: u64) -> CoreResult<()> {
    if low_bits >= 32 {
        return Err(CoreError::invalid_config("auto_id_low_bits must be below 32"));
    }
    if offset >= 1u64 << low_bits {
        return Err(CoreError::invalid_config(
            "auto_id_offset must fit inside the reserved low bits",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.lock_pool_size, 65536);
        assert_eq!(config.max_locks_per_procedure, 16);
        assert_eq!(config.max_redo, 256);
        assert_eq!(config.commit_period, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .lock_pool_size(1000)
            .max_redo(3)
            .backup_dir("/tmp/backups")
            .auto_id(4, 3);

        assert_eq!(config.effective_lock_pool_size(), 1024);
        assert_eq!(config.max_redo, 3);
        assert_eq!(config.backup_dir, Some(PathBuf::from("/tmp/backups")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(Config::new().max_redo(0).validate().is_err());
        assert!(Config::new().max_locks_per_procedure(2).validate().is_err());
        assert!(Config::new().auto_id(2, 4).validate().is_err());
        assert!(Config::new().auto_id(40, 0).validate().is_err());
        assert!(Config::new().lock_pool_size(0).validate().is_err());
    }
}
