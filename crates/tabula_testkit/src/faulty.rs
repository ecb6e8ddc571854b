//! Storage wrapper that fails on command.
//!
//! [`FaultyStorage`] forwards to a real engine until a test arms one of
//! its faults. Used to check that checkpoint failures keep dirty records
//! and that the next cycle recovers once the fault clears.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tabula_storage::{Storage, StorageError, StorageResult, StorageTable, WalkRange};

#[derive(Debug, Default)]
struct Faults {
    fail_puts: AtomicBool,
    fail_flush: AtomicBool,
    fail_commit: AtomicBool,
    reject_commit: AtomicBool,
    fail_backup: AtomicBool,
    /// Puts still allowed before `fail_puts` takes effect.
    puts_before_failure: AtomicUsize,
    puts: AtomicUsize,
    commits: AtomicUsize,
}

impl Faults {
    fn check_put(&self) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if !self.fail_puts.load(Ordering::SeqCst) {
            return Ok(());
        }
        let allowed = self
            .puts_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match allowed {
            Ok(_) => Ok(()),
            Err(_) => Err(StorageError::injected("put")),
        }
    }
}

/// A [`Storage`] whose writes, flushes, commits and backups can be made to
/// fail.
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    faults: Arc<Faults>,
    tables: Mutex<Vec<Arc<FaultyTable>>>,
}

impl FaultyStorage {
    /// Wraps `inner` with every fault disarmed.
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
            tables: Mutex::new(Vec::new()),
        }
    }

    /// Makes every table write fail.
    pub fn fail_puts(&self, on: bool) {
        self.faults.puts_before_failure.store(0, Ordering::SeqCst);
        self.faults.fail_puts.store(on, Ordering::SeqCst);
    }

    /// Lets `count` more writes through, then fails the rest.
    pub fn fail_puts_after(&self, count: usize) {
        self.faults.puts_before_failure.store(count, Ordering::SeqCst);
        self.faults.fail_puts.store(true, Ordering::SeqCst);
    }

    /// Makes `flush` fail.
    pub fn fail_flush(&self, on: bool) {
        self.faults.fail_flush.store(on, Ordering::SeqCst);
    }

    /// Makes `commit` return an error.
    pub fn fail_commit(&self, on: bool) {
        self.faults.fail_commit.store(on, Ordering::SeqCst);
    }

    /// Makes `commit` report that nothing was made durable.
    pub fn reject_commit(&self, on: bool) {
        self.faults.reject_commit.store(on, Ordering::SeqCst);
    }

    /// Makes `backup` fail.
    pub fn fail_backup(&self, on: bool) {
        self.faults.fail_backup.store(on, Ordering::SeqCst);
    }

    /// Disarms every fault.
    pub fn heal(&self) {
        self.fail_puts(false);
        self.fail_flush(false);
        self.fail_commit(false);
        self.reject_commit(false);
        self.fail_backup(false);
    }

    /// Writes attempted, including failed ones.
    pub fn put_attempts(&self) -> usize {
        self.faults.puts.load(Ordering::SeqCst)
    }

    /// Commits that succeeded.
    pub fn commit_count(&self) -> usize {
        self.faults.commits.load(Ordering::SeqCst)
    }

    /// Tables opened through the wrapper.
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }
}

impl Storage for FaultyStorage {
    fn open_table(&self, id: u32, name: &str) -> StorageResult<Arc<dyn StorageTable>> {
        let table = Arc::new(FaultyTable {
            inner: self.inner.open_table(id, name)?,
            faults: Arc::clone(&self.faults),
        });
        self.tables.lock().push(Arc::clone(&table));
        Ok(table)
    }

    fn table_names(&self) -> Vec<String> {
        self.inner.table_names()
    }

    fn begin_batch(&self) -> StorageResult<()> {
        self.inner.begin_batch()
    }

    fn flush(&self, is_final: bool) -> StorageResult<()> {
        if self.faults.fail_flush.load(Ordering::SeqCst) {
            return Err(StorageError::injected("flush"));
        }
        self.inner.flush(is_final)
    }

    fn commit(&self) -> StorageResult<bool> {
        if self.faults.fail_commit.load(Ordering::SeqCst) {
            return Err(StorageError::injected("commit"));
        }
        if self.faults.reject_commit.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let committed = self.inner.commit()?;
        if committed {
            self.faults.commits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(committed)
    }

    fn backup(&self, path: &Path) -> StorageResult<u64> {
        if self.faults.fail_backup.load(Ordering::SeqCst) {
            return Err(StorageError::injected("backup"));
        }
        self.inner.backup(path)
    }

    fn close(&self) -> StorageResult<()> {
        self.inner.close()
    }
}

struct FaultyTable {
    inner: Arc<dyn StorageTable>,
    faults: Arc<Faults>,
}

impl StorageTable for FaultyTable {
    fn id(&self) -> u32 {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.faults.check_put()?;
        self.inner.put(key, value)
    }

    fn remove(&self, key: &[u8]) -> StorageResult<()> {
        self.faults.check_put()?;
        self.inner.remove(key)
    }

    fn walk(&self, range: WalkRange<'_>, visitor: &mut dyn FnMut(&[u8]) -> bool) -> StorageResult<bool> {
        self.inner.walk(range, visitor)
    }

    fn id_counter(&self) -> u64 {
        self.inner.id_counter()
    }

    fn set_id_counter(&self, value: u64) {
        self.inner.set_id_counter(value);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
