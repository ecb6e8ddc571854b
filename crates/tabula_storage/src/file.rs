//! File-backed storage engine.

use crate::backend::{Storage, StorageTable};
use crate::error::{StorageError, StorageResult};
use crate::memory::MemoryStorage;
use crate::snapshot::Snapshot;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Name of the committed snapshot inside the storage directory.
pub const DATA_FILE: &str = "data.tbl";
const DATA_TEMP: &str = "data.tbl.tmp";
const LOCK_FILE: &str = "LOCK";

/// A file-backed storage engine.
///
/// Tables live in memory; `commit` writes the whole state as a checksummed
/// snapshot to `data.tbl` through a temp file and an atomic rename, so a
/// crash leaves either the previous or the new snapshot on disk.
///
/// ```text
/// <dir>/
/// ├─ LOCK        # advisory lock, held while open
/// └─ data.tbl    # last committed snapshot
/// ```
///
/// # Example
///
/// ```no_run
/// use tabula_storage::{FileStorage, Storage};
/// use std::path::Path;
///
/// let storage = FileStorage::open(Path::new("db")).unwrap();
/// let table = storage.open_table(1, "users").unwrap();
/// table.put(b"alice", b"1").unwrap();
/// storage.commit().unwrap();
/// ```
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    inner: MemoryStorage,
    commit_lock: Mutex<()>,
    _lock_file: File,
}

impl FileStorage {
    /// Opens or creates a storage directory, loading the last committed snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the
    /// directory, or an error if the snapshot is unreadable or corrupted.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let data_path = dir.join(DATA_FILE);
        let inner = if data_path.exists() {
            let snapshot = Snapshot::decode(&fs::read(&data_path)?)?;
            debug!(
                path = %data_path.display(),
                tables = snapshot.tables.len(),
                entries = snapshot.entry_count(),
                "loaded snapshot"
            );
            MemoryStorage::from_snapshot(snapshot)
        } else {
            MemoryStorage::new()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            inner,
            commit_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the committed snapshot.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    fn write_atomic(&self, bytes: &[u8]) -> StorageResult<()> {
        let temp_path = self.dir.join(DATA_TEMP);
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, self.data_path())?;
        Ok(())
    }
}

impl Storage for FileStorage {
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
        self.inner.flush(is_final)
    }

    fn commit(&self) -> StorageResult<bool> {
        let _guard = self.commit_lock.lock();
        self.inner.commit()?;
        let bytes = self.inner.snapshot().encode();
        self.write_atomic(&bytes)?;
        debug!(bytes = bytes.len(), "snapshot committed");
        Ok(true)
    }

    fn backup(&self, path: &Path) -> StorageResult<u64> {
        if self.inner.is_closed() {
            return Err(StorageError::Closed);
        }
        // Copy the committed file so the backup never sees an unfinished batch.
        let _guard = self.commit_lock.lock();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data_path = self.data_path();
        if data_path.exists() {
            Ok(fs::copy(&data_path, path)?)
        } else {
            let bytes = Snapshot::default().encode();
            fs::write(path, &bytes)?;
            Ok(bytes.len() as u64)
        }
    }

    fn close(&self) -> StorageResult<()> {
        self.inner.close()
    }
}
