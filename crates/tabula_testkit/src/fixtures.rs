//! Test fixtures and database helpers.
//!
//! Provides databases over memory or file storage that clean up after
//! themselves, plus a small account model used by the scenario tests.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabula_codec::impl_serde_bean;
use tabula_core::{procedure_fn, CachedTable, Config, Database, Outcome};
use tabula_storage::{FileStorage, MemoryStorage, Storage};
use tempfile::TempDir;

/// Table id used by [`scenarios::accounts`].
pub const ACCOUNTS_TABLE: u32 = 1;

/// A bank account record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owner name.
    pub owner: String,
    /// Balance in cents.
    pub balance: i64,
}
impl_serde_bean!(Account, tag = 1);

impl Account {
    /// Creates an account.
    pub fn new(owner: impl Into<String>, balance: i64) -> Self {
        Self {
            owner: owner.into(),
            balance,
        }
    }
}

/// Configuration tuned for tests: four workers and a small lock pool.
pub fn test_config() -> Config {
    let mut config = Config::default()
        .worker_threads(4)
        .lock_pool_size(1024);
    config.shutdown_timeout = Duration::from_secs(30);
    config
}

enum Backing {
    Memory(Arc<MemoryStorage>),
    File { storage: Arc<FileStorage>, dir: TempDir },
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    config: Config,
    backing: Backing,
}

impl TestDatabase {
    /// Creates a database over fresh memory storage.
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Creates a memory database with `config`.
    pub fn memory_with(config: Config) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        Self::start(Backing::Memory(storage), config)
    }

    /// Creates a database over file storage in a temporary directory.
    pub fn file() -> Self {
        Self::file_with(test_config())
    }

    /// Creates a file database with `config`.
    pub fn file_with(config: Config) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let storage = Arc::new(FileStorage::open(&dir.path().join("db")).expect("Failed to open file storage"));
        Self::start(Backing::File { storage, dir }, config)
    }

    fn start(backing: Backing, config: Config) -> Self {
        let storage: Arc<dyn Storage> = match &backing {
            Backing::Memory(storage) => storage.clone(),
            Backing::File { storage, .. } => storage.clone(),
        };
        let db = Database::startup(storage, config.clone()).expect("Failed to start database");
        Self { db, config, backing }
    }

    /// Storage directory of a file database.
    pub fn path(&self) -> Option<PathBuf> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { dir, .. } => Some(dir.path().join("db")),
        }
    }

    /// Temporary directory holding a file database, for backups and the like.
    pub fn temp_dir(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { dir, .. } => Some(dir.path()),
        }
    }

    /// The storage engine under the database.
    pub fn storage(&self) -> Arc<dyn Storage> {
        match &self.backing {
            Backing::Memory(storage) => storage.clone(),
            Backing::File { storage, .. } => storage.clone(),
        }
    }

    /// Shuts the database down and starts a new one over what storage kept.
    ///
    /// Memory storage keeps whatever the checkpoints wrote; file storage
    /// reloads the last committed snapshot from disk.
    pub fn restart(self) -> Self {
        let Self { db, config, backing } = self;
        db.shutdown().expect("Failed to shut down database");
        drop(db);
        let backing = match backing {
            Backing::Memory(storage) => {
                Backing::Memory(Arc::new(MemoryStorage::from_snapshot(storage.snapshot())))
            }
            Backing::File { storage, dir } => {
                drop(storage);
                let storage = Arc::new(
                    FileStorage::open(&dir.path().join("db")).expect("Failed to reopen file storage"),
                );
                Backing::File { storage, dir }
            }
        };
        Self::start(backing, config)
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Creates a memory database with the test configuration.
pub fn memory_db() -> TestDatabase {
    TestDatabase::memory()
}

/// Runs a test with a temporary memory database.
///
/// # Example
///
/// ```rust,ignore
/// use tabula_testkit::with_temp_db;
///
/// with_temp_db(|db| {
///     let table = db.open_table::<u64, String>(1, "names").unwrap();
///     // ... run procedures
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file database and its directory.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("File database should have a path");
    f(&test_db.db, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Opens the accounts table.
    pub fn accounts(db: &Database) -> CachedTable<u64, Account> {
        db.open_table(ACCOUNTS_TABLE, "accounts")
            .expect("Failed to open accounts table")
    }

    /// Creates accounts `0..count`, each holding `balance`.
    pub fn seed_accounts(db: &Database, table: &CachedTable<u64, Account>, count: u64, balance: i64) {
        for id in 0..count {
            db.execute(procedure_fn("seed_account", |ctx| {
                ctx.lock(table.lock_id(&id))?;
                table.put(ctx, id, Account::new(format!("owner-{id}"), balance))?;
                Ok(Outcome::Done)
            }))
            .expect("Failed to seed account");
        }
    }

    /// Sum of balances of accounts `0..count`, read without locks.
    pub fn total_balance(table: &CachedTable<u64, Account>, count: u64) -> i64 {
        (0..count)
            .filter_map(|id| table.get_no_lock(&id).expect("Failed to read account"))
            .map(|account| account.balance)
            .sum()
    }
}
