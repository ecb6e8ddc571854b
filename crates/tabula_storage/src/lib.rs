//! # Tabula Storage
//!
//! Storage engine contract and reference engines for Tabula.
//!
//! The database layer above this crate caches records and decides when to
//! persist them. An engine only has to store opaque key/value bytes per table,
//! walk keys in order, and make a batch of writes durable on `commit`.
//!
//! ## Available Engines
//!
//! - [`MemoryStorage`] - Ordered in-memory tables, for tests and ephemeral data
//! - [`FileStorage`] - The same tables persisted as a checksummed snapshot
//!
//! ## Example
//!
//! ```rust
//! use tabula_storage::{MemoryStorage, Storage, WalkRange};
//!
//! let storage = MemoryStorage::new();
//! let table = storage.open_table(1, "scores").unwrap();
//! table.put(b"a", b"1").unwrap();
//! table.put(b"b", b"2").unwrap();
//!
//! let mut keys = Vec::new();
//! table.walk(WalkRange::all(), &mut |k| { keys.push(k.to_vec()); true }).unwrap();
//! assert_eq!(keys.len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod snapshot;

pub use backend::{Storage, StorageTable, WalkRange};
pub use error::{StorageError, StorageResult};
pub use file::{FileStorage, DATA_FILE};
pub use memory::{MemoryStorage, MemoryTable};
pub use snapshot::{compute_crc32, Snapshot, TableImage, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
