//! In-memory storage engine.

use crate::backend::{Storage, StorageTable, WalkRange};
use crate::error::{StorageError, StorageResult};
use crate::snapshot::{Snapshot, TableImage};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// An ordered in-memory table.
#[derive(Debug)]
pub struct MemoryTable {
    id: u32,
    name: String,
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    id_counter: AtomicU64,
}

impl MemoryTable {
    fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            data: RwLock::new(BTreeMap::new()),
            id_counter: AtomicU64::new(0),
        }
    }

    fn from_image(image: TableImage) -> Self {
        Self {
            id: image.id,
            name: image.name,
            data: RwLock::new(image.entries.into_iter().collect()),
            id_counter: AtomicU64::new(image.id_counter),
        }
    }

    fn image(&self) -> TableImage {
        TableImage {
            id: self.id,
            name: self.name.clone(),
            id_counter: self.id_counter.load(Ordering::Acquire),
            entries: self
                .data
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl StorageTable for MemoryTable {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn walk(
        &self,
        range: WalkRange<'_>,
        visitor: &mut dyn FnMut(&[u8]) -> bool,
    ) -> StorageResult<bool> {
        if range.is_empty() {
            return Ok(true);
        }

        // Visit a copy of the keys so the visitor may read the table.
        let keys: Vec<Vec<u8>> = {
            let data = self.data.read();
            let iter = data.range(range.bounds()).map(|(k, _)| k.clone());
            if range.reverse {
                iter.rev().collect()
            } else {
                iter.collect()
            }
        };

        for key in &keys {
            if !visitor(key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn id_counter(&self) -> u64 {
        self.id_counter.load(Ordering::Acquire)
    }

    fn set_id_counter(&self, value: u64) {
        self.id_counter.store(value, Ordering::Release);
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }
}

/// An in-memory storage engine.
///
/// Writes are visible immediately and `commit` always succeeds. Suitable for
/// tests and for databases that only need the checkpoint machinery without
/// persistence. [`Storage::backup`] still writes a real snapshot file.
///
/// # Example
///
/// ```rust
/// use tabula_storage::{MemoryStorage, Storage};
///
/// let storage = MemoryStorage::new();
/// let table = storage.open_table(1, "users").unwrap();
/// table.put(b"alice", b"1").unwrap();
/// assert_eq!(table.get(b"alice").unwrap(), Some(b"1".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<BTreeMap<u32, Arc<MemoryTable>>>,
    closed: AtomicBool,
    commits: AtomicU64,
}

impl MemoryStorage {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine holding the contents of `snapshot`.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let tables = snapshot
            .tables
            .into_iter()
            .map(|image| (image.id, Arc::new(MemoryTable::from_image(image))))
            .collect();
        Self {
            tables: RwLock::new(tables),
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
        }
    }

    /// Captures the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tables: self.tables.read().values().map(|t| t.image()).collect(),
        }
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns `true` once [`Storage::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn open_table(&self, id: u32, name: &str) -> StorageResult<Arc<dyn StorageTable>> {
        self.check_open()?;
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(&id) {
            if existing.name != name {
                return Err(StorageError::TableIdConflict {
                    id,
                    existing: existing.name.clone(),
                    requested: name.to_string(),
                });
            }
            return Ok(existing.clone());
        }
        let table = Arc::new(MemoryTable::new(id, name));
        tables.insert(id, table.clone());
        Ok(table)
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.read().values().map(|t| t.name.clone()).collect()
    }

    fn begin_batch(&self) -> StorageResult<()> {
        self.check_open()
    }

    fn flush(&self, _is_final: bool) -> StorageResult<()> {
        self.check_open()
    }

    fn commit(&self) -> StorageResult<bool> {
        self.check_open()?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn backup(&self, path: &Path) -> StorageResult<u64> {
        self.check_open()?;
        let bytes = self.snapshot().encode();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk_keys(table: &dyn StorageTable, range: WalkRange<'_>) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        table
            .walk(range, &mut |k| {
                keys.push(k.to_vec());
                true
            })
            .unwrap();
        keys
    }

    #[test]
    fn memory_put_get_remove() {
        let storage = MemoryStorage::new();
        let table = storage.open_table(1, "t").unwrap();

        table.put(b"k", b"v1").unwrap();
        table.put(b"k", b"v2").unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(table.len(), 1);

        table.remove(b"k").unwrap();
        table.remove(b"k").unwrap();
        assert_eq!(table.get(b"k").unwrap(), None);
        assert!(table.is_empty());
    }

    #[test]
    fn memory_open_table_is_idempotent() {
        let storage = MemoryStorage::new();
        let a = storage.open_table(1, "t").unwrap();
        a.put(b"x", b"1").unwrap();
        let b = storage.open_table(1, "t").unwrap();
        assert_eq!(b.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert!(matches!(
            storage.open_table(1, "other"),
            Err(StorageError::TableIdConflict { id: 1, .. })
        ));
    }

    #[test]
    fn memory_walk_ranges() {
        let storage = MemoryStorage::new();
        let table = storage.open_table(1, "t").unwrap();
        for k in [b"a", b"b", b"c", b"d"] {
            table.put(k, b"").unwrap();
        }

        let all = walk_keys(table.as_ref(), WalkRange::all());
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let inner = walk_keys(table.as_ref(), WalkRange::between(Some(&b"a"[..]), Some(&b"d"[..]), false));
        assert_eq!(inner, vec![b"b".to_vec(), b"c".to_vec()]);

        let rev = walk_keys(
            table.as_ref(),
            WalkRange::between(Some(&b"b"[..]), None, true).reversed(),
        );
        assert_eq!(rev, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()]);

        assert!(walk_keys(table.as_ref(), WalkRange::between(Some(&b"d"[..]), Some(&b"a"[..]), true)).is_empty());
    }

    #[test]
    fn memory_walk_stops_early() {
        let storage = MemoryStorage::new();
        let table = storage.open_table(1, "t").unwrap();
        for i in 0u8..10 {
            table.put(&[i], b"").unwrap();
        }
        let mut seen = 0;
        let completed = table
            .walk(WalkRange::all(), &mut |_| {
                seen += 1;
                seen < 3
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(seen, 3);
    }

    #[test]
    fn memory_closed_rejects_calls() {
        let storage = MemoryStorage::new();
        storage.commit().unwrap();
        storage.close().unwrap();
        assert!(matches!(storage.commit(), Err(StorageError::Closed)));
        assert!(matches!(storage.open_table(1, "t"), Err(StorageError::Closed)));
        assert_eq!(storage.commit_count(), 1);
    }

    #[test]
    fn memory_snapshot_restores_counter() {
        let storage = MemoryStorage::new();
        let table = storage.open_table(3, "ids").unwrap();
        table.put(b"1", b"one").unwrap();
        table.set_id_counter(17);

        let restored = MemoryStorage::from_snapshot(storage.snapshot());
        let table = restored.open_table(3, "ids").unwrap();
        assert_eq!(table.id_counter(), 17);
        assert_eq!(table.get(b"1").unwrap(), Some(b"one".to_vec()));
    }
}
