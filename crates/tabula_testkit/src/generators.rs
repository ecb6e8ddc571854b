//! Property-based test generators using proptest.

use proptest::prelude::*;
use tabula_core::LockId;

/// A single table operation in a generated workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    /// Store `value` under `key`.
    Put(u64, u64),
    /// Remove `key`.
    Remove(u64),
    /// Read `key`.
    Get(u64),
    /// Run a checkpoint.
    Checkpoint,
}

/// Strategy for lock ids drawn from a small range so that sets overlap.
pub fn lock_id_strategy(range: u32) -> impl Strategy<Value = LockId> {
    (0..range.max(1)).prop_map(LockId)
}

/// Strategy for lock id lists of `1..=max` entries, duplicates allowed.
pub fn lock_set_strategy(range: u32, max: usize) -> impl Strategy<Value = Vec<LockId>> {
    prop::collection::vec(lock_id_strategy(range), 1..=max.max(1))
}

/// Strategy for one operation on keys `0..keys`.
pub fn table_op_strategy(keys: u64) -> impl Strategy<Value = TableOp> {
    let keys = keys.max(1);
    prop_oneof![
        4 => (0..keys, any::<u64>()).prop_map(|(k, v)| TableOp::Put(k, v)),
        2 => (0..keys).prop_map(TableOp::Remove),
        4 => (0..keys).prop_map(TableOp::Get),
        1 => Just(TableOp::Checkpoint),
    ]
}

/// Strategy for workloads of up to `len` operations.
pub fn workload_strategy(keys: u64, len: usize) -> impl Strategy<Value = Vec<TableOp>> {
    prop::collection::vec(table_op_strategy(keys), 0..len)
}
