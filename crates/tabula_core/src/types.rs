//! Core type definitions for Tabula.

use std::fmt;

/// Coordination token for one record.
///
/// Derived from a table salt and the record key. The lock pool maps it to a
/// slot with `id & mask`, so distinct ids may share a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub u32);

impl LockId {
    /// Creates a lock id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{:08x}", self.0)
    }
}

/// Identifier of a table inside one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u32);

impl TableId {
    /// Creates a table id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Salt mixed into every lock id of the table.
    #[must_use]
    pub const fn lock_salt(self) -> u32 {
        self.0.wrapping_mul(0x9e37_79b1)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table:{}", self.0)
    }
}

/// Key that serializes scheduled procedures.
///
/// Procedures submitted with the same session run one at a time in
/// submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Creates a session id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid:{}", self.0)
    }
}

/// Holder of lock slots: one running procedure, or the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(pub(crate) u64);

impl OwnerId {
    /// Owner used by the checkpoint cycle.
    pub const CHECKPOINT: Self = Self(u64::MAX);

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::CHECKPOINT {
            f.write_str("owner:checkpoint")
        } else {
            write!(f, "owner:{}", self.0)
        }
    }
}

/// Lock id salt derived from a lock name instead of the table id.
///
/// Tables sharing a lock name share lock ids for equal keys, so one lock
/// covers the same key in all of them.
#[must_use]
pub fn lock_salt_for_name(name: &str) -> u32 {
    let hash = name
        .trim()
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
    hash.wrapping_mul(0x9e37_79b1)
}
