//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The snapshot file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,

    /// A table was requested with an id already bound to another name.
    #[error("table id {id} already bound to '{existing}', requested '{requested}'")]
    TableIdConflict {
        /// The conflicting table id.
        id: u32,
        /// Name already registered under the id.
        existing: String,
        /// Name that was requested.
        requested: String,
    },

    /// Another process holds the storage directory.
    #[error("storage locked: another process has exclusive access")]
    Locked,

    /// A fault raised on purpose by a test wrapper.
    #[error("injected fault: {0}")]
    Injected(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates an injected fault.
    pub fn injected(message: impl Into<String>) -> Self {
        Self::Injected(message.into())
    }
}
