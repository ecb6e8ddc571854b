//! Error types for Tabula core.

use crate::types::SessionId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Tabula core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] tabula_storage::StorageError),

    /// Record or key encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] tabula_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record was accessed without holding its lock.
    #[error("write unlocked record! table={table},key={key}")]
    IllegalUnlockedAccess {
        /// Table name.
        table: String,
        /// Debug rendering of the key.
        key: String,
    },

    /// A procedure asked for redo more times than allowed.
    #[error("procedure {procedure} redo too many times ({attempts})")]
    RedoExhausted {
        /// Procedure name.
        procedure: String,
        /// Attempts made.
        attempts: u32,
    },

    /// The procedure was interrupted by the watchdog.
    #[error("procedure {procedure} interrupted")]
    Interrupted {
        /// Procedure name.
        procedure: String,
    },

    /// More locks were requested than a procedure may hold.
    #[error("lock count {requested} exceeds the limit of {max}")]
    LockLimitExceeded {
        /// Number of distinct locks requested.
        requested: usize,
        /// Configured limit.
        max: usize,
    },

    /// Locks were released after the procedure modified records.
    #[error("invalid unlock after any dirty record")]
    UnlockAfterDirty,

    /// A record handle was used after its record was released or replaced.
    #[error("stale record handle for table {table}")]
    StaleRecord {
        /// Table name.
        table: String,
    },

    /// Application logic reported a failure.
    #[error("procedure failed: {message}")]
    ProcedureFailed {
        /// Description of the failure.
        message: String,
    },

    /// A procedure or callback panicked.
    #[error("procedure {procedure} panicked: {message}")]
    Panicked {
        /// Procedure name.
        procedure: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// A session queue overflowed and was dropped.
    #[error("session {session} queue overflow: dropped {dropped} procedures")]
    SessionOverflow {
        /// Session whose queue overflowed.
        session: SessionId,
        /// Number of procedures dropped.
        dropped: usize,
    },

    /// A table name or id is already in use.
    #[error("table already open: {name}")]
    TableExists {
        /// Table name.
        name: String,
    },

    /// Configuration rejected by [`crate::Config::validate`].
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl CoreError {
    /// Creates an illegal unlocked access error.
    pub fn illegal_unlocked_access(table: impl Into<String>, key: &impl std::fmt::Debug) -> Self {
        Self::IllegalUnlockedAccess {
            table: table.into(),
            key: format!("{key:?}"),
        }
    }

    /// Creates a procedure failure from application code.
    pub fn procedure_failed(message: impl Into<String>) -> Self {
        Self::ProcedureFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a panic error from a caught panic payload.
    pub(crate) fn panicked(procedure: &str, payload: &(dyn std::any::Any + Send)) -> Self {
        Self::Panicked {
            procedure: procedure.to_string(),
            message: panic_message(payload),
        }
    }

    /// Returns `true` for errors raised by the watchdog.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "(non-string panic)".to_string()
    }
}
