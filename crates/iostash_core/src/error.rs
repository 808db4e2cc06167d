//! Error and status types for iostash core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in iostash core operations.
///
/// These are internal, fallible-path errors (construction, recovery,
/// storage). The cache's read and write paths report outcomes through
/// status enums such as [`ReadStatus`] instead - a running cache degrades,
/// it does not fail.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] iostash_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal file is structurally invalid.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Crash recovery could not establish a trustworthy basis.
    ///
    /// The caller must drop the cache and reinitialize it empty; partial
    /// trust is never applied.
    #[error("recovery aborted: {reason}")]
    RecoveryAborted {
        /// Reason recovery was abandoned.
        reason: String,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration issue.
        message: String,
    },
}

impl CoreError {
    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a recovery aborted error.
    pub fn recovery_aborted(reason: impl Into<String>) -> Self {
        Self::RecoveryAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Outcome of a disk read (synchronous or materialized).
///
/// `NotFound`, `FileNotOpen` and `Cancelled` are expected, retryable states
/// rather than faults; callers must be prepared for any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The read completed and the destination holds the bytes.
    Ok,
    /// The key is not present in the disk index.
    NotFound,
    /// The data file handle is unavailable; the cache is running in
    /// index-only mode.
    FileNotOpen,
    /// An I/O failure occurred mid-read.
    ReadError,
    /// The read was cancelled before it executed.
    Cancelled,
}

/// Outcome of a synchronous [`crate::ChunkCache::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetStatus {
    /// The item was resident in memory and has been copied out.
    Ok,
    /// The item is on disk; call `materialize` to read it.
    NeedsMaterialize,
    /// The key is not cached anywhere.
    NotFound,
}

/// Outcome of a [`crate::ChunkCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    /// The item was accepted into the memory tier (or already present).
    Ok,
    /// The item was rejected (empty, reserved key, or larger than the tier).
    Rejected,
}
