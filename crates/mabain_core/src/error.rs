//! Error types for the trie engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type MbResult<T> = Result<T, MbError>;

/// Errors that can occur in trie-store operations.
///
/// These are the status codes surfaced by the public handle; success is the
/// `Ok` arm of [`MbResult`].
#[derive(Debug, Error)]
pub enum MbError {
    /// The handle never finished opening, or open failed.
    #[error("db not initialized")]
    NotInitialized,

    /// The handle has been closed.
    #[error("db closed")]
    DbClosed,

    /// No database exists at the given path, or its header is unusable.
    #[error("no db found: {0}")]
    NoDb(String),

    /// The operation is not permitted for this handle's access mode.
    #[error("operation not allowed")]
    NotAllowed,

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// An arena reached its configured memory cap.
    #[error("out of memory: arena cap reached")]
    NoMemory,

    /// The key is already present and overwrite was not requested.
    #[error("key already in dict")]
    InDict,

    /// The key is not present.
    #[error("key not found")]
    NotExist,

    /// A lock-free snapshot was inconsistent; the caller should retry.
    #[error("concurrent update in flight, try again")]
    TryAgain,

    /// Resource collection was skipped because it would be unprofitable.
    #[error("resource collection skipped")]
    RcSkipped,

    /// A cursor or length argument is out of bounds.
    #[error("out of bound")]
    OutOfBound,

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] mabain_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An unexpected internal condition.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl MbError {
    /// True for conditions a reader resolves by retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TryAgain)
    }
}
