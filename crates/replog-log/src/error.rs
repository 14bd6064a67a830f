//! Error types for the log subsystem.

use thiserror::Error;

use crate::types::LogIndex;

/// Errors surfaced by the segmented log and snapshot files.
#[derive(Debug, Error)]
pub enum LogError {
    /// On-disk integrity check failed. Fatal to the owning process.
    #[error("corrupt log: {msg}")]
    CorruptLog {
        /// Description of the violated invariant.
        msg: String,
    },

    /// An entry or frame could not be decoded.
    #[error("invalid entry encoding: {reason}")]
    InvalidEntry {
        /// Description of the decode failure.
        reason: String,
    },

    /// Caller supplied an argument the log cannot act on.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        /// Description of the rejected argument.
        msg: String,
    },

    /// The requested index is outside the log's current range.
    #[error("index {index} out of range")]
    OutOfRange {
        /// The rejected index.
        index: LogIndex,
    },

    /// Another process holds the log directory lock.
    #[error("log directory {dir} is locked by another process")]
    DirectoryLocked {
        /// The contested directory.
        dir: String,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for log results.
pub type LogResult<T> = Result<T, LogError>;

impl LogError {
    /// Shorthand for a corruption error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        LogError::CorruptLog { msg: msg.into() }
    }

    /// Returns true if the error indicates unrecoverable on-disk corruption.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogError::CorruptLog { .. })
    }
}
