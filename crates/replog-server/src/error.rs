//! Error types for the server side.

use thiserror::Error;

use replog_log::error::LogError;
use replog_net::error::NetError;

/// Errors raised by the node, service and publisher.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Durable log failure.
    #[error("log error")]
    Log(#[from] LogError),

    /// Wire-layer failure.
    #[error("transport error")]
    Net(#[from] NetError),

    /// Persisted raft state could not be decoded.
    #[error("raft state error: {msg}")]
    RaftState {
        /// Description of the failure.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for server results.
pub type ServerResult<T> = Result<T, ServerError>;
