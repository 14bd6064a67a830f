//! Error types for the client side.

use thiserror::Error;

use replog_log::error::LogError;
use replog_net::error::NetError;

/// Errors surfaced by the RPC client and subscriber.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The RPC did not complete within the deadline. Retried internally;
    /// surfaced only when a caller's cancellation cuts the retry loop.
    #[error("request timed out")]
    Timeout,

    /// A streaming reply was inconsistent with the request cursor; the
    /// caller restarts from its current position.
    #[error("stream chunk out of order")]
    OutOfOrder,

    /// Wrong cluster secret. Fatal to the subscriber session.
    #[error("authentication failure")]
    AuthFailure,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The server rejected the request.
    #[error("request rejected: {msg}")]
    Rejected {
        /// Server-supplied reason.
        msg: String,
    },

    /// Caller supplied an argument the client cannot act on.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        /// Description of the rejected argument.
        msg: String,
    },

    /// The subscriber session is closed.
    #[error("subscriber closed")]
    Closed,

    /// Wire-layer failure.
    #[error("transport error")]
    Net(#[from] NetError),

    /// Entry decode failure inside a reply.
    #[error("log entry error")]
    Log(#[from] LogError),
}

/// Convenience alias for client results.
pub type ClientResult<T> = Result<T, ClientError>;
