//! Error types for the wire layer.

use thiserror::Error;

/// Errors raised while encoding, decoding or moving frames.
#[derive(Debug, Error)]
pub enum NetError {
    /// A frame sequence does not parse as a valid message.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing violation.
        reason: String,
    },

    /// A peer URL failed validation.
    #[error("invalid peer url: {msg}")]
    InvalidUrl {
        /// Description of the rejected URL.
        msg: String,
    },

    /// A message carried the wrong cluster secret.
    #[error("authentication failure: wrong cluster secret")]
    AuthFailure,

    /// The transport channel is closed.
    #[error("transport closed")]
    Closed,

    /// Serialization of a control-plane payload failed.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),
}

/// Convenience alias for wire-layer results.
pub type NetResult<T> = Result<T, NetError>;

impl NetError {
    /// Shorthand for a framing violation.
    pub fn frame(reason: impl Into<String>) -> Self {
        NetError::InvalidFrame {
            reason: reason.into(),
        }
    }
}
