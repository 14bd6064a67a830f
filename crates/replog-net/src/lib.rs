#![warn(missing_docs)]

//! replog wire layer: framed RPC messages, the broadcast fan-out format,
//! peer URL validation, and an in-process transport carrying exact wire
//! frames so a socket transport can replace it at the seam.

pub mod broadcast;
pub mod error;
pub mod frames;
pub mod message;
pub mod transport;
pub mod url;
