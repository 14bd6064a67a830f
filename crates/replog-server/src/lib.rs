#![warn(missing_docs)]

//! replog server side: the fan-out publisher, the RPC service over the
//! durable log, request-id deduplication, and the seam to the Raft
//! collaborator.

pub mod dedup;
pub mod error;
pub mod node;
pub mod publisher;
pub mod raft;
pub mod service;
