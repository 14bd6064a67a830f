#![warn(missing_docs)]

//! replog durable log subsystem: entry codec, segmented on-disk log,
//! snapshot files and log compaction.

pub mod codec;
pub mod compact;
pub mod error;
pub mod log;
pub mod segment;
pub mod snapshot;
pub mod state;
pub mod types;
