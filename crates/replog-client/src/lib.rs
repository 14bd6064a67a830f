#![warn(missing_docs)]

//! replog client side: the leader-tracking cluster RPC client and the
//! broadcast subscriber that follows a replicated log in real time.

pub mod cancel;
pub mod error;
pub mod rpc;
pub mod stream;
pub mod subscriber;
