//! Client connection module
//!
//! Wraps a single WebSocket client: its identity, outbound queue,
//! writer task, and lifecycle state.

#[allow(dead_code)]
mod session;

pub use session::*;
