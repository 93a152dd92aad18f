//! WebSocket server module
//!
//! Accepts chat clients, decodes their frames, and routes them to the
//! room registry.

#[allow(dead_code)]
mod handler;
#[allow(dead_code)]
mod protocol;
#[allow(dead_code)]
mod websocket;

pub use handler::*;
pub use protocol::*;
pub use websocket::*;
