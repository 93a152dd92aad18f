//! Room membership module
//!
//! Tracks which connections belong to which rooms and fans frames out to
//! room members.

#[allow(dead_code)]
mod registry;

pub use registry::*;
