//! Configuration module
//!
//! Handles loading the broker configuration file.

mod broker;

pub use broker::*;
