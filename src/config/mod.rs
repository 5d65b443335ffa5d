//! Configuration module
//!
//! Handles server settings from the command line and an optional TOML file.

#[allow(dead_code)]
mod relay;

pub use relay::*;
