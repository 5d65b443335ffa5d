//! Connection management module
//!
//! Tracks upgraded connections and drives each one through its lifecycle.

#[allow(dead_code)]
mod registry;
mod session;

pub use registry::*;
pub use session::*;
