//! Frame codec module
//!
//! Binary framing for messages exchanged after the upgrade handshake.

mod codec;

pub use codec::*;
