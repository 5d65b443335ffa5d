//! WebSocket server module
//!
//! Accepts raw TCP connections, answers the upgrade handshake and serves the
//! fixed document for plain HTTP requests.

#[allow(dead_code)]
mod handshake;
mod http;
#[allow(dead_code)]
mod websocket;

pub use handshake::*;
pub use http::*;
pub use websocket::*;
