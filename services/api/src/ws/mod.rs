//! WebSocket transport
//!
//! - `protocol`: the JSON message format for client-server communication.
//! - `session`: the connection lifecycle, from `connect` to close.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
