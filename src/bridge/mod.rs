//! Client transport bridge
//!
//! JSON message protocol, the per-client state machine and the WebSocket
//! server that hosts it.

mod handler;
pub mod protocol;
mod server;

pub use handler::ProtocolBridge;
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{serve, DisconnectReason};
