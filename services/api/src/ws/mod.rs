//! WebSocket Session Management
//!
//! One WebSocket carries one study session. It is structured into submodules:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Manages the WebSocket connection lifecycle, from handshake to termination.
//! - `speech`: Lets the browser act as the session's speaker and microphone.

pub mod protocol;
pub mod session;
pub mod speech;

pub use session::ws_handler;
