//! Subscriber WebSocket surface
//!
//! Every open tab holds one socket. The broker fans session events out to all
//! of them; a tab that reconnects asks for `GET_STATE` to catch up.

mod handler;
mod protocol;

pub use handler::handle_subscriber_ws;
pub use protocol::{ClientMessage, ServerMessage};
