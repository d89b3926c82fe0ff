//! WebSocket event stream.
//!
//! Screens connect to `GET /events`, subscribe with an [`EventFilter`]
//! (audience, target, kinds) and receive every matching domain event as it is
//! delivered by the event bus. Sync status changes are pushed to every
//! connection. Closing the socket drops its subscriptions.
//!
//! [`EventFilter`]: rollcall_engine::EventFilter

mod handler;
mod manager;
mod protocol;

pub use handler::handle_socket;
pub use manager::{Connection, ConnectionManager, MessageSender};
pub use protocol::*;
