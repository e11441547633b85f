pub mod client;
pub mod messages;

pub use client::{NatsClient, NatsConnector};
pub use messages::{RealtimeInputMessage, ServerMessageWire, SetupReply, SetupRequest};
