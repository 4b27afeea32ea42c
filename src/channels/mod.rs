//! Channel abstraction for coordinator I/O.

pub mod channel;
pub mod outbox;
pub mod protocol;
pub mod ws;

pub use channel::*;
pub use outbox::Outbox;
pub use protocol::{Frame, InboundMessage, OutboundMessage, TaskEnvelope};
pub use ws::{WsChannel, WsChannelConfig};
