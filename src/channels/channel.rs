//! Channel trait — the boundary to the coordinator transport.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::channels::protocol::{InboundMessage, OutboundMessage};
use crate::error::ChannelError;

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connection established and authenticated.
    Connected,
    /// Connection lost; the transport is reconnecting.
    Disconnected { reason: String },
    /// A decoded coordinator message.
    Message(InboundMessage),
}

/// Stream of channel events, in arrival order.
pub type EventStream = Pin<Box<dyn Stream<Item = ChannelEvent> + Send>>;

/// A bidirectional, self-reconnecting message channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name for logging.
    fn name(&self) -> &str;

    /// Start the transport. May only be called once.
    async fn start(&self) -> Result<EventStream, ChannelError>;

    /// Send a message to the coordinator.
    async fn send(&self, message: OutboundMessage) -> Result<(), ChannelError>;

    /// Stop the transport and end the event stream.
    async fn shutdown(&self) -> Result<(), ChannelError>;
}
