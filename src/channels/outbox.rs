//! Fire-and-forget queue of outbound messages.
//!
//! Producers (dispatcher, progress reporters, heartbeat) never await the
//! transport; the agent loop drains the outbox into the channel.

use tokio::sync::mpsc;

use crate::channels::protocol::OutboundMessage;

/// Cloneable handle for queueing outbound messages.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Outbox {
    /// Create an outbox and the receiver the pump drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. Dropped with a debug log if the pump has stopped.
    pub fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.tx.send(message) {
            tracing::debug!(event = e.0.event_name(), "Outbox closed, dropping message");
        }
    }
}
