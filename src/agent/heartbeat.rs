//! Liveness heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::channels::{OutboundMessage, Outbox};

/// Spawn the heartbeat ticker. Beats are only queued while `connected` is set.
pub fn spawn_heartbeat(
    outbox: Outbox,
    connected: Arc<AtomicBool>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if connected.load(Ordering::SeqCst) {
                tracing::trace!("Heartbeat");
                outbox.send(OutboundMessage::Heartbeat);
            }
        }
    })
}
