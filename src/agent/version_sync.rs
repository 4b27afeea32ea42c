//! Logic version reconciliation with the coordinator.
//!
//! On every (re)connect the worker reports the hash of the logic file on
//! disk; the coordinator answers with either fresh content or an all-clear.

use std::sync::Arc;

use crate::channels::{OutboundMessage, Outbox};
use crate::error::LogicError;
use crate::logic::{LogicModule, LogicStore};

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No `check_version` outstanding.
    Idle,
    /// `check_version` sent; waiting for an update or an all-clear.
    AwaitingDecision,
}

pub struct VersionSync {
    store: Arc<LogicStore>,
    outbox: Outbox,
    state: SyncState,
}

impl VersionSync {
    pub fn new(store: Arc<LogicStore>, outbox: Outbox) -> Self {
        Self {
            store,
            outbox,
            state: SyncState::Idle,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Report the on-disk hash. The hash is recomputed every time.
    pub async fn check_version(&mut self) {
        let hash = self.store.disk_hash().await;
        tracing::info!(
            local_hash = hash.as_deref().unwrap_or("none"),
            "Checking logic version"
        );
        self.outbox.send(OutboundMessage::CheckVersion(hash));
        self.state = SyncState::AwaitingDecision;
    }

    /// Apply `update_logic_file`. Failures leave the previous module installed.
    pub async fn on_update(&mut self, content: &str) -> Result<Arc<LogicModule>, LogicError> {
        self.note_reply("update_logic_file");
        tracing::info!(bytes = content.len(), "Received logic update");

        match self.store.install(content.as_bytes()).await {
            Ok(module) => Ok(module),
            Err(e) => {
                tracing::error!(error = %e, "Failed to apply logic update");
                Err(e)
            }
        }
    }

    /// Apply `logic_uptodate`.
    pub fn on_uptodate(&mut self) {
        self.note_reply("logic_uptodate");
        tracing::info!("Logic is up to date");
    }

    fn note_reply(&mut self, event: &str) {
        if self.state != SyncState::AwaitingDecision {
            tracing::debug!(event, "Unsolicited version reply");
        }
        self.state = SyncState::Idle;
    }
}
