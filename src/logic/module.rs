//! Loaded logic module snapshot.

use sha2::{Digest, Sha256};

use crate::error::LogicError;
use crate::logic::capability::{Capability, CapabilitySet};

/// Deterministic content digest (lowercase hex SHA-256).
///
/// Only compared for equality against the coordinator's hash.
pub fn compute_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Turns raw module content into a capability set.
pub trait ModuleCompiler: Send + Sync {
    fn compile(&self, content: &[u8]) -> Result<CapabilitySet, LogicError>;
}

/// An immutable logic module. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct LogicModule {
    content: Vec<u8>,
    content_hash: Option<String>,
    capabilities: CapabilitySet,
    ready: bool,
}

impl LogicModule {
    /// Bootstrap placeholder: no content, nothing invocable.
    pub fn placeholder() -> Self {
        Self {
            content: Vec::new(),
            content_hash: None,
            capabilities: CapabilitySet::default(),
            ready: false,
        }
    }

    /// Build a module from compiled content. Readiness is decided here, once.
    pub fn from_parts(content: Vec<u8>, capabilities: CapabilitySet) -> Self {
        let ready = capabilities.missing_required().is_empty();
        Self {
            content_hash: Some(compute_hash(&content)),
            content,
            capabilities,
            ready,
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Hash of the loaded content, `None` for the placeholder.
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn missing_required(&self) -> Vec<Capability> {
        self.capabilities.missing_required()
    }
}
