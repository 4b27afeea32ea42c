//! Capability contract a logic module must satisfy.
//!
//! Each capability is its own trait so a module can be checked for presence
//! once at load time instead of probing per call.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CapabilityError;

/// Named operations a logic module may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ProcessBatch,
    VerifyLoginDetails,
    GetInventoryList,
    VerifyMeter,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Self::ProcessBatch,
        Self::VerifyLoginDetails,
        Self::GetInventoryList,
        Self::VerifyMeter,
    ];

    /// Capabilities without which a module is never marked ready.
    pub const REQUIRED: [Capability; 1] = [Self::ProcessBatch];

    /// Wire name, as used in logic manifests and coordinator messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessBatch => "processBatch",
            Self::VerifyLoginDetails => "verifyLoginDetails",
            Self::GetInventoryList => "getInventoryList",
            Self::VerifyMeter => "verifyMeter",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Portal login credentials carried in a task payload.
#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub userid: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("userid", &self.userid)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Result of `verifyLoginDetails`. Serialized verbatim for `LOGIN_CHECK`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginOutcome {
    pub success: bool,
    /// Session material handed to follow-up capabilities.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub cookies: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Anything else the portal returned.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoginOutcome {
    pub fn succeeded(cookies: Value) -> Self {
        Self {
            success: true,
            cookies,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Result of `verifyMeter`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterLookup {
    pub found: bool,
    pub data: Value,
}

impl MeterLookup {
    pub fn found(data: Value) -> Self {
        Self { found: true, data }
    }

    pub fn not_found() -> Self {
        Self {
            found: false,
            data: Value::Null,
        }
    }
}

/// One progress report from a running capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub current: u64,
    pub total: u64,
    pub status: String,
}

impl ProgressUpdate {
    pub fn new(current: u64, total: u64, status: impl Into<String>) -> Self {
        Self {
            current,
            total,
            status: status.into(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.current >= self.total
    }
}

/// Receiver for progress callbacks. Purely observational.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Post every meter in `meters`, reporting progress as it goes.
    async fn process_batch(
        &self,
        credentials: &Credentials,
        meters: &[Value],
        progress: &dyn ProgressSink,
    ) -> Result<Value, CapabilityError>;
}

#[async_trait]
pub trait LoginVerifier: Send + Sync {
    async fn verify_login_details(
        &self,
        credentials: &Credentials,
    ) -> Result<LoginOutcome, CapabilityError>;
}

#[async_trait]
pub trait InventoryLister: Send + Sync {
    async fn get_inventory_list(
        &self,
        cookies: &Value,
        limit: u64,
    ) -> Result<Vec<Value>, CapabilityError>;
}

#[async_trait]
pub trait MeterVerifier: Send + Sync {
    async fn verify_meter(
        &self,
        cookies: &Value,
        meter_no: &str,
    ) -> Result<MeterLookup, CapabilityError>;
}

/// The operations a loaded module actually provides.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    pub process_batch: Option<Arc<dyn BatchProcessor>>,
    pub verify_login_details: Option<Arc<dyn LoginVerifier>>,
    pub get_inventory_list: Option<Arc<dyn InventoryLister>>,
    pub verify_meter: Option<Arc<dyn MeterVerifier>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process_batch(mut self, cap: Arc<dyn BatchProcessor>) -> Self {
        self.process_batch = Some(cap);
        self
    }

    pub fn with_verify_login_details(mut self, cap: Arc<dyn LoginVerifier>) -> Self {
        self.verify_login_details = Some(cap);
        self
    }

    pub fn with_get_inventory_list(mut self, cap: Arc<dyn InventoryLister>) -> Self {
        self.get_inventory_list = Some(cap);
        self
    }

    pub fn with_verify_meter(mut self, cap: Arc<dyn MeterVerifier>) -> Self {
        self.verify_meter = Some(cap);
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::ProcessBatch => self.process_batch.is_some(),
            Capability::VerifyLoginDetails => self.verify_login_details.is_some(),
            Capability::GetInventoryList => self.get_inventory_list.is_some(),
            Capability::VerifyMeter => self.verify_meter.is_some(),
        }
    }

    pub fn provided(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.has(*c))
            .collect()
    }

    /// Required capabilities this set lacks.
    pub fn missing_required(&self) -> Vec<Capability> {
        Capability::REQUIRED
            .into_iter()
            .filter(|c| !self.has(*c))
            .collect()
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.provided()).finish()
    }
}
