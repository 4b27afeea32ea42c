//! Typed view over an `execute_task` message.

use std::fmt;

use serde_json::Value;

use crate::channels::TaskEnvelope;
use crate::error::TaskError;
use crate::logic::Credentials;

/// Default `getInventoryList` page size when the payload has no `limit`.
pub const DEFAULT_INVENTORY_LIMIT: u64 = 50;

/// What the coordinator asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskType {
    MeterPost,
    FastPost,
    LoginCheck,
    Inventory,
    SingleCheck,
    /// Anything else; answered with `Unknown Task Type`.
    Unknown(String),
}

impl TaskType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "METER_POST" => Self::MeterPost,
            "FAST_POST" => Self::FastPost,
            "LOGIN_CHECK" => Self::LoginCheck,
            "INVENTORY" => Self::Inventory,
            "SINGLE_CHECK" => Self::SingleCheck,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::MeterPost => "METER_POST",
            Self::FastPost => "FAST_POST",
            Self::LoginCheck => "LOGIN_CHECK",
            Self::Inventory => "INVENTORY",
            Self::SingleCheck => "SINGLE_CHECK",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of dispatched work. Immutable once received.
#[derive(Debug, Clone)]
pub struct Task {
    pub request_id: String,
    pub task_type: TaskType,
    pub payload: Value,
}

impl Task {
    pub fn new(request_id: impl Into<String>, task_type: TaskType, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            task_type,
            payload,
        }
    }

    pub fn from_envelope(envelope: TaskEnvelope) -> Self {
        Self {
            task_type: TaskType::parse(&envelope.task_type),
            request_id: envelope.request_id,
            payload: envelope.payload,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> TaskError {
        TaskError::InvalidPayload {
            task_type: self.task_type.to_string(),
            reason: reason.into(),
        }
    }

    /// `userid` / `password`; absent fields are empty.
    pub fn credentials(&self) -> Result<Credentials, TaskError> {
        match &self.payload {
            Value::Null => Ok(Credentials::default()),
            payload => serde_json::from_value(payload.clone())
                .map_err(|e| self.invalid(format!("credentials: {e}"))),
        }
    }

    /// `meters` array for batch posting.
    pub fn meters(&self) -> Result<Vec<Value>, TaskError> {
        match self.payload.get("meters") {
            Some(Value::Array(meters)) => Ok(meters.clone()),
            Some(other) => Err(self.invalid(format!("meters must be an array, got {other}"))),
            None => Err(self.invalid("meters is missing")),
        }
    }

    /// `limit` for inventory listing, defaulting when absent.
    pub fn limit(&self) -> Result<u64, TaskError> {
        match self.payload.get("limit") {
            None | Some(Value::Null) => Ok(DEFAULT_INVENTORY_LIMIT),
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| self.invalid(format!("limit must be a non-negative integer, got {n}"))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| self.invalid(format!("limit must be a non-negative integer, got {s:?}"))),
            Some(other) => Err(self.invalid(format!("limit must be a number, got {other}"))),
        }
    }

    /// `meterNo` for single meter verification.
    pub fn meter_no(&self) -> Result<String, TaskError> {
        match self.payload.get("meterNo") {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(self.invalid("meterNo is missing")),
        }
    }
}
