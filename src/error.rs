//! Error types for the meter agent.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Logic error: {0}")]
    Logic(#[from] LogicError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Worker identity bootstrap errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to read identity file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write identity file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Identity file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Channel / transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} failed to connect: {reason}")]
    ConnectFailed { name: String, reason: String },

    #[error("Failed to send {event} on channel {name}: {reason}")]
    SendFailed {
        name: String,
        event: String,
        reason: String,
    },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Logic module load / update errors. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum LogicError {
    #[error("Failed to read logic module {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write logic module {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to compile logic module: {0}")]
    Compile(String),
}

/// Errors raised inside a capability invocation.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("Unexpected response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl From<reqwest::Error> for CapabilityError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http {
            url: e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            reason: e.to_string(),
        }
    }
}

/// Errors that end a dispatched task with a `{error, failed: 1}` result.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid payload for {task_type}: {reason}")]
    InvalidPayload { task_type: String, reason: String },

    #[error("Logic module does not provide {0}")]
    CapabilityUnavailable(String),

    #[error("Task timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
