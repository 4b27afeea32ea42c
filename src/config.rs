//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Coordinator WebSocket endpoint.
    pub coordinator_url: String,
    /// Where the logic module content is stored on disk.
    pub logic_path: PathBuf,
    /// Where the worker identity is stored on disk.
    pub identity_path: PathBuf,
    /// Interval between heartbeat emissions.
    pub heartbeat_interval: Duration,
    /// Maximum number of tasks executing at the same time.
    pub max_parallel_tasks: usize,
    /// Upper bound on a single task's execution (None = unbounded).
    pub task_timeout: Option<Duration>,
    /// First reconnect delay after the channel drops.
    pub reconnect_min: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_max: Duration,
    /// Minimum spacing between forwarded progress updates (zero = forward all).
    pub progress_min_interval: Duration,
    /// How long shutdown waits for in-flight tasks to report their results.
    pub shutdown_grace: Duration,
    /// Directory for the rolling log file, if file logging is wanted.
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "ws://127.0.0.1:3000/agent".to_string(),
            logic_path: PathBuf::from("./data/logic.json"),
            identity_path: PathBuf::from("./data/identity.json"),
            heartbeat_interval: Duration::from_secs(10),
            max_parallel_tasks: 10,
            task_timeout: Some(Duration::from_secs(600)), // 10 minutes
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            progress_min_interval: Duration::ZERO,
            shutdown_grace: Duration::from_secs(5),
            log_dir: None,
        }
    }
}

impl AgentConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let coordinator_url = lookup("AGENT_COORDINATOR_URL")
            .map(|s| s.trim().to_string())
            .unwrap_or(defaults.coordinator_url);
        if !coordinator_url.starts_with("ws://") && !coordinator_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_COORDINATOR_URL".to_string(),
                message: format!("expected a ws:// or wss:// URL, got {coordinator_url}"),
            });
        }

        let logic_path = lookup("AGENT_LOGIC_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.logic_path);
        let identity_path = lookup("AGENT_IDENTITY_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.identity_path);

        let heartbeat_secs: u64 = parse_var(&lookup, "AGENT_HEARTBEAT_SECS", 10)?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_HEARTBEAT_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let max_parallel_tasks: usize = parse_var(&lookup, "AGENT_MAX_PARALLEL_TASKS", 10)?;
        if max_parallel_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_MAX_PARALLEL_TASKS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let timeout_secs: u64 = parse_var(&lookup, "AGENT_TASK_TIMEOUT_SECS", 600)?;
        let task_timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

        let reconnect_min_ms: u64 = parse_var(&lookup, "AGENT_RECONNECT_MIN_MS", 1_000)?;
        let reconnect_max_ms: u64 = parse_var(&lookup, "AGENT_RECONNECT_MAX_MS", 30_000)?;
        if reconnect_min_ms == 0 || reconnect_max_ms < reconnect_min_ms {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_RECONNECT_MAX_MS".to_string(),
                message: format!(
                    "reconnect bounds must satisfy 0 < min ({reconnect_min_ms}) <= max ({reconnect_max_ms})"
                ),
            });
        }

        let progress_ms: u64 = parse_var(&lookup, "AGENT_PROGRESS_MIN_INTERVAL_MS", 0)?;
        let grace_secs: u64 = parse_var(&lookup, "AGENT_SHUTDOWN_GRACE_SECS", 5)?;

        let log_dir = lookup("AGENT_LOG_DIR")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            coordinator_url,
            logic_path,
            identity_path,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_parallel_tasks,
            task_timeout,
            reconnect_min: Duration::from_millis(reconnect_min_ms),
            reconnect_max: Duration::from_millis(reconnect_max_ms),
            progress_min_interval: Duration::from_millis(progress_ms),
            shutdown_grace: Duration::from_secs(grace_secs),
            log_dir,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(default),
    }
}
