//! Task state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// `execute_task` arrived; readiness not yet checked.
    Received,
    /// Module is ready; routing to a capability chain.
    Dispatching,
    /// Capability invocation running.
    Executing,
    /// Result emitted (success or error).
    Completed,
    /// Dropped because the logic module was not ready.
    Rejected,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Received, Dispatching) | (Received, Rejected) |
            (Dispatching, Executing) |
            // Routing errors complete without invoking anything
            (Dispatching, Completed) |
            (Executing, Completed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Dispatching => "dispatching",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Per-task lifecycle record, owned by the task's own future.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLifecycle {
    pub request_id: String,
    pub state: TaskState,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl TaskLifecycle {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            state: TaskState::Received,
            received_at: Utc::now(),
            completed_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: TaskState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.request_id, self.state, new_state
            ));
        }

        tracing::trace!(
            request_id = %self.request_id,
            from = %self.state,
            to = %new_state,
            "Task state transition"
        );

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;

        if new_state.is_terminal() {
            self.completed_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Time from receipt to terminal state (or now).
    pub fn elapsed(&self) -> Duration {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.received_at)
            .to_std()
            .unwrap_or_default()
    }
}
