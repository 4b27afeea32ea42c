//! Coordinator wire protocol: named events with JSON payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ChannelError;
use crate::logic::ProgressUpdate;

/// Event names.
pub mod events {
    pub const CHECK_VERSION: &str = "check_version";
    pub const UPDATE_LOGIC_FILE: &str = "update_logic_file";
    pub const LOGIC_UPTODATE: &str = "logic_uptodate";
    pub const EXECUTE_TASK: &str = "execute_task";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const TASK_PROGRESS: &str = "task_progress";
    pub const TASK_COMPLETED: &str = "task_completed";
}

/// One message on the wire: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// `execute_task` payload as received, before task-type parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub request_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Coordinator → agent.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    UpdateLogicFile { content: String },
    LogicUptodate,
    ExecuteTask(TaskEnvelope),
}

#[derive(Deserialize)]
struct UpdateLogicFilePayload {
    content: String,
}

impl InboundMessage {
    /// Decode a frame. Unknown event names yield `Ok(None)`.
    pub fn from_frame(frame: Frame) -> Result<Option<Self>, ChannelError> {
        let message = match frame.event.as_str() {
            events::UPDATE_LOGIC_FILE => {
                let payload: UpdateLogicFilePayload = serde_json::from_value(frame.data)
                    .map_err(|e| {
                        ChannelError::InvalidMessage(format!("{}: {e}", events::UPDATE_LOGIC_FILE))
                    })?;
                Self::UpdateLogicFile {
                    content: payload.content,
                }
            }
            events::LOGIC_UPTODATE => Self::LogicUptodate,
            events::EXECUTE_TASK => {
                let envelope: TaskEnvelope = serde_json::from_value(frame.data).map_err(|e| {
                    ChannelError::InvalidMessage(format!("{}: {e}", events::EXECUTE_TASK))
                })?;
                Self::ExecuteTask(envelope)
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    /// Decode a raw text frame.
    pub fn parse(text: &str) -> Result<Option<Self>, ChannelError> {
        let frame: Frame = serde_json::from_str(text)
            .map_err(|e| ChannelError::InvalidMessage(format!("malformed frame: {e}")))?;
        Self::from_frame(frame)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::UpdateLogicFile { .. } => events::UPDATE_LOGIC_FILE,
            Self::LogicUptodate => events::LOGIC_UPTODATE,
            Self::ExecuteTask(_) => events::EXECUTE_TASK,
        }
    }
}

/// Agent → coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Hash of the on-disk logic content, `None` when there is none.
    CheckVersion(Option<String>),
    Heartbeat,
    TaskProgress {
        request_id: String,
        progress: ProgressUpdate,
    },
    TaskCompleted {
        request_id: String,
        result: Value,
    },
}

impl OutboundMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CheckVersion(_) => events::CHECK_VERSION,
            Self::Heartbeat => events::HEARTBEAT,
            Self::TaskProgress { .. } => events::TASK_PROGRESS,
            Self::TaskCompleted { .. } => events::TASK_COMPLETED,
        }
    }

    /// Heartbeats and progress may be dropped under backpressure. Version
    /// checks and task results must reach the coordinator.
    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::Heartbeat | Self::TaskProgress { .. })
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::TaskProgress { request_id, .. } | Self::TaskCompleted { request_id, .. } => {
                Some(request_id)
            }
            _ => None,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::CheckVersion(hash) => hash.clone().map(Value::String).unwrap_or(Value::Null),
            Self::Heartbeat => json!({}),
            Self::TaskProgress {
                request_id,
                progress,
            } => json!({ "requestId": request_id, "progress": progress }),
            Self::TaskCompleted { request_id, result } => {
                json!({ "requestId": request_id, "result": result })
            }
        }
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            event: self.event_name().to_string(),
            data: self.payload(),
        }
    }
}
