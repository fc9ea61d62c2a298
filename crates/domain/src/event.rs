//! Run events — the observable artifacts of one agent-loop execution.
//!
//! Events are append-only, keyed `(thread_id, run_id, seq)` with `seq`
//! strictly monotonic per run starting at 1. The durable log is the source
//! of truth; the in-memory ring buffer is a fast path for live observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every event type a run may emit. `task_*` variants carry sub-task
/// streams; `subagent_task_*` carry streams of tasks spawned by sub-agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Text,
    ToolCall,
    ToolResult,
    Status,
    Done,
    Error,
    Cancelled,
    TaskStart,
    TaskText,
    TaskToolCall,
    TaskToolResult,
    TaskDone,
    TaskError,
    SubagentTaskStart,
    SubagentTaskText,
    SubagentTaskToolCall,
    SubagentTaskToolResult,
    SubagentTaskDone,
    SubagentTaskError,
}

impl EventType {
    /// Terminal events end the stream for every observer.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    /// The wire name, used as the SSE `event:` field and the database column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Status => "status",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::TaskStart => "task_start",
            Self::TaskText => "task_text",
            Self::TaskToolCall => "task_tool_call",
            Self::TaskToolResult => "task_tool_result",
            Self::TaskDone => "task_done",
            Self::TaskError => "task_error",
            Self::SubagentTaskStart => "subagent_task_start",
            Self::SubagentTaskText => "subagent_task_text",
            Self::SubagentTaskToolCall => "subagent_task_tool_call",
            Self::SubagentTaskToolResult => "subagent_task_tool_result",
            Self::SubagentTaskDone => "subagent_task_done",
            Self::SubagentTaskError => "subagent_task_error",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| crate::Error::Corruption(format!("unknown event type: {s}")))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One event as observers see it. `seq` is assigned by the run's event
/// buffer at emit time; `message_id` lets clients deduplicate streamed
/// text chunks that belong to the same model message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunEvent {
    /// An unsequenced event; `seq` is assigned when the buffer accepts it.
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            seq: 0,
            event_type,
            data,
            message_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// The SSE `data:` payload — event data with the reserved `_seq` field
    /// (and `message_id`, when present) folded in.
    pub fn wire_data(&self) -> serde_json::Value {
        let mut data = self.data.clone();
        if let serde_json::Value::Object(map) = &mut data {
            map.insert("_seq".into(), serde_json::json!(self.seq));
            if let Some(mid) = &self.message_id {
                map.insert("message_id".into(), serde_json::json!(mid));
            }
        }
        data
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::Error::Corruption(format!("unknown run status: {other}"))),
        }
    }
}

/// One execution of the agent loop for one user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: uuid::Uuid,
    pub thread_id: String,
    pub input_message: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(thread_id: impl Into<String>, input_message: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            thread_id: thread_id.into(),
            input_message: input_message.into(),
            status: RunStatus::Running,
            error_text: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn terminal_types() {
        assert!(EventType::Done.is_terminal());
        assert!(EventType::Error.is_terminal());
        assert!(EventType::Cancelled.is_terminal());
        assert!(!EventType::Text.is_terminal());
        assert!(!EventType::TaskDone.is_terminal());
        assert!(!EventType::Status.is_terminal());
    }

    #[test]
    fn wire_names_roundtrip() {
        for ty in [
            EventType::Text,
            EventType::ToolCall,
            EventType::Status,
            EventType::TaskToolResult,
            EventType::SubagentTaskError,
        ] {
            assert_eq!(EventType::from_str(ty.as_str()).unwrap(), ty);
        }
    }

    #[test]
    fn unknown_wire_name_is_corruption() {
        let err = EventType::from_str("bogus").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Corruption);
    }

    #[test]
    fn wire_data_injects_seq_and_message_id() {
        let mut evt = RunEvent::new(EventType::Text, serde_json::json!({"content": "hi"}))
            .with_message_id("m1");
        evt.seq = 7;
        let data = evt.wire_data();
        assert_eq!(data["_seq"], 7);
        assert_eq!(data["message_id"], "m1");
        assert_eq!(data["content"], "hi");
    }

    #[test]
    fn run_starts_running() {
        let run = Run::new("t1", "hello");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());
        assert!(!run.status.is_terminal());
    }

    #[test]
    fn run_status_parse() {
        assert_eq!(RunStatus::from_str("done").unwrap(), RunStatus::Done);
        assert!(RunStatus::from_str("paused").is_err());
    }
}
