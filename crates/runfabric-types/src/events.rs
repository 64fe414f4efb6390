use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record in a run's append-only event log. `seq` is assigned by the
/// publisher and is strictly monotonic starting at 1; synthetic
/// consumer-side events (heartbeat, hard_timeout) use `seq = -1` and are
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventRecord {
    pub fn is_synthetic(&self) -> bool {
        self.seq < 0
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == "done" || self.kind == "error"
    }
}

/// The event vocabulary produced by the agent loop (spec §4.4) and consumed
/// by the worker, which republishes each as an [`EventRecord`] through the
/// event stream fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    Plan(serde_json::Value),
    Status(String),
    Token(String),
    Tool {
        tool: String,
        status: ToolEventStatus,
        detail: Option<serde_json::Value>,
    },
    Block(serde_json::Value),
    Citations(Vec<serde_json::Value>),
    Done {
        tokens_input: u64,
        tokens_output: u64,
        tool_rounds: u32,
        blocks_count: u32,
        citations_count: u32,
    },
    Error {
        code: String,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventStatus {
    Calling,
    Completed,
    Failed,
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Plan(_) => "plan",
            AgentEvent::Status(_) => "status",
            AgentEvent::Token(_) => "token",
            AgentEvent::Tool { .. } => "tool",
            AgentEvent::Block(_) => "block",
            AgentEvent::Citations(_) => "citations",
            AgentEvent::Done { .. } => "done",
            AgentEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done { .. } | AgentEvent::Error { .. })
    }
}
