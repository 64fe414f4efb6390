//! Wire-level shapes for the chat SSE endpoint (spec §6): the one interface
//! in scope beyond the event vocabulary itself. Everything here is a thin,
//! serializable projection of `runfabric-types::AgentEvent` plus the two
//! framing events (`conversation_id`, `run_id`) the transport sends before
//! the event stream starts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use runfabric_types::{AgentEvent, EventRecord, ToolEventStatus};

/// One `event: <name>\ndata: <json>` frame as consumed by an SSE client.
/// `axum::response::sse::Event` is built from this at the HTTP boundary
/// (kept out of this crate so it stays transport-framework agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    pub fn json(event: impl Into<String>, data: &impl Serialize) -> Self {
        Self::new(event, serde_json::to_string(data).unwrap_or_else(|_| "null".to_string()))
    }

    pub fn conversation_id(id: Uuid) -> Self {
        Self::new("conversation_id", id.to_string())
    }

    pub fn run_id(id: Uuid) -> Self {
        Self::new("run_id", id.to_string())
    }
}

/// Error payload carried by the `error` SSE event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: Option<String>,
}

/// Done payload carried by the terminal `done` SSE event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonePayload {
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tool_rounds: u32,
    pub blocks_count: u32,
    pub citations_count: u32,
}

/// Converts a loop/worker [`AgentEvent`] into the wire frame the chat
/// endpoint relays. `token` frames carry raw text (not JSON-encoded),
/// matching the documented wire contract (`data: <text>` for `token`, JSON
/// for everything else).
pub fn frame_for_event(event: &AgentEvent) -> SseFrame {
    match event {
        AgentEvent::Plan(plan) => SseFrame::json("plan", plan),
        AgentEvent::Status(status) => SseFrame::json("status", &serde_json::json!({ "status": status })),
        AgentEvent::Token(text) => SseFrame::new("token", text.clone()),
        AgentEvent::Tool { tool, status, detail } => SseFrame::json(
            "tool",
            &serde_json::json!({
                "tool": tool,
                "status": tool_status_str(*status),
                "detail": detail,
            }),
        ),
        AgentEvent::Block(payload) => SseFrame::json("block", payload),
        AgentEvent::Citations(list) => SseFrame::json("citations", list),
        AgentEvent::Done {
            tokens_input,
            tokens_output,
            tool_rounds,
            blocks_count,
            citations_count,
        } => SseFrame::json(
            "done",
            &DonePayload {
                tokens_input: *tokens_input,
                tokens_output: *tokens_output,
                tool_rounds: *tool_rounds,
                blocks_count: *blocks_count,
                citations_count: *citations_count,
            },
        ),
        AgentEvent::Error { code, message } => SseFrame::json(
            "error",
            &ErrorPayload {
                code: code.clone(),
                message: message.clone(),
            },
        ),
    }
}

fn tool_status_str(status: ToolEventStatus) -> &'static str {
    match status {
        ToolEventStatus::Calling => "calling",
        ToolEventStatus::Completed => "completed",
        ToolEventStatus::Failed => "failed",
    }
}

/// Converts a stored [`EventRecord`] (as read back from an event log for
/// reconnection/replay, spec §6 "resume from seq") into the same wire frame
/// `frame_for_event` would have produced live. The two must stay in lockstep
/// with `runfabric-eventstream::publisher::payload_for`, which is what wrote
/// `record.data` in the first place: `token` unwraps `{"text": ...}` back to
/// raw text, `citations` unwraps `{"citations": [...]}` back to a bare
/// array, everything else is already the right shape and passes through.
pub fn frame_for_record(record: &EventRecord) -> SseFrame {
    match record.kind.as_str() {
        "token" => {
            let text = record.data.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            SseFrame::new("token", text)
        }
        "citations" => {
            let list = record
                .data
                .get("citations")
                .cloned()
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
            SseFrame::json("citations", &list)
        }
        kind => SseFrame::json(kind, &record.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_frame_carries_raw_text_not_json() {
        let frame = frame_for_event(&AgentEvent::Token("hello".to_string()));
        assert_eq!(frame.event, "token");
        assert_eq!(frame.data, "hello");
    }

    #[test]
    fn done_frame_is_json() {
        let frame = frame_for_event(&AgentEvent::Done {
            tokens_input: 20,
            tokens_output: 10,
            tool_rounds: 1,
            blocks_count: 0,
            citations_count: 0,
        });
        assert_eq!(frame.event, "done");
        let decoded: DonePayload = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(decoded.tokens_input, 20);
    }

    #[test]
    fn record_frame_matches_live_frame_for_token() {
        let live = frame_for_event(&AgentEvent::Token("hi there".to_string()));
        let record = EventRecord {
            seq: 1,
            kind: "token".to_string(),
            ts: chrono::Utc::now(),
            data: serde_json::json!({ "text": "hi there" }),
        };
        let replayed = frame_for_record(&record);
        assert_eq!(replayed.event, live.event);
        assert_eq!(replayed.data, live.data);
    }

    #[test]
    fn record_frame_unwraps_citations_to_bare_array() {
        let record = EventRecord {
            seq: 2,
            kind: "citations".to_string(),
            ts: chrono::Utc::now(),
            data: serde_json::json!({ "citations": [{"source_id": "contract.pdf"}] }),
        };
        let frame = frame_for_record(&record);
        assert_eq!(frame.event, "citations");
        let decoded: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        assert!(decoded.is_array());
    }
}
