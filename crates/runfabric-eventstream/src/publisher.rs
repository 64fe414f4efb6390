//! `AgentStreamPublisher`, grounded on
//! `original_source/app/core/streams.py::AgentStreamPublisher` — same seq
//! counter, same "refresh TTL every 10th append or on a terminal event"
//! rule, reusing `runfabric_types::AgentEvent` as the payload vocabulary
//! instead of the Python original's ad hoc dict literals.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use runfabric_types::{AgentEvent, EventRecord, ToolEventStatus};

use crate::store::EventLogStore;

fn stream_key(run_id: Uuid) -> String {
    format!("agent:{run_id}")
}

fn tool_status_str(status: ToolEventStatus) -> &'static str {
    match status {
        ToolEventStatus::Calling => "calling",
        ToolEventStatus::Completed => "completed",
        ToolEventStatus::Failed => "failed",
    }
}

fn payload_for(event: &AgentEvent) -> serde_json::Value {
    match event {
        AgentEvent::Plan(v) => v.clone(),
        AgentEvent::Status(status) => json!({ "status": status }),
        AgentEvent::Token(text) => json!({ "text": text }),
        AgentEvent::Tool { tool, status, detail } => json!({
            "tool": tool,
            "status": tool_status_str(*status),
            "detail": detail,
        }),
        AgentEvent::Block(v) => v.clone(),
        AgentEvent::Citations(v) => json!({ "citations": v }),
        AgentEvent::Done {
            tokens_input,
            tokens_output,
            tool_rounds,
            blocks_count,
            citations_count,
        } => json!({
            "tokens_input": tokens_input,
            "tokens_output": tokens_output,
            "tool_rounds": tool_rounds,
            "blocks_count": blocks_count,
            "citations_count": citations_count,
        }),
        AgentEvent::Error { code, message } => json!({ "code": code, "message": message }),
    }
}

pub struct AgentStreamPublisher<S: EventLogStore> {
    store: Arc<S>,
    key: String,
    seq: i64,
    ttl: Duration,
    maxlen: usize,
}

impl<S: EventLogStore> AgentStreamPublisher<S> {
    pub fn new(store: Arc<S>, run_id: Uuid) -> Self {
        Self {
            store,
            key: stream_key(run_id),
            seq: 0,
            ttl: Duration::from_secs(600),
            maxlen: 2000,
        }
    }

    pub async fn setup(&mut self, ttl: Duration, maxlen: usize) -> anyhow::Result<()> {
        self.ttl = ttl;
        self.maxlen = maxlen;
        self.store.expire(&self.key, ttl).await
    }

    async fn emit(&mut self, event: AgentEvent) -> anyhow::Result<EventRecord> {
        self.seq += 1;
        let record = EventRecord {
            seq: self.seq,
            kind: event.kind().to_string(),
            ts: Utc::now(),
            data: payload_for(&event),
        };
        self.store.append(&self.key, record.clone(), self.maxlen).await?;
        if self.seq % 10 == 0 || event.is_terminal() {
            self.store.expire(&self.key, self.ttl).await?;
        }
        Ok(record)
    }

    pub async fn emit_status(&mut self, status: impl Into<String>) -> anyhow::Result<EventRecord> {
        self.emit(AgentEvent::Status(status.into())).await
    }

    pub async fn emit_delta(&mut self, text: impl Into<String>) -> anyhow::Result<EventRecord> {
        self.emit(AgentEvent::Token(text.into())).await
    }

    pub async fn emit_tool(
        &mut self,
        tool: impl Into<String>,
        status: ToolEventStatus,
        detail: Option<serde_json::Value>,
    ) -> anyhow::Result<EventRecord> {
        self.emit(AgentEvent::Tool {
            tool: tool.into(),
            status,
            detail,
        })
        .await
    }

    pub async fn emit_block(&mut self, block: serde_json::Value) -> anyhow::Result<EventRecord> {
        self.emit(AgentEvent::Block(block)).await
    }

    /// Not in the §4.5 "typed emitters" list (status/delta/tool/block/
    /// citations/done/error) but needed to carry the planner's output
    /// (spec §4.4 step 1: "emit event `plan` with the plan JSON").
    pub async fn emit_plan(&mut self, plan: serde_json::Value) -> anyhow::Result<EventRecord> {
        self.emit(AgentEvent::Plan(plan)).await
    }

    pub async fn emit_citations(&mut self, citations: Vec<serde_json::Value>) -> anyhow::Result<EventRecord> {
        self.emit(AgentEvent::Citations(citations)).await
    }

    pub async fn emit_done(
        &mut self,
        tokens_input: u64,
        tokens_output: u64,
        tool_rounds: u32,
        blocks_count: u32,
        citations_count: u32,
    ) -> anyhow::Result<EventRecord> {
        self.emit(AgentEvent::Done {
            tokens_input,
            tokens_output,
            tool_rounds,
            blocks_count,
            citations_count,
        })
        .await
    }

    pub async fn emit_error(
        &mut self,
        code: impl Into<String>,
        message: Option<String>,
    ) -> anyhow::Result<EventRecord> {
        self.emit(AgentEvent::Error {
            code: code.into(),
            message,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLogStore;

    #[tokio::test]
    async fn ttl_refreshes_every_tenth_append_and_on_terminal_event() {
        let store = Arc::new(InMemoryLogStore::new());
        let mut pub_ = AgentStreamPublisher::new(store, Uuid::new_v4());
        pub_.setup(Duration::from_secs(600), 2000).await.unwrap();

        for i in 1..=9 {
            let record = pub_.emit_status(format!("step-{i}")).await.unwrap();
            assert_eq!(record.seq, i);
        }
        // 10th append refreshes TTL; verified indirectly by not erroring —
        // InMemoryLogStore::expire never fails.
        pub_.emit_status("step-10").await.unwrap();

        let done = pub_.emit_done(100, 50, 1, 0, 0).await.unwrap();
        assert_eq!(done.kind, "done");
        assert_eq!(done.seq, 11);
    }
}
