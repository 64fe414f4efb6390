//! Periodic reaper for runs stuck in RUNNING (spec §4.6 "Watchdog"),
//! grounded on `original_source/app/workers/agent_tasks.py`'s
//! `watchdog_stuck_runs`. Driven by an
//! external periodic tick (a `tokio::time::interval` in the `engine`
//! binary) rather than scheduling its own — this module is a single pass,
//! not a task.

use runfabric_eventstream::{AgentStreamPublisher, EventLogStore};
use runfabric_types::{RunStatus, Run};

use crate::errors::RunErrorCode;
use crate::runtime::Worker;

const WATCHDOG_MESSAGE: &str = "run exceeded the stuck-run threshold";

/// Finds every run RUNNING since before `agent_stuck_run_threshold` and
/// fails each with `watchdog_timeout`, emitting a terminal error event per
/// run. Returns the number of runs reaped. A failure transitioning or
/// publishing for one run is logged and does not stop the batch.
pub async fn watchdog_stuck_runs<S: EventLogStore>(worker: &Worker<S>) -> anyhow::Result<usize> {
    let threshold_duration =
        chrono::Duration::from_std(worker.config.agent_stuck_run_threshold).unwrap_or_else(|_| chrono::Duration::seconds(600));
    let threshold = chrono::Utc::now() - threshold_duration;

    let stuck = worker.lifecycle.find_stuck_runs(threshold).await?;
    for run in &stuck {
        reap_one(worker, run).await;
    }
    Ok(stuck.len())
}

async fn reap_one<S: EventLogStore>(worker: &Worker<S>, run: &Run) {
    let failed = worker
        .lifecycle
        .fail_run(run.id, RunErrorCode::WatchdogTimeout.as_code(), Some(WATCHDOG_MESSAGE.to_string()), RunStatus::TimedOut)
        .await;
    if let Err(err) = failed {
        tracing::warn!(run_id = %run.id, %err, "watchdog failed to transition stuck run");
        return;
    }

    let mut publisher = AgentStreamPublisher::new(worker.event_store.clone(), run.id);
    publisher.setup(worker.config.agent_stream_ttl, worker.config.agent_stream_maxlen).await.ok();
    if let Err(err) = publisher.emit_error(RunErrorCode::WatchdogTimeout.as_code(), Some(WATCHDOG_MESSAGE.to_string())).await {
        tracing::warn!(run_id = %run.id, %err, "watchdog failed to publish error event");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use uuid::Uuid;

    use runfabric_eventstream::InMemoryLogStore;
    use runfabric_providers::AppConfig;
    use runfabric_store::{MemoryStorage, RunLifecycle};
    use runfabric_tools::{register_builtin_tools, AssistantDirectory, RetrievalBackend, ToolRegistry};
    use runfabric_types::{Assistant, AgentProfile, ChatMessage, RetrievedChunk};

    use super::*;
    use crate::collaborators::{ChatSink, ConversationHistory, UsageRecorder};
    use crate::config::RuntimeConfig;

    struct NoAssistants;
    #[async_trait]
    impl AssistantDirectory for NoAssistants {
        async fn get_assistant(&self, _assistant_id: Uuid) -> anyhow::Result<Option<Assistant>> {
            Ok(None)
        }
    }
    struct NoHistory;
    #[async_trait]
    impl ConversationHistory for NoHistory {
        async fn load_history(&self, _conversation_id: Uuid, _limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
            Ok(vec![])
        }
    }
    struct NoopChatSink;
    #[async_trait]
    impl ChatSink for NoopChatSink {
        async fn persist_assistant_message(
            &self,
            _conversation_id: Uuid,
            _run_id: Uuid,
            _content: String,
            _citations: Vec<serde_json::Value>,
            _blocks: Vec<serde_json::Value>,
            _tokens_output: u64,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }
    struct NoopUsage;
    #[async_trait]
    impl UsageRecorder for NoopUsage {
        async fn record_chat_usage(&self, _tenant_id: Uuid, _tokens_input: u64, _tokens_output: u64) -> anyhow::Result<()> {
            Ok(())
        }
    }
    struct EmptyRetrieval;
    #[async_trait]
    impl RetrievalBackend for EmptyRetrieval {
        async fn retrieve(&self, _query: &str, _tenant_id: Uuid, _collection_ids: &[Uuid], _top_k: usize) -> anyhow::Result<Vec<RetrievedChunk>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn reaps_run_started_before_threshold() {
        let storage = Arc::new(MemoryStorage::new());
        let lifecycle = Arc::new(RunLifecycle::new(storage));
        let run = lifecycle
            .create_run(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "hi", AgentProfile::Reactive, None, None)
            .await
            .unwrap();
        lifecycle.start_run(run.id).await.unwrap();

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, Arc::new(EmptyRetrieval), None, None, None, None, None, None, None, &[]);

        let worker = Worker {
            lifecycle: lifecycle.clone(),
            event_store: Arc::new(InMemoryLogStore::new()),
            tools: Arc::new(registry),
            providers: Arc::new(runfabric_providers::ProviderRegistry::new(AppConfig::default())),
            assistants: Arc::new(NoAssistants),
            history: Arc::new(NoHistory),
            chat_sink: Arc::new(NoopChatSink),
            usage: Arc::new(NoopUsage),
            config: RuntimeConfig {
                agent_stuck_run_threshold: std::time::Duration::from_secs(0),
                ..RuntimeConfig::default()
            },
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let reaped = watchdog_stuck_runs(&worker).await.unwrap();
        assert_eq!(reaped, 1);

        let after = lifecycle.get_run(run.id, None).await.unwrap().unwrap();
        assert_eq!(after.status, RunStatus::TimedOut);
        assert_eq!(after.error_code.as_deref(), Some("watchdog_timeout"));
    }
}
