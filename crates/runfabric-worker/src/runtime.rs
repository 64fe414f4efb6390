//! `run_agent` (spec §4.6), grounded on `original_source/app/workers/agent_tasks.py`
//! and a dequeue/dispatch loop shape — generalized from a single-process
//! event-bus loop to the publish/consume handoff this workspace's event
//! stream fabric uses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use runfabric_budget::BudgetManager;
use runfabric_eventstream::{AgentStreamPublisher, EventLogStore};
use runfabric_observability::{bind_run_context, record_tenant};
use runfabric_planner::{analyze_source_coverage, check_source_coverage_heuristic, generate_plan, needs_planning, run_agent_loop};
use runfabric_providers::ProviderRegistry;
use runfabric_store::RunLifecycle;
use runfabric_tools::{execute_tool_call, AssistantDirectory, ToolCallContext, ToolRegistry};
use runfabric_types::{AgentContext, AgentEvent, AgentProfile, Citation, LogLevel, RunStatus, ToolResult, TraceStatus};

use crate::collaborators::{ChatSink, ConversationHistory, UsageRecorder};
use crate::config::RuntimeConfig;
use crate::errors::RunErrorCode;

/// Everything a worker task needs to drive one run to completion. Cloned
/// cheaply (every field is an `Arc`); one instance is shared by every
/// concurrently running `run_agent` call in the process.
pub struct Worker<S: EventLogStore> {
    pub lifecycle: Arc<RunLifecycle>,
    pub event_store: Arc<S>,
    pub tools: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub assistants: Arc<dyn AssistantDirectory>,
    pub history: Arc<dyn ConversationHistory>,
    pub chat_sink: Arc<dyn ChatSink>,
    pub usage: Arc<dyn UsageRecorder>,
    pub config: RuntimeConfig,
}

struct ConsumeOutcome {
    response: String,
    blocks: Vec<serde_json::Value>,
    citations: Vec<serde_json::Value>,
    done: Option<(u64, u64, u32, u32, u32)>,
    error: Option<(String, Option<String>)>,
}

/// Consumes the loop's event channel (spec §4.6 step 9), republishing each
/// event through the stream publisher and batching `token` deltas per
/// `agent_delta_batch_ms` (step 10's flush is the loop's final tick plus
/// the unconditional flush once the channel closes).
async fn consume_loop_events<S: EventLogStore>(
    rx: &mut mpsc::UnboundedReceiver<AgentEvent>,
    publisher: &mut AgentStreamPublisher<S>,
    batch_interval: Duration,
) -> anyhow::Result<ConsumeOutcome> {
    let mut response = String::new();
    let mut pending_delta = String::new();
    let mut blocks = Vec::new();
    let mut citations = Vec::new();
    let mut done = None;
    let mut error = None;

    let mut ticker = tokio::time::interval(batch_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; consume it so batching starts from here

    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                match event {
                    None => break,
                    Some(AgentEvent::Plan(plan)) => {
                        publisher.emit_plan(plan).await?;
                    }
                    Some(AgentEvent::Status(status)) => {
                        publisher.emit_status(status).await?;
                    }
                    Some(AgentEvent::Token(text)) => {
                        response.push_str(&text);
                        pending_delta.push_str(&text);
                    }
                    Some(AgentEvent::Tool { tool, status, detail }) => {
                        publisher.emit_tool(tool, status, detail).await?;
                    }
                    Some(AgentEvent::Block(block)) => {
                        blocks.push(block.clone());
                        publisher.emit_block(block).await?;
                    }
                    Some(AgentEvent::Citations(list)) => {
                        // Citations were already serialized from typed
                        // `Citation` values in the loop; UUIDs stringify
                        // through that Serialize impl, so there is nothing
                        // left to coerce here beyond taking the latest set.
                        citations = list.clone();
                        publisher.emit_citations(list).await?;
                    }
                    Some(AgentEvent::Done { tokens_input, tokens_output, tool_rounds, blocks_count, citations_count }) => {
                        done = Some((tokens_input, tokens_output, tool_rounds, blocks_count, citations_count));
                        break;
                    }
                    Some(AgentEvent::Error { code, message }) => {
                        publisher.emit_error(code.clone(), message.clone()).await?;
                        error = Some((code, message));
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !pending_delta.is_empty() {
                    publisher.emit_delta(std::mem::take(&mut pending_delta)).await?;
                }
            }
        }
    }

    if !pending_delta.is_empty() {
        publisher.emit_delta(std::mem::take(&mut pending_delta)).await?;
    }

    Ok(ConsumeOutcome { response, blocks, citations, done, error })
}

/// Drives one run from dequeue to a guaranteed terminal status (spec
/// §4.6). Never panics or propagates an error to the caller: any failure
/// not already handled as a specific error code is caught and reported as
/// `worker_exception`.
pub async fn run_agent<S: EventLogStore>(worker: &Worker<S>, run_id: Uuid) {
    let span = bind_run_context(&run_id.to_string());
    let _enter = span.enter();

    let mut publisher = AgentStreamPublisher::new(worker.event_store.clone(), run_id);
    if let Err(err) = publisher.setup(worker.config.agent_stream_ttl, worker.config.agent_stream_maxlen).await {
        tracing::warn!(%err, "failed to configure event stream TTL/maxlen");
    }

    if let Err(err) = run_agent_inner(worker, run_id, &span, &mut publisher).await {
        tracing::error!(%err, "run_agent failed with an uncaught error, failing run as worker_exception");
        let message = err.to_string();
        let _ = worker
            .lifecycle
            .fail_run(run_id, RunErrorCode::WorkerException.as_code(), Some(message.clone()), RunStatus::Failed)
            .await;
        worker
            .lifecycle
            .log_audit(
                "run_failed",
                None,
                Some(run_id),
                None,
                Some("run".to_string()),
                Some(run_id.to_string()),
                None,
                LogLevel::Error,
                message.clone(),
            )
            .await;
        let _ = publisher.emit_error(RunErrorCode::WorkerException.as_code(), Some(message)).await;
    }
}

/// Runs `search_documents` directly against the registry (spec §4.6 step
/// 8's "direct retrieval-first strategy" for reactive), bypassing the LLM's
/// tool-call decision entirely — reactive only gets one round, and a round
/// spent deciding to call the tool would leave nothing to synthesize an
/// answer with.
async fn run_reactive_retrieval(
    tools: &ToolRegistry,
    tenant_id: Uuid,
    assistant_id: Uuid,
    conversation_id: Uuid,
    collection_ids: &[Uuid],
    query: &str,
) -> (String, Vec<Citation>) {
    let call_ctx = ToolCallContext {
        arguments: serde_json::json!({ "query": query }),
        tenant_id,
        assistant_id: Some(assistant_id),
        conversation_id: Some(conversation_id),
        collection_ids: collection_ids.to_vec(),
        citations: Vec::new(),
        profile: AgentProfile::Reactive,
        budget: None,
        user_context: HashMap::new(),
    };

    let result = execute_tool_call(tools, "search_documents", call_ctx).await;
    match result.result {
        Some(ToolResult::Chunks { chunks }) if !chunks.is_empty() => {
            let context = chunks
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let page = c.page_number.map(|p| format!(", p. {p}")).unwrap_or_default();
                    format!("[Document {}: {}{}]\n{}", i + 1, c.document_filename, page, c.text)
                })
                .collect::<Vec<_>>()
                .join("\n\n---\n\n");
            let citations = chunks
                .iter()
                .map(|c| Citation {
                    chunk_id: Some(c.chunk_id),
                    document_id: Some(c.document_id),
                    document_filename: Some(c.document_filename.clone()),
                    page_number: c.page_number,
                    excerpt: Some(c.text.chars().take(200).collect()),
                    score: Some(c.score),
                    url: None,
                })
                .collect();
            (context, citations)
        }
        _ => ("Aucun document pertinent trouvé.".to_string(), Vec::new()),
    }
}

async fn run_agent_inner<S: EventLogStore>(
    worker: &Worker<S>,
    run_id: Uuid,
    span: &tracing::Span,
    publisher: &mut AgentStreamPublisher<S>,
) -> anyhow::Result<()> {
    // Step 2: load Run.
    let Some(_existing) = worker.lifecycle.get_run(run_id, None).await? else {
        publisher
            .emit_error(RunErrorCode::RunNotFound.as_code(), Some(format!("run {run_id} not found")))
            .await?;
        return Ok(());
    };

    // Step 3: start_run, emit status("starting").
    let run = worker.lifecycle.start_run(run_id).await?;
    record_tenant(span, &run.tenant_id.to_string());
    publisher.emit_status("starting").await?;

    // Step 4: load Assistant.
    let Some(assistant) = worker.assistants.get_assistant(run.assistant_id).await? else {
        worker
            .lifecycle
            .fail_run(run_id, RunErrorCode::AssistantNotFound.as_code(), Some("assistant not found".to_string()), RunStatus::Failed)
            .await?;
        publisher
            .emit_error(RunErrorCode::AssistantNotFound.as_code(), Some("assistant not found".to_string()))
            .await?;
        return Ok(());
    };

    // Step 5: initialize Budget.
    let budget_total = run.budget_tokens.unwrap_or_else(|| run.profile.default_budget_tokens());
    let mut budget = BudgetManager::new(budget_total);

    // Step 6: resolve allowed tools (profile + connected providers).
    let connected_providers = assistant.integrations.clone();
    let allowed_tools: Vec<String> = worker
        .tools
        .get_allowed_tools(run.profile, &connected_providers, None, &[])
        .into_iter()
        .map(|d| d.name.clone())
        .collect();
    tracing::debug!(tools = ?allowed_tools, "resolved allowed tools for run");

    // Step 7: load conversation history.
    let history = worker.history.load_history(run.conversation_id, worker.config.history_window).await?;

    // Resolved up front so the LLM trace (step 15) can name a model and
    // provider even though the loop itself never hands one back.
    let selected_provider = worker.providers.select_provider(None).await.ok();
    let (trace_model, trace_provider) = match &selected_provider {
        Some(provider) => {
            let info = provider.info();
            let model = worker
                .config
                .llm_model
                .clone()
                .unwrap_or_else(|| info.models.first().map(|m| m.id.clone()).unwrap_or_default());
            (model, info.id)
        }
        None => (worker.config.llm_model.clone().unwrap_or_default(), "unknown".to_string()),
    };

    // Step 8: reactive is a retrieval-first single round rather than a
    // planned multi-round loop — its one allowed tool round has to be the
    // synthesis round, so retrieval runs directly here instead of being
    // left to the model to call `search_documents` itself. Balanced/pro/exec
    // never retrieve up front; they generate a plan and let the loop call
    // tools across multiple rounds instead.
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
    let (plan, system_prompt, reactive_allowed_tools) = if run.profile == AgentProfile::Reactive {
        publisher.emit_status("searching").await?;
        let (context, citations) = run_reactive_retrieval(
            &worker.tools,
            run.tenant_id,
            run.assistant_id,
            run.conversation_id,
            &assistant.collections,
            &run.input_text,
        )
        .await;
        if !citations.is_empty() {
            let values: Vec<serde_json::Value> = citations.iter().map(|c| serde_json::to_value(c).unwrap_or_default()).collect();
            let _ = tx.send(AgentEvent::Citations(values));
        }
        let mut system_prompt = assistant.system_prompt.clone();
        system_prompt.push_str("\n\nContexte documentaire:\n");
        system_prompt.push_str(&context);
        let without_retrieval: Vec<String> = allowed_tools.iter().filter(|name| name.as_str() != "search_documents").cloned().collect();
        (None, system_prompt, without_retrieval)
    } else if needs_planning(run.profile) {
        let plan = generate_plan(&worker.providers, &run.input_text, run.profile, &allowed_tools, None).await;
        (Some(plan), assistant.system_prompt.clone(), allowed_tools.clone())
    } else {
        (None, assistant.system_prompt.clone(), allowed_tools.clone())
    };

    let ctx = AgentContext {
        tenant_id: run.tenant_id,
        assistant_id: run.assistant_id,
        conversation_id: run.conversation_id,
        message: run.input_text.clone(),
        system_prompt,
        history,
        collection_ids: assistant.collections.clone(),
        integrations: assistant.integrations.clone(),
        profile: run.profile,
        plan,
        allowed_tools: reactive_allowed_tools,
        user_context: HashMap::new(),
    };

    // Step 9/10: run the loop and consume its events concurrently. The
    // loop emits `plan` itself as its first event when `ctx.plan` is set,
    // which is why step 8 above only builds the plan rather than
    // publishing it directly. Reactive's pre-fetched citations were queued
    // onto `tx` above, ahead of anything the loop itself sends, so the
    // consumer republishes and records them before the first token.
    let loop_fut = run_agent_loop(ctx, &mut budget, &worker.tools, &worker.providers, tx);
    let consume_fut = consume_loop_events(&mut rx, publisher, worker.config.agent_delta_batch_ms);
    let (_, outcome) = tokio::join!(loop_fut, consume_fut);
    let outcome = outcome?;

    if let Some((code, _message)) = outcome.error {
        // `consume_loop_events` already published the terminal error event;
        // finalize the run as FAILED and stop (steps 11-16 do not run).
        worker.lifecycle.fail_run(run_id, code, None, RunStatus::Failed).await?;
        return Ok(());
    }

    let Some((tokens_input, tokens_output, tool_rounds, blocks_count, citations_count)) = outcome.done else {
        anyhow::bail!("agent loop ended without emitting done or error");
    };

    // Step 11: source-coverage post-pass.
    let mut response = outcome.response;
    let coverage = if run.profile == AgentProfile::Reactive {
        check_source_coverage_heuristic(&response, outcome.citations.len())
    } else {
        analyze_source_coverage(&response, &[])
    };
    if coverage.needs_disclaimer() {
        if let Some(disclaimer) = coverage.disclaimer {
            response.push_str(&disclaimer);
            publisher.emit_delta(disclaimer).await?;
        }
    }

    // Step 12: persist the assistant message.
    worker
        .chat_sink
        .persist_assistant_message(run.conversation_id, run_id, response.clone(), outcome.citations, outcome.blocks, tokens_output)
        .await?;

    // Step 13: record chat usage.
    worker.usage.record_chat_usage(run.tenant_id, tokens_input, tokens_output).await?;

    // Step 14: complete_run.
    worker
        .lifecycle
        .complete_run(run_id, Some(response), Some(tokens_input), Some(tokens_output), Some(tool_rounds), Some(budget.remaining()))
        .await?;

    // Step 15: record LLM trace.
    worker
        .lifecycle
        .record_llm_trace(trace_model, trace_provider, tokens_input, tokens_output, None, Some(run.tenant_id), Some(run_id), TraceStatus::Ok, None, None)
        .await;

    // Step 16: emit done.
    publisher.emit_done(tokens_input, tokens_output, tool_rounds, blocks_count, citations_count).await?;
    Ok(())
}

/// Abort hook (spec §4.6 "Abort hook"), called by the queue runtime on
/// shutdown or explicit cancellation. `fail_run` is idempotent, so this is
/// safe to call on a run already in a terminal state.
pub async fn on_agent_job_abort<S: EventLogStore>(worker: &Worker<S>, run_id: Uuid) -> anyhow::Result<()> {
    worker
        .lifecycle
        .fail_run(run_id, RunErrorCode::WorkerAborted.as_code(), Some("job aborted".to_string()), RunStatus::Aborted)
        .await?;

    let mut publisher = AgentStreamPublisher::new(worker.event_store.clone(), run_id);
    publisher.setup(worker.config.agent_stream_ttl, worker.config.agent_stream_maxlen).await.ok();
    publisher
        .emit_error(RunErrorCode::WorkerAborted.as_code(), Some("job aborted".to_string()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use runfabric_eventstream::InMemoryLogStore;
    use runfabric_providers::AppConfig;
    use runfabric_store::MemoryStorage;
    use runfabric_tools::{register_builtin_tools, RetrievalBackend, ToolRegistry};
    use runfabric_types::{Assistant, ChatMessage as Msg, RetrievedChunk};

    struct FixedDirectory(Assistant);

    #[async_trait]
    impl AssistantDirectory for FixedDirectory {
        async fn get_assistant(&self, assistant_id: Uuid) -> anyhow::Result<Option<Assistant>> {
            if assistant_id == self.0.id {
                Ok(Some(self.0.clone()))
            } else {
                Ok(None)
            }
        }
    }

    struct EmptyRetrieval;

    #[async_trait]
    impl RetrievalBackend for EmptyRetrieval {
        async fn retrieve(&self, _query: &str, _tenant_id: Uuid, _collection_ids: &[Uuid], _top_k: usize) -> anyhow::Result<Vec<RetrievedChunk>> {
            Ok(vec![])
        }
    }

    struct NoHistory;

    #[async_trait]
    impl ConversationHistory for NoHistory {
        async fn load_history(&self, _conversation_id: Uuid, _limit: usize) -> anyhow::Result<Vec<Msg>> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct RecordingChatSink {
        persisted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatSink for RecordingChatSink {
        async fn persist_assistant_message(
            &self,
            _conversation_id: Uuid,
            _run_id: Uuid,
            content: String,
            _citations: Vec<serde_json::Value>,
            _blocks: Vec<serde_json::Value>,
            _tokens_output: u64,
        ) -> anyhow::Result<()> {
            self.persisted.lock().unwrap().push(content);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUsage {
        calls: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl UsageRecorder for RecordingUsage {
        async fn record_chat_usage(&self, _tenant_id: Uuid, tokens_input: u64, tokens_output: u64) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((tokens_input, tokens_output));
            Ok(())
        }
    }

    fn test_assistant(id: Uuid) -> Assistant {
        Assistant {
            id,
            tenant_id: Uuid::new_v4(),
            name: "Test".to_string(),
            system_prompt: "Tu es un assistant de test.".to_string(),
            agent_profile: AgentProfile::Reactive,
            collections: vec![],
            integrations: vec![],
        }
    }

    async fn build_worker(profile: AgentProfile) -> (Arc<Worker<InMemoryLogStore>>, Arc<RunLifecycle>, Uuid, Uuid) {
        let storage = Arc::new(MemoryStorage::new());
        let lifecycle = Arc::new(RunLifecycle::new(storage));

        let tenant_id = Uuid::new_v4();
        let assistant = test_assistant(Uuid::new_v4());
        let run = lifecycle
            .create_run(tenant_id, assistant.id, Uuid::new_v4(), "bonjour", profile, Some(4000), None)
            .await
            .unwrap();

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, Arc::new(EmptyRetrieval), None, None, None, None, None, None, None, &[]);

        let worker = Arc::new(Worker {
            lifecycle: lifecycle.clone(),
            event_store: Arc::new(InMemoryLogStore::new()),
            tools: Arc::new(registry),
            providers: Arc::new(ProviderRegistry::new(AppConfig::default())),
            assistants: Arc::new(FixedDirectory(assistant.clone())),
            history: Arc::new(NoHistory),
            chat_sink: Arc::new(RecordingChatSink::default()),
            usage: Arc::new(RecordingUsage::default()),
            config: RuntimeConfig::default(),
        });

        (worker, lifecycle, run.id, assistant.id)
    }

    #[tokio::test]
    async fn run_not_found_terminates_without_panicking() {
        let (worker, _lifecycle, _run_id, _assistant_id) = build_worker(AgentProfile::Reactive).await;
        // A run id the lifecycle has never seen.
        run_agent(&worker, Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn reactive_run_reaches_completed() {
        let (worker, lifecycle, run_id, _assistant_id) = build_worker(AgentProfile::Reactive).await;
        run_agent(&worker, run_id).await;

        let run = lifecycle.get_run(run_id, None).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.output_text.is_some());
    }

    #[tokio::test]
    async fn missing_assistant_fails_run_with_specific_code() {
        let storage = Arc::new(MemoryStorage::new());
        let lifecycle = Arc::new(RunLifecycle::new(storage));
        let tenant_id = Uuid::new_v4();
        let run = lifecycle
            .create_run(tenant_id, Uuid::new_v4(), Uuid::new_v4(), "bonjour", AgentProfile::Reactive, None, None)
            .await
            .unwrap();

        struct NoAssistants;
        #[async_trait]
        impl AssistantDirectory for NoAssistants {
            async fn get_assistant(&self, _assistant_id: Uuid) -> anyhow::Result<Option<Assistant>> {
                Ok(None)
            }
        }

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, Arc::new(EmptyRetrieval), None, None, None, None, None, None, None, &[]);

        let worker = Worker {
            lifecycle: lifecycle.clone(),
            event_store: Arc::new(InMemoryLogStore::new()),
            tools: Arc::new(registry),
            providers: Arc::new(ProviderRegistry::new(AppConfig::default())),
            assistants: Arc::new(NoAssistants),
            history: Arc::new(NoHistory),
            chat_sink: Arc::new(RecordingChatSink::default()),
            usage: Arc::new(RecordingUsage::default()),
            config: RuntimeConfig::default(),
        };

        run_agent(&worker, run.id).await;

        let after = lifecycle.get_run(run.id, None).await.unwrap().unwrap();
        assert_eq!(after.status, RunStatus::Failed);
        assert_eq!(after.error_code.as_deref(), Some("assistant_not_found"));
    }

    #[tokio::test]
    async fn abort_hook_is_safe_on_terminal_run() {
        let (worker, lifecycle, run_id, _assistant_id) = build_worker(AgentProfile::Reactive).await;
        run_agent(&worker, run_id).await;
        on_agent_job_abort(&worker, run_id).await.unwrap();

        let run = lifecycle.get_run(run_id, None).await.unwrap().unwrap();
        // fail_run is idempotent: the original COMPLETED status wins.
        assert_eq!(run.status, RunStatus::Completed);
    }
}
