//! End-to-end scenarios driving `run_agent` against a scripted LLM
//! provider and in-memory collaborators, covering the reactive,
//! retrieval-round, budget-exhaustion and abort scenarios.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use runfabric_eventstream::InMemoryLogStore;
use runfabric_providers::{CompletionOptions, CompletionResult, Provider, ProviderRegistry};
use runfabric_store::{MemoryStorage, RunLifecycle};
use runfabric_tools::{register_builtin_tools, AssistantDirectory, RetrievalBackend, ToolRegistry};
use runfabric_types::{
    AgentProfile, Assistant, ChatMessage, FunctionSchema, ModelInfo, ProviderInfo, RetrievedChunk, RunStatus,
    StreamChunk, TokenUsage,
};
use runfabric_worker::{on_agent_job_abort, run_agent, ChatSink, ConversationHistory, RuntimeConfig, UsageRecorder, Worker};

struct ScriptedProvider {
    rounds: Mutex<VecDeque<Vec<StreamChunk>>>,
    captured: Mutex<Vec<(Vec<ChatMessage>, Option<Vec<FunctionSchema>>)>>,
}

impl ScriptedProvider {
    fn new(rounds: Vec<Vec<StreamChunk>>) -> Self {
        Self { rounds: Mutex::new(rounds.into()), captured: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "fake".to_string(),
            name: "Fake".to_string(),
            models: vec![ModelInfo {
                id: "fake-model".to_string(),
                provider_id: "fake".to_string(),
                display_name: "Fake Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn complete(&self, _messages: &[ChatMessage], _opts: CompletionOptions) -> anyhow::Result<CompletionResult> {
        anyhow::bail!("scripted provider only supports streaming in these scenarios")
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        tools: Option<Vec<FunctionSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>> {
        self.captured.lock().unwrap().push((messages, tools));
        let chunks = self.rounds.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![StreamChunk::Done { finish_reason: Some("stop".to_string()), usage: None }]
        });
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

struct FixedDirectory(Assistant);

#[async_trait]
impl AssistantDirectory for FixedDirectory {
    async fn get_assistant(&self, assistant_id: Uuid) -> anyhow::Result<Option<Assistant>> {
        if assistant_id == self.0.id { Ok(Some(self.0.clone())) } else { Ok(None) }
    }
}

struct NoHistory;

#[async_trait]
impl ConversationHistory for NoHistory {
    async fn load_history(&self, _conversation_id: Uuid, _limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
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

struct FixedRetrieval(Vec<RetrievedChunk>);

#[async_trait]
impl RetrievalBackend for FixedRetrieval {
    async fn retrieve(&self, _query: &str, _tenant_id: Uuid, _collection_ids: &[Uuid], _top_k: usize) -> anyhow::Result<Vec<RetrievedChunk>> {
        Ok(self.0.clone())
    }
}

fn test_assistant(id: Uuid, profile: AgentProfile) -> Assistant {
    Assistant {
        id,
        tenant_id: Uuid::new_v4(),
        name: "Test".to_string(),
        system_prompt: "Tu es un assistant de test.".to_string(),
        agent_profile: profile,
        collections: vec![],
        integrations: vec![],
    }
}

struct Harness {
    worker: Arc<Worker<InMemoryLogStore>>,
    lifecycle: Arc<RunLifecycle>,
}

async fn build_harness(
    profile: AgentProfile,
    budget_tokens: Option<u64>,
    rounds: Vec<Vec<StreamChunk>>,
    retrieval: Vec<RetrievedChunk>,
) -> (Harness, Uuid) {
    let storage = Arc::new(MemoryStorage::new());
    let lifecycle = Arc::new(RunLifecycle::new(storage));

    let tenant_id = Uuid::new_v4();
    let assistant = test_assistant(Uuid::new_v4(), profile);
    let run = lifecycle
        .create_run(tenant_id, assistant.id, Uuid::new_v4(), "bonjour", profile, budget_tokens, None)
        .await
        .unwrap();

    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, Arc::new(FixedRetrieval(retrieval)), None, None, None, None, None, None, None, &[]);

    let providers = ProviderRegistry::with_providers(vec![Arc::new(ScriptedProvider::new(rounds))], Some("fake".to_string()));

    let worker = Arc::new(Worker {
        lifecycle: lifecycle.clone(),
        event_store: Arc::new(InMemoryLogStore::new()),
        tools: Arc::new(registry),
        providers: Arc::new(providers),
        assistants: Arc::new(FixedDirectory(assistant.clone())),
        history: Arc::new(NoHistory),
        chat_sink: Arc::new(RecordingChatSink::default()),
        usage: Arc::new(RecordingUsage::default()),
        config: RuntimeConfig::default(),
    });

    (Harness { worker, lifecycle }, run.id)
}

fn done_chunk(prompt_tokens: u64, completion_tokens: u64) -> StreamChunk {
    StreamChunk::Done {
        finish_reason: Some("stop".to_string()),
        usage: Some(TokenUsage { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens }),
    }
}

/// S1 — reactive answer without tool calls.
#[tokio::test]
async fn s1_reactive_answer_without_tool_calls() {
    let round = vec![
        StreamChunk::TextDelta { text: "Bonjour, ".to_string() },
        StreamChunk::TextDelta { text: "comment aider?".to_string() },
        done_chunk(20, 10),
    ];
    let (harness, run_id) = build_harness(AgentProfile::Reactive, Some(4000), vec![round], vec![]).await;

    run_agent(&harness.worker, run_id).await;

    let run = harness.lifecycle.get_run(run_id, None).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output_text.as_deref(), Some("Bonjour, comment aider?"));
    assert_eq!(run.tokens_input, Some(20));
    assert_eq!(run.tokens_output, Some(10));
    assert_eq!(run.budget_tokens_remaining, Some(4000 - 30));
}

/// S2 — balanced run with one retrieval round before the final answer.
#[tokio::test]
async fn s2_balanced_with_one_retrieval_round() {
    let document_id = Uuid::new_v4();
    let c1 = RetrievedChunk {
        chunk_id: Uuid::new_v4(),
        document_id,
        document_filename: "contract.pdf".to_string(),
        page_number: Some(1),
        text: "Le contrat X prévoit une clause de résiliation.".to_string(),
        score: 0.8,
    };
    let c2 = RetrievedChunk {
        chunk_id: Uuid::new_v4(),
        document_id,
        document_filename: "contract.pdf".to_string(),
        page_number: Some(1),
        text: "Les pénalités sont plafonnées à 10%.".to_string(),
        score: 0.6,
    };

    let round1 = vec![
        StreamChunk::ToolCallStart { index: 0, id: "call_1".to_string(), name: "search_documents".to_string() },
        StreamChunk::ToolCallDelta { index: 0, arguments_fragment: "{\"query\":\"contrat X\"}".to_string() },
        StreamChunk::ToolCallEnd { index: 0 },
        done_chunk(400, 0),
    ];
    let round2 = vec![StreamChunk::TextDelta { text: "Le contrat X prévoit…".to_string() }, done_chunk(0, 100)];

    let (harness, run_id) =
        build_harness(AgentProfile::Balanced, Some(30_000), vec![round1, round2], vec![c1.clone(), c2.clone()]).await;

    run_agent(&harness.worker, run_id).await;

    let run = harness.lifecycle.get_run(run_id, None).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output_text.as_deref(), Some("Le contrat X prévoit…"));
    assert_eq!(run.tool_rounds, Some(2));
    assert_eq!(run.tokens_input, Some(400));
    assert_eq!(run.tokens_output, Some(100));
}

/// S4 — budget exhaustion breaks the loop without an error.
#[tokio::test]
async fn s4_budget_exhaustion_ends_without_error() {
    // Rounds 1 and 2 each consume 450 tokens (900 total) of a 1000-token
    // budget; round 3's `budget.check(500)` then fails with 100 remaining
    // and the loop breaks before streaming a third round.
    let round1 = vec![
        StreamChunk::ToolCallStart { index: 0, id: "call_1".to_string(), name: "search_documents".to_string() },
        StreamChunk::ToolCallDelta { index: 0, arguments_fragment: "{\"query\":\"a\"}".to_string() },
        done_chunk(300, 150),
    ];
    let round2 = vec![
        StreamChunk::ToolCallStart { index: 0, id: "call_2".to_string(), name: "search_documents".to_string() },
        StreamChunk::ToolCallDelta { index: 0, arguments_fragment: "{\"query\":\"b\"}".to_string() },
        done_chunk(300, 150),
    ];

    let (harness, run_id) =
        build_harness(AgentProfile::Pro, Some(1000), vec![round1, round2], vec![]).await;

    run_agent(&harness.worker, run_id).await;

    let run = harness.lifecycle.get_run(run_id, None).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.error_code, None);
    assert_eq!(run.tool_rounds, Some(2));
}

/// S5 — abort hook transitions a running job to FAILED with
/// `worker_aborted` and never lets a later completion override it.
#[tokio::test]
async fn s5_abort_hook_marks_run_failed() {
    let storage = Arc::new(MemoryStorage::new());
    let lifecycle = Arc::new(RunLifecycle::new(storage));
    let tenant_id = Uuid::new_v4();
    let assistant = test_assistant(Uuid::new_v4(), AgentProfile::Balanced);
    let run = lifecycle
        .create_run(tenant_id, assistant.id, Uuid::new_v4(), "bonjour", AgentProfile::Balanced, Some(4000), None)
        .await
        .unwrap();
    lifecycle.start_run(run.id).await.unwrap();

    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, Arc::new(FixedRetrieval(vec![])), None, None, None, None, None, None, None, &[]);

    let worker = Worker {
        lifecycle: lifecycle.clone(),
        event_store: Arc::new(InMemoryLogStore::new()),
        tools: Arc::new(registry),
        providers: Arc::new(ProviderRegistry::with_providers(vec![], None)),
        assistants: Arc::new(FixedDirectory(assistant)),
        history: Arc::new(NoHistory),
        chat_sink: Arc::new(RecordingChatSink::default()),
        usage: Arc::new(RecordingUsage::default()),
        config: RuntimeConfig::default(),
    };

    on_agent_job_abort(&worker, run.id).await.unwrap();

    let after = lifecycle.get_run(run.id, None).await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Aborted);
    assert_eq!(after.error_code.as_deref(), Some("worker_aborted"));
}

/// S6 — reactive runs retrieval before its one LLM round instead of
/// spending that round on a `search_documents` tool call: the retrieved
/// text reaches the model through the system prompt, and the tool itself
/// is not even offered.
#[tokio::test]
async fn s6_reactive_retrieves_before_the_single_round() {
    let storage = Arc::new(MemoryStorage::new());
    let lifecycle = Arc::new(RunLifecycle::new(storage));
    let tenant_id = Uuid::new_v4();
    let assistant = test_assistant(Uuid::new_v4(), AgentProfile::Reactive);
    let run = lifecycle
        .create_run(tenant_id, assistant.id, Uuid::new_v4(), "Quelle est la clause de résiliation ?", AgentProfile::Reactive, Some(4000), None)
        .await
        .unwrap();

    let mut registry = ToolRegistry::new();
    let chunk = RetrievedChunk {
        chunk_id: Uuid::new_v4(),
        document_id: Uuid::new_v4(),
        document_filename: "contract.pdf".to_string(),
        page_number: Some(1),
        text: "Le contrat X prévoit une clause de résiliation à 30 jours.".to_string(),
        score: 0.9,
    };
    register_builtin_tools(&mut registry, Arc::new(FixedRetrieval(vec![chunk])), None, None, None, None, None, None, None, &[]);

    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        StreamChunk::TextDelta { text: "La clause prévoit un préavis de 30 jours.".to_string() },
        done_chunk(50, 20),
    ]]));

    let worker = Worker {
        lifecycle: lifecycle.clone(),
        event_store: Arc::new(InMemoryLogStore::new()),
        tools: Arc::new(registry),
        providers: Arc::new(ProviderRegistry::with_providers(vec![provider.clone()], Some("fake".to_string()))),
        assistants: Arc::new(FixedDirectory(assistant)),
        history: Arc::new(NoHistory),
        chat_sink: Arc::new(RecordingChatSink::default()),
        usage: Arc::new(RecordingUsage::default()),
        config: RuntimeConfig::default(),
    };

    run_agent(&worker, run.id).await;

    let after = lifecycle.get_run(run.id, None).await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Completed);
    assert_eq!(after.output_text.as_deref(), Some("La clause prévoit un préavis de 30 jours."));
    assert_eq!(after.tool_rounds, Some(1));

    let captured = provider.captured.lock().unwrap();
    assert_eq!(captured.len(), 1, "reactive should only call the LLM once, not once to retrieve and once to answer");
    let (messages, tools) = &captured[0];
    let system = messages.iter().find(|m| matches!(m.role, runfabric_types::ChatRole::System)).unwrap();
    assert!(system.content.as_deref().unwrap_or_default().contains("clause de résiliation à 30 jours"));
    let offered_names: Vec<&str> = tools.iter().flatten().map(|t| t.name.as_str()).collect();
    assert!(!offered_names.contains(&"search_documents"), "retrieval already ran, the model shouldn't be offered the tool again");
}
