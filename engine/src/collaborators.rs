//! File-backed stand-ins for the collaborators `run_agent` needs but this
//! core does not own (spec §1 Non-goals): assistant storage, chat history,
//! usage billing and retrieval. A real deployment replaces these with its
//! own services; this binary just needs something behind the seams to run
//! standalone.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use runfabric_tools::{AssistantDirectory, RetrievalBackend};
use runfabric_types::{Assistant, ChatMessage, RetrievedChunk};
use runfabric_worker::{ChatSink, ConversationHistory, UsageRecorder};

/// Loads `assistants.json` (an array of [`Assistant`]) once at startup and
/// serves it from memory. Assistant configuration is owned by an external
/// service per spec §4.6 step 4 — this just gives the CLI something to
/// read that config from.
pub struct FileAssistantDirectory {
    by_id: std::collections::HashMap<Uuid, Assistant>,
}

impl FileAssistantDirectory {
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let assistants: Vec<Assistant> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "no assistants.json found; directory starts empty");
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            by_id: assistants.into_iter().map(|a| (a.id, a)).collect(),
        })
    }
}

#[async_trait]
impl AssistantDirectory for FileAssistantDirectory {
    async fn get_assistant(&self, assistant_id: Uuid) -> anyhow::Result<Option<Assistant>> {
        Ok(self.by_id.get(&assistant_id).cloned())
    }
}

fn transcript_path(dir: &Path, conversation_id: Uuid) -> PathBuf {
    dir.join(format!("{conversation_id}.jsonl"))
}

/// Loads the last `limit` messages of a conversation's transcript (spec
/// §4.6 step 7).
pub struct FileConversationHistory {
    dir: PathBuf,
}

impl FileConversationHistory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl ConversationHistory for FileConversationHistory {
    async fn load_history(&self, conversation_id: Uuid, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
        let path = transcript_path(&self.dir, conversation_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let tail = lines.iter().rev().take(limit).rev();
        tail.map(|line| Ok(serde_json::from_str(line)?)).collect()
    }
}

/// Appends the assistant's turn to the same per-conversation transcript
/// `FileConversationHistory` reads from (spec §4.6 step 12).
pub struct FileChatSink {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl FileChatSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, lock: RwLock::new(()) }
    }
}

#[async_trait]
impl ChatSink for FileChatSink {
    async fn persist_assistant_message(
        &self,
        conversation_id: Uuid,
        _run_id: Uuid,
        content: String,
        _citations: Vec<serde_json::Value>,
        _blocks: Vec<serde_json::Value>,
        _tokens_output: u64,
    ) -> anyhow::Result<()> {
        let _guard = self.lock.write().await;
        fs::create_dir_all(&self.dir).await?;
        let path = transcript_path(&self.dir, conversation_id);
        let message = ChatMessage::assistant(Some(content), Vec::new());
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, line.as_bytes()).await?;
        Ok(())
    }
}

/// Usage billing is owned by an external service per spec §1; this binary
/// just logs what it would have recorded.
pub struct LoggingUsageRecorder;

#[async_trait]
impl UsageRecorder for LoggingUsageRecorder {
    async fn record_chat_usage(&self, tenant_id: Uuid, tokens_input: u64, tokens_output: u64) -> anyhow::Result<()> {
        tracing::info!(%tenant_id, tokens_input, tokens_output, "chat_usage");
        Ok(())
    }
}

/// Retrieval is an out-of-scope external collaborator (spec §1); this
/// binary runs with an always-empty retrieval backend so `search_documents`
/// is wired up and dispatchable without a vector store behind it.
pub struct NoRetrieval;

#[async_trait]
impl RetrievalBackend for NoRetrieval {
    async fn retrieve(
        &self,
        _query: &str,
        _tenant_id: Uuid,
        _collection_ids: &[Uuid],
        _top_k: usize,
    ) -> anyhow::Result<Vec<RetrievedChunk>> {
        Ok(Vec::new())
    }
}

