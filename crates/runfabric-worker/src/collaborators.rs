//! Trait seams for collaborators the worker talks to directly but does not
//! own. Retrieval, web search, calendar, email, document and the
//! assistant directory are already expressed as trait seams in
//! `runfabric_tools`; this module covers the remaining three the worker
//! itself needs for steps 7, 12 and 13 of `run_agent` (spec §4.6).

use async_trait::async_trait;
use uuid::Uuid;

use runfabric_types::ChatMessage;

/// Loads the most recent messages of a conversation for history (spec
/// §4.6 step 7).
#[async_trait]
pub trait ConversationHistory: Send + Sync {
    async fn load_history(&self, conversation_id: Uuid, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;
}

/// Persists the assistant's turn once the loop and post-pass are done
/// (spec §4.6 step 12).
#[async_trait]
pub trait ChatSink: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn persist_assistant_message(
        &self,
        conversation_id: Uuid,
        run_id: Uuid,
        content: String,
        citations: Vec<serde_json::Value>,
        blocks: Vec<serde_json::Value>,
        tokens_output: u64,
    ) -> anyhow::Result<()>;
}

/// Records chat usage for billing/quotas (spec §4.6 step 13).
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_chat_usage(&self, tenant_id: Uuid, tokens_input: u64, tokens_output: u64) -> anyhow::Result<()>;
}
