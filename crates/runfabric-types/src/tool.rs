use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::AgentProfile;
use crate::provider::FunctionSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCategory {
    Block,
    Email,
    Retrieval,
    Calendar,
    Integration,
    Delegation,
}

impl ToolCategory {
    /// Whether a successful call in this category re-enters the LLM loop.
    pub fn continues_loop(self) -> bool {
        !matches!(self, ToolCategory::Block | ToolCategory::Email)
    }
}

/// A registry entry. Registered once at process start; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub category: ToolCategory,
    pub provider: Option<String>,
    pub description: String,
    pub openai_schema: FunctionSchema,
    pub block_type: Option<String>,
    pub continues_loop: bool,
    pub requires_confirmation: bool,
    pub timeout_seconds: u64,
    pub min_profile: AgentProfile,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        category: ToolCategory,
        description: impl Into<String>,
        parameters: serde_json::Value,
        min_profile: AgentProfile,
    ) -> Self {
        let name = name.into();
        let description = description.into();
        Self {
            openai_schema: FunctionSchema {
                name: name.clone(),
                description: description.clone(),
                parameters,
            },
            continues_loop: category.continues_loop(),
            category,
            provider: None,
            block_type: None,
            requires_confirmation: false,
            timeout_seconds: 30,
            name,
            description,
            min_profile,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_block_type(mut self, block_type: impl Into<String>) -> Self {
        self.block_type = Some(block_type.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Citation metadata attached to a retrieval or delegation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: Option<Uuid>,
    pub document_id: Option<Uuid>,
    pub document_filename: Option<String>,
    pub page_number: Option<u32>,
    pub excerpt: Option<String>,
    pub score: Option<f64>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub document_filename: String,
    pub page_number: Option<u32>,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Discriminated union over the shapes a tool handler can return. The loop
/// switches on the tag to decide both the citation/content formatting and
/// whether the call re-enters the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResult {
    Chunks { chunks: Vec<RetrievedChunk> },
    WebSearch { formatted: String, results: Vec<WebSearchResult> },
    Block { block_type: String, payload: serde_json::Value },
    Delegation {
        assistant_name: String,
        answer: String,
        citations: Vec<Citation>,
    },
    Calendar { payload: serde_json::Value },
    Error { message: String },
}

impl ToolResult {
    /// Fallback serialization for categories with no special-cased
    /// tool-message formatting.
    pub fn to_tool_message(&self) -> String {
        match self {
            ToolResult::Error { message } => serde_json::json!({ "error": message }).to_string(),
            other => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub tool_name: String,
    pub category: ToolCategory,
    pub success: bool,
    pub result: Option<ToolResult>,
    pub error: Option<String>,
    /// Present when the handler (or the BLOCK-with-no-handler fallback)
    /// produced a UI block payload.
    pub block: Option<serde_json::Value>,
}

impl ToolExecutionResult {
    pub fn ok(tool_name: impl Into<String>, category: ToolCategory, result: ToolResult, block: Option<serde_json::Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            category,
            success: true,
            result: Some(result),
            error: None,
            block,
        }
    }

    pub fn fail(tool_name: impl Into<String>, category: ToolCategory, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            category,
            success: false,
            result: None,
            error: Some(error.into()),
            block: None,
        }
    }
}
