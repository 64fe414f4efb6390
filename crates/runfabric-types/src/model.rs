use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Execution mode. Ordering matters: it gates tool visibility and sets
/// default budgets and loop depth.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentProfile {
    Reactive,
    Balanced,
    Pro,
    Exec,
}

impl AgentProfile {
    /// `reactive(0) < balanced(1) < pro(2) < exec(3)`, used for both tool
    /// gating and the default-budget table.
    pub fn order(self) -> u8 {
        match self {
            AgentProfile::Reactive => 0,
            AgentProfile::Balanced => 1,
            AgentProfile::Pro => 2,
            AgentProfile::Exec => 3,
        }
    }

    pub fn default_budget_tokens(self) -> u64 {
        match self {
            AgentProfile::Reactive => 8_000,
            AgentProfile::Balanced => 30_000,
            AgentProfile::Pro => 80_000,
            AgentProfile::Exec => 200_000,
        }
    }

    pub fn max_tool_rounds(self) -> u32 {
        match self {
            AgentProfile::Reactive => 1,
            AgentProfile::Balanced => 3,
            AgentProfile::Pro => 5,
            AgentProfile::Exec => 5,
        }
    }

    /// Unknown profile strings fall back to reactive rather than erroring.
    pub fn parse_or_reactive(s: &str) -> Self {
        match s {
            "balanced" => AgentProfile::Balanced,
            "pro" => AgentProfile::Pro,
            "exec" => AgentProfile::Exec,
            _ => AgentProfile::Reactive,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted | RunStatus::TimedOut
        )
    }

    /// Enforces the monotonic state machine from the data model: PENDING ->
    /// RUNNING -> exactly one terminal state, never terminal -> terminal.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed | Failed | Aborted | TimedOut) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub assistant_id: Uuid,
    pub conversation_id: Uuid,
    pub profile: AgentProfile,
    pub status: RunStatus,
    pub input_text: String,
    pub output_text: Option<String>,
    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
    pub tool_rounds: Option<u32>,
    pub budget_tokens: Option<u64>,
    pub budget_tokens_remaining: Option<u64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        tenant_id: Uuid,
        assistant_id: Uuid,
        conversation_id: Uuid,
        input_text: impl Into<String>,
        profile: AgentProfile,
        budget_tokens: Option<u64>,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            assistant_id,
            conversation_id,
            profile,
            status: RunStatus::Pending,
            input_text: input_text.into(),
            output_text: None,
            tokens_input: None,
            tokens_output: None,
            tool_rounds: None,
            budget_tokens,
            budget_tokens_remaining: budget_tokens,
            error_code: None,
            error_message: None,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
            started_at: None,
            completed_at: None,
            created_at: now,
        }
    }
}

/// Agent configuration. Read-only in this core; owned by an external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub system_prompt: String,
    pub agent_profile: AgentProfile,
    pub collections: Vec<Uuid>,
    pub integrations: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub detail: serde_json::Value,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMTrace {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: Option<u64>,
    pub status: TraceStatus,
    pub error_message: Option<String>,
    pub request_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LLMTrace {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: Option<Uuid>,
        run_id: Option<Uuid>,
        model: impl Into<String>,
        provider: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        latency_ms: Option<u64>,
        status: TraceStatus,
        error_message: Option<String>,
        request_metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            run_id,
            model: model.into(),
            provider: provider.into(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            latency_ms,
            status,
            error_message,
            request_metadata,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// 8-character opaque id, unique within a Plan.
    pub id: String,
    pub action: String,
    pub description: String,
    pub tool: Option<String>,
    pub status: PlanStepStatus,
    pub result_summary: Option<String>,
}

impl PlanStep {
    pub fn new(action: impl Into<String>, description: impl Into<String>, tool: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            action: action.into(),
            description: description.into(),
            tool,
            status: PlanStepStatus::Pending,
            result_summary: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub reasoning: String,
    pub profile: AgentProfile,
}

impl Plan {
    /// The fixed fallback plan used when planning fails to parse or the LLM
    /// call itself fails.
    pub fn default_for(profile: AgentProfile) -> Self {
        Self {
            steps: vec![
                PlanStep::new("search_documents", "Look up relevant context", Some("search_documents".into())),
                PlanStep::new("synthesize", "Draft the answer", None),
                PlanStep::new("ensure_source_coverage", "Verify claims are sourced", None),
            ],
            reasoning: "default plan (planning unavailable)".to_string(),
            profile,
        }
    }

    /// Marks the first non-terminal step as completed; used by the loop at
    /// the end of a round.
    pub fn complete_next_step(&mut self) {
        if let Some(step) = self
            .steps
            .iter_mut()
            .find(|s| matches!(s.status, PlanStepStatus::Pending | PlanStepStatus::Running))
        {
            step.status = PlanStepStatus::Completed;
        }
    }
}

/// In-memory per-run state built at loop entry and discarded at loop exit.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub tenant_id: Uuid,
    pub assistant_id: Uuid,
    pub conversation_id: Uuid,
    pub message: String,
    pub system_prompt: String,
    pub history: Vec<crate::provider::ChatMessage>,
    pub collection_ids: Vec<Uuid>,
    pub integrations: Vec<String>,
    pub profile: AgentProfile,
    pub plan: Option<Plan>,
    pub allowed_tools: Vec<String>,
    pub user_context: HashMap<String, serde_json::Value>,
}
