//! Run lifecycle manager (spec §4.1), grounded on
//! `original_source/app/services/run.py`'s `RunService`: one long-lived
//! struct holding an `Arc` to shared storage, methods taking `&self`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use runfabric_types::{AgentProfile, AuditLog, LLMTrace, LogLevel, Run, RunStatus, TraceStatus};

use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {run_id} cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct RunLifecycle {
    storage: Arc<dyn Storage>,
}

impl RunLifecycle {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_run(
        &self,
        tenant_id: Uuid,
        assistant_id: Uuid,
        conversation_id: Uuid,
        input_text: impl Into<String>,
        profile: AgentProfile,
        budget_tokens: Option<u64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Run, LifecycleError> {
        let run = Run::new(
            tenant_id,
            assistant_id,
            conversation_id,
            input_text,
            profile,
            budget_tokens,
            metadata,
            Utc::now(),
        );
        self.storage.put_run(run.clone()).await?;
        Ok(run)
    }

    /// PENDING → RUNNING. Fails loudly (not idempotent) if the run is not
    /// PENDING — unlike `fail_run`, a double `start_run` is a programming
    /// error, not a legitimate race.
    pub async fn start_run(&self, run_id: Uuid) -> Result<Run, LifecycleError> {
        let mut run = self.require_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(LifecycleError::InvalidTransition {
                run_id,
                from: run.status,
                to: RunStatus::Running,
            });
        }
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.storage.put_run(run.clone()).await?;
        Ok(run)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        output_text: Option<String>,
        tokens_input: Option<u64>,
        tokens_output: Option<u64>,
        tool_rounds: Option<u32>,
        budget_tokens_remaining: Option<u64>,
    ) -> Result<Run, LifecycleError> {
        let mut run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            // Resolves the §9 open question: `on_agent_job_abort` racing a
            // natural completion. Whichever terminal write lands first
            // wins; the later one is a no-op that preserves it.
            tracing::debug!(run_id = %run_id, status = ?run.status, "complete_run no-op: already terminal");
            return Ok(run);
        }
        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        if let Some(v) = output_text {
            run.output_text = Some(v);
        }
        if let Some(v) = tokens_input {
            run.tokens_input = Some(v);
        }
        if let Some(v) = tokens_output {
            run.tokens_output = Some(v);
        }
        if let Some(v) = tool_rounds {
            run.tool_rounds = Some(v);
        }
        if let Some(v) = budget_tokens_remaining {
            run.budget_tokens_remaining = Some(v);
        }
        self.storage.put_run(run.clone()).await?;
        Ok(run)
    }

    /// RUNNING → {FAILED|ABORTED|TIMEOUT}. Idempotent: a second call on an
    /// already-terminal run is a no-op rather than an error, per spec §4.1.
    pub async fn fail_run(
        &self,
        run_id: Uuid,
        error_code: impl Into<String>,
        error_message: Option<String>,
        status: RunStatus,
    ) -> Result<Run, LifecycleError> {
        debug_assert!(
            matches!(status, RunStatus::Failed | RunStatus::Aborted | RunStatus::TimedOut),
            "fail_run status must be a failure terminal"
        );
        let mut run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!(run_id = %run_id, status = ?run.status, "fail_run no-op: already terminal");
            return Ok(run);
        }
        run.status = status;
        run.error_code = Some(error_code.into());
        run.error_message = error_message;
        run.completed_at = Some(Utc::now());
        self.storage.put_run(run.clone()).await?;
        Ok(run)
    }

    pub async fn get_run(&self, run_id: Uuid, tenant_id: Option<Uuid>) -> Result<Option<Run>, LifecycleError> {
        Ok(self.storage.get_run(run_id, tenant_id).await?)
    }

    pub async fn list_runs(
        &self,
        tenant_id: Uuid,
        conversation_id: Option<Uuid>,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<Run>, LifecycleError> {
        Ok(self.storage.list_runs(tenant_id, conversation_id, status, limit).await?)
    }

    pub async fn find_stuck_runs(&self, running_since_before: DateTime<Utc>) -> Result<Vec<Run>, LifecycleError> {
        Ok(self.storage.find_stuck_runs(running_since_before).await?)
    }

    /// Audit writes never block the lifecycle: a failed insert is logged,
    /// not propagated (spec §4.1's failure semantics).
    #[allow(clippy::too_many_arguments)]
    pub async fn log_audit(
        &self,
        action: impl Into<String>,
        tenant_id: Option<Uuid>,
        run_id: Option<Uuid>,
        user_id: Option<Uuid>,
        entity_type: Option<String>,
        entity_id: Option<String>,
        detail: Option<serde_json::Value>,
        level: LogLevel,
        message: impl Into<String>,
    ) {
        let entry = AuditLog {
            id: Uuid::new_v4(),
            tenant_id,
            run_id,
            user_id,
            action: action.into(),
            entity_type,
            entity_id,
            detail: detail.unwrap_or_else(|| serde_json::json!({})),
            level,
            message: message.into(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.storage.put_audit(entry).await {
            tracing::warn!(%err, "failed to persist audit log entry");
        }
    }

    /// Same non-blocking contract as `log_audit`.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_llm_trace(
        &self,
        model: impl Into<String>,
        provider: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        latency_ms: Option<u64>,
        tenant_id: Option<Uuid>,
        run_id: Option<Uuid>,
        status: TraceStatus,
        error_message: Option<String>,
        request_metadata: Option<serde_json::Value>,
    ) {
        let trace = LLMTrace::new(
            tenant_id,
            run_id,
            model,
            provider,
            prompt_tokens,
            completion_tokens,
            latency_ms,
            status,
            error_message,
            request_metadata.unwrap_or_else(|| serde_json::json!({})),
            Utc::now(),
        );
        if let Err(err) = self.storage.put_trace(trace).await {
            tracing::warn!(%err, "failed to persist LLM trace");
        }
    }

    async fn require_run(&self, run_id: Uuid) -> Result<Run, LifecycleError> {
        self.storage
            .get_run(run_id, None)
            .await?
            .ok_or(LifecycleError::RunNotFound(run_id))
    }
}
