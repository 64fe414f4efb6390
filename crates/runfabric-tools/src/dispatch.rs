use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use runfabric_budget::BudgetManager;
use runfabric_types::{AgentProfile, Citation, ToolCategory, ToolExecutionResult, ToolResult};

use crate::registry::ToolRegistry;

/// Per-call context built from the agent loop's `AgentContext` plus the
/// tool call's raw arguments (spec §4.3 "Kwargs by category" table). A
/// single struct replaces the Python original's per-category kwargs
/// builder: handlers simply read the fields they need.
pub struct ToolCallContext<'a> {
    pub arguments: serde_json::Value,
    pub tenant_id: Uuid,
    pub assistant_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub collection_ids: Vec<Uuid>,
    pub citations: Vec<Citation>,
    pub profile: AgentProfile,
    pub budget: Option<&'a mut BudgetManager>,
    pub user_context: HashMap<String, serde_json::Value>,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult>;
}

fn block_envelope(tool_name: &str, block_type: &str, payload: &serde_json::Value) -> serde_json::Value {
    let id = payload.get("id").and_then(|v| v.as_str()).unwrap_or(tool_name);
    serde_json::json!({ "id": id, "type": block_type, "payload": payload })
}

/// Routes a parsed tool call to its handler (spec §4.3 "Executor").
///
/// `arguments` is the already-parsed JSON object the loop decoded from the
/// LLM's `tool_calls[].function.arguments` string (invalid JSON becomes
/// `{}` at the call site, per spec §4.4 step 3.g).
pub async fn execute_tool_call(
    registry: &ToolRegistry,
    tool_name: &str,
    mut ctx: ToolCallContext<'_>,
) -> ToolExecutionResult {
    let Some(definition) = registry.get(tool_name) else {
        return ToolExecutionResult::fail(tool_name, ToolCategory::Block, format!("Unknown tool: {tool_name}"));
    };
    let category = definition.category;
    let timeout_seconds = definition.timeout_seconds;

    let Some(handler) = registry.get_handler(tool_name) else {
        if category == ToolCategory::Block {
            let block_type = definition.block_type.clone().unwrap_or_else(|| tool_name.to_string());
            let block = block_envelope(tool_name, &block_type, &ctx.arguments);
            return ToolExecutionResult::ok(
                tool_name,
                category,
                ToolResult::Block { block_type, payload: ctx.arguments },
                Some(block),
            );
        }
        return ToolExecutionResult::fail(tool_name, category, format!("No handler registered for tool: {tool_name}"));
    };

    let deadline = Duration::from_secs(timeout_seconds);
    match tokio::time::timeout(deadline, handler.call(&mut ctx)).await {
        Ok(Ok(result)) => {
            let block = match &result {
                ToolResult::Block { block_type, payload } => Some(block_envelope(tool_name, block_type, payload)),
                _ => None,
            };
            ToolExecutionResult::ok(tool_name, category, result, block)
        }
        Ok(Err(err)) => ToolExecutionResult::fail(tool_name, category, err.to_string()),
        Err(_) => ToolExecutionResult::fail(tool_name, category, format!("Tool timed out after {timeout_seconds}s")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runfabric_types::{RetrievedChunk, ToolDefinition};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    struct SleepyHandler(StdDuration);

    #[async_trait]
    impl ToolHandler for SleepyHandler {
        async fn call(&self, _ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
            tokio::time::sleep(self.0).await;
            Ok(ToolResult::Chunks { chunks: vec![] })
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl ToolHandler for FailingHandler {
        async fn call(&self, _ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
            anyhow::bail!("boom")
        }
    }

    fn ctx() -> ToolCallContext<'static> {
        ToolCallContext {
            arguments: serde_json::json!({}),
            tenant_id: Uuid::nil(),
            assistant_id: None,
            conversation_id: None,
            collection_ids: vec![],
            citations: vec![],
            profile: AgentProfile::Reactive,
            budget: None,
            user_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let result = execute_tool_call(&registry, "nope", ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unknown tool: nope"));
    }

    #[tokio::test]
    async fn block_tool_without_handler_synthesizes_block() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDefinition::new("kpi_cards", ToolCategory::Block, "kpi", serde_json::json!({}), AgentProfile::Reactive)
                .with_block_type("kpi_cards"),
            None,
        );
        let mut call_ctx = ctx();
        call_ctx.arguments = serde_json::json!({"id": "abc", "value": 42});
        let result = execute_tool_call(&registry, "kpi_cards", call_ctx).await;
        assert!(result.success);
        let block = result.block.expect("block payload");
        assert_eq!(block["type"], "kpi_cards");
        assert_eq!(block["id"], "abc");
    }

    #[tokio::test]
    async fn non_block_tool_without_handler_errors() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDefinition::new("search_documents", ToolCategory::Retrieval, "rag", serde_json::json!({}), AgentProfile::Reactive),
            None,
        );
        let result = execute_tool_call(&registry, "search_documents", ctx()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No handler registered"));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDefinition::new("slow", ToolCategory::Retrieval, "slow", serde_json::json!({}), AgentProfile::Reactive)
                .with_timeout(1),
            Some(Arc::new(SleepyHandler(StdDuration::from_secs(10)))),
        );
        let start = std::time::Instant::now();
        let result = execute_tool_call(&registry, "slow", ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Tool timed out after 1s"));
        assert!(start.elapsed() < StdDuration::from_millis(1500));
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_failure_not_panic() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDefinition::new("boom", ToolCategory::Retrieval, "boom", serde_json::json!({}), AgentProfile::Reactive),
            Some(Arc::new(FailingHandler)),
        );
        let result = execute_tool_call(&registry, "boom", ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn successful_retrieval_handler_returns_chunks() {
        struct Returns(Vec<RetrievedChunk>);
        #[async_trait]
        impl ToolHandler for Returns {
            async fn call(&self, _ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
                Ok(ToolResult::Chunks { chunks: self.0.clone() })
            }
        }
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDefinition::new("search_documents", ToolCategory::Retrieval, "rag", serde_json::json!({}), AgentProfile::Reactive),
            Some(Arc::new(Returns(vec![]))),
        );
        let result = execute_tool_call(&registry, "search_documents", ctx()).await;
        assert!(result.success);
        assert!(matches!(result.result, Some(ToolResult::Chunks { .. })));
    }
}
