//! Built-in tool registration (spec §4.3 "Registration") and the trait
//! seams for collaborators outside this crate's scope: retrieval, web
//! search, calendar, email persistence and the cross-assistant directory
//! used by delegation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use runfabric_providers::{CompletionOptions, ProviderRegistry};
use runfabric_types::{
    AgentProfile, Assistant, Citation, RetrievedChunk, ToolCategory, ToolDefinition, ToolResult, WebSearchResult,
};

use crate::dispatch::{ToolCallContext, ToolHandler};
use crate::registry::ToolRegistry;

#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        tenant_id: Uuid,
        collection_ids: &[Uuid],
        top_k: usize,
    ) -> anyhow::Result<Vec<RetrievedChunk>>;
}

#[async_trait]
pub trait WebSearchBackend: Send + Sync {
    async fn search(&self, query: &str, tenant_id: Uuid) -> anyhow::Result<Vec<WebSearchResult>>;
}

#[async_trait]
pub trait CalendarBackend: Send + Sync {
    async fn dispatch(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        tenant_id: Uuid,
        user_context: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
pub trait EmailDraftSink: Send + Sync {
    async fn suggest_email(
        &self,
        args: serde_json::Value,
        tenant_id: Uuid,
        conversation_id: Option<Uuid>,
        citations: &[Citation],
    ) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn create_document(
        &self,
        args: serde_json::Value,
        tenant_id: Uuid,
        assistant_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        citations: &[Citation],
    ) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
pub trait AssistantDirectory: Send + Sync {
    async fn get_assistant(&self, assistant_id: Uuid) -> anyhow::Result<Option<Assistant>>;
}

/// CRM seam for the contact tools (spec.md §4.3 names "contact tools" in
/// the registration list; `contact_tools.py` supplies the concrete pair).
/// The CRUD service itself is out of scope — this is just the dispatch
/// target for `create_contact`/`search_contacts`.
#[async_trait]
pub trait ContactService: Send + Sync {
    async fn create_contact(&self, args: serde_json::Value, tenant_id: Uuid) -> anyhow::Result<serde_json::Value>;

    async fn search_contacts(&self, query: &str, tenant_id: Uuid, limit: usize) -> anyhow::Result<serde_json::Value>;
}

/// Delegation's per-profile caps (spec §4.3 "Delegation budget caps").
/// Reactive and any unrecognized profile get the zero cap, which rejects
/// delegation outright.
#[derive(Debug, Clone, Copy)]
pub struct DelegationCap {
    pub max_delegations: u32,
    pub max_tokens_per: u64,
}

fn profile_str(profile: AgentProfile) -> &'static str {
    match profile {
        AgentProfile::Reactive => "reactive",
        AgentProfile::Balanced => "balanced",
        AgentProfile::Pro => "pro",
        AgentProfile::Exec => "exec",
    }
}

pub fn delegation_budget_cap(profile: AgentProfile) -> DelegationCap {
    match profile {
        AgentProfile::Balanced => DelegationCap { max_delegations: 1, max_tokens_per: 800 },
        AgentProfile::Pro | AgentProfile::Exec => DelegationCap { max_delegations: 2, max_tokens_per: 1200 },
        AgentProfile::Reactive => DelegationCap { max_delegations: 0, max_tokens_per: 0 },
    }
}

fn block_tool(name: &str, description: &str, block_type: &str, params: serde_json::Value) -> ToolDefinition {
    ToolDefinition::new(name, ToolCategory::Block, description, params, AgentProfile::Reactive)
        .with_block_type(block_type)
}

struct RetrievalHandler(Arc<dyn RetrievalBackend>);

#[async_trait]
impl ToolHandler for RetrievalHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        let query = ctx.arguments.get("query").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let chunks = self.0.retrieve(&query, ctx.tenant_id, &ctx.collection_ids, 10).await?;
        Ok(ToolResult::Chunks { chunks })
    }
}

struct WebSearchHandler(Arc<dyn WebSearchBackend>);

#[async_trait]
impl ToolHandler for WebSearchHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        let query = ctx.arguments.get("query").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let results = self.0.search(&query, ctx.tenant_id).await?;
        let formatted = format_web_results_for_llm(&results);
        Ok(ToolResult::WebSearch { formatted, results })
    }
}

/// Matches `format_web_results_for_llm` in the original: numbered source
/// blocks separated by a rule, or a fixed "no results" sentence.
pub fn format_web_results_for_llm(results: &[WebSearchResult]) -> String {
    if results.is_empty() {
        return "Aucun résultat web trouvé.".to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[Source web {}: {}]\n{}\n{}\nURL: {}", i + 1, r.url, r.title, r.snippet, r.url))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

struct CalendarHandler {
    tool_name: String,
    backend: Arc<dyn CalendarBackend>,
}

#[async_trait]
impl ToolHandler for CalendarHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        let payload = self
            .backend
            .dispatch(&self.tool_name, ctx.arguments.clone(), ctx.tenant_id, &ctx.user_context)
            .await?;
        Ok(ToolResult::Calendar { payload })
    }
}

struct EmailHandler(Arc<dyn EmailDraftSink>);

#[async_trait]
impl ToolHandler for EmailHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        let payload = self
            .0
            .suggest_email(ctx.arguments.clone(), ctx.tenant_id, ctx.conversation_id, &ctx.citations)
            .await?;
        Ok(ToolResult::Block { block_type: "email_draft".to_string(), payload })
    }
}

struct DocumentHandler(Arc<dyn DocumentSink>);

#[async_trait]
impl ToolHandler for DocumentHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        let payload = self
            .0
            .create_document(ctx.arguments.clone(), ctx.tenant_id, ctx.assistant_id, ctx.conversation_id, &ctx.citations)
            .await?;
        Ok(ToolResult::Block { block_type: "document".to_string(), payload })
    }
}

struct CreateContactHandler(Arc<dyn ContactService>);

#[async_trait]
impl ToolHandler for CreateContactHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        let payload = self.0.create_contact(ctx.arguments.clone(), ctx.tenant_id).await?;
        Ok(ToolResult::Calendar { payload })
    }
}

struct SearchContactsHandler(Arc<dyn ContactService>);

#[async_trait]
impl ToolHandler for SearchContactsHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        let query = ctx.arguments.get("query").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let limit = ctx.arguments.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let payload = self.0.search_contacts(&query, ctx.tenant_id, limit).await?;
        Ok(ToolResult::Calendar { payload })
    }
}

/// Delegation handler (spec §4.3 "Delegation"): reserves `max_tokens_per`
/// on the parent budget, retrieves against the target assistant's
/// collections, synthesizes a short answer, consumes the actual tokens
/// used from the reservation, and releases the remainder unconditionally.
struct DelegationHandler {
    directory: Arc<dyn AssistantDirectory>,
    retrieval: Arc<dyn RetrievalBackend>,
    providers: Arc<ProviderRegistry>,
}

#[async_trait]
impl ToolHandler for DelegationHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        let cap = delegation_budget_cap(ctx.profile);
        if cap.max_delegations == 0 {
            return Ok(ToolResult::Error {
                message: format!("Profile '{}' does not support delegation", profile_str(ctx.profile)),
            });
        }

        let target_id = match ctx
            .arguments
            .get("target_assistant_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            Some(id) => id,
            None => return Ok(ToolResult::Error { message: "Missing or invalid target_assistant_id".to_string() }),
        };
        let query = match ctx.arguments.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => return Ok(ToolResult::Error { message: "Missing query".to_string() }),
        };

        let reservation = {
            let Some(budget) = ctx.budget.as_deref_mut() else {
                return Ok(ToolResult::Error { message: "Delegation requires a budget".to_string() });
            };
            match budget.reserve(format!("delegate_{}", &target_id.simple().to_string()[..8]), cap.max_tokens_per) {
                Ok(handle) => handle,
                Err(err) => return Ok(ToolResult::Error { message: err.to_string() }),
            }
        };

        // From here on every exit path must release the reservation, the
        // way the Python original's `finally:` block does.
        let outcome = self.run_delegation(&target_id, &query, ctx).await;

        let consumed = match &outcome {
            Ok((_, tokens_used)) => *tokens_used,
            Err(_) => 0,
        };
        if let Some(budget) = ctx.budget.as_deref_mut() {
            let remaining = budget.reservation_remaining(&reservation).unwrap_or(0);
            let consume_amount = consumed.min(remaining);
            let _ = budget.reservation_consume(&reservation, consume_amount);
            let _ = budget.release(reservation);
        }

        match outcome {
            Ok((result, _)) => Ok(result),
            Err(message) => Ok(ToolResult::Error { message }),
        }
    }
}

impl DelegationHandler {
    async fn run_delegation(
        &self,
        target_id: &Uuid,
        query: &str,
        ctx: &ToolCallContext<'_>,
    ) -> Result<(ToolResult, u64), String> {
        let assistant = self
            .directory
            .get_assistant(*target_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "Target assistant not found".to_string())?;

        if assistant.collections.is_empty() {
            return Err("Target assistant has no collections".to_string());
        }

        let chunks = self
            .retrieval
            .retrieve(query, ctx.tenant_id, &assistant.collections, 5)
            .await
            .map_err(|e| e.to_string())?;

        if chunks.is_empty() {
            return Ok((
                ToolResult::Delegation {
                    assistant_name: assistant.name.clone(),
                    answer: "Aucune information pertinente trouvée dans les documents de cet assistant.".to_string(),
                    citations: vec![],
                },
                0,
            ));
        }

        let cap = delegation_budget_cap(ctx.profile);
        let context = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n\n");
        let messages = vec![
            runfabric_types::ChatMessage::system(format!(
                "Réponds brièvement à la question en t'appuyant uniquement sur ce contexte:\n{context}"
            )),
            runfabric_types::ChatMessage::user(query),
        ];

        let (completion, _provider_id) = self
            .providers
            .complete_for_provider(
                None,
                &messages,
                CompletionOptions {
                    max_tokens: Some(cap.max_tokens_per),
                    temperature: Some(0.2),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| e.to_string())?;

        let tokens_used = completion.usage.map(|u| u.total_tokens).unwrap_or(0);
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

        Ok((
            ToolResult::Delegation {
                assistant_name: assistant.name,
                answer: completion.text,
                citations,
            },
            tokens_used,
        ))
    }
}

/// One INTEGRATION tool per connected provider (spec §4.3 "Registration").
/// Each is a thin passthrough; real side effects live behind
/// `CalendarBackend`/`EmailDraftSink`-style traits for the providers that
/// need richer behavior. A bare integration tool just reports the
/// provider id back as its own payload, matching the registry's intent
/// that these exist mainly to gate loop re-entry on a connected provider.
struct IntegrationPassthroughHandler {
    provider: String,
}

#[async_trait]
impl ToolHandler for IntegrationPassthroughHandler {
    async fn call(&self, ctx: &mut ToolCallContext<'_>) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::Calendar {
            payload: serde_json::json!({ "provider": self.provider, "args": ctx.arguments }),
        })
    }
}

#[allow(clippy::too_many_arguments)]
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    retrieval: Arc<dyn RetrievalBackend>,
    web_search: Option<Arc<dyn WebSearchBackend>>,
    calendar: Option<Arc<dyn CalendarBackend>>,
    email: Option<Arc<dyn EmailDraftSink>>,
    document: Option<Arc<dyn DocumentSink>>,
    contacts: Option<Arc<dyn ContactService>>,
    directory: Option<Arc<dyn AssistantDirectory>>,
    providers: Option<Arc<ProviderRegistry>>,
    connected_integration_providers: &[String],
) {
    register_block_tools(registry);

    if let Some(sink) = email {
        registry.register(
            ToolDefinition::new(
                "suggestEmail",
                ToolCategory::Email,
                "Suggère un brouillon d'email prêt à envoyer",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "subject": {"type": "string"},
                        "body_draft": {"type": "string"},
                        "tone": {"type": "string", "enum": ["formal", "friendly", "neutral"]},
                        "reason": {"type": "string"},
                    },
                    "required": ["subject", "body_draft", "tone", "reason"],
                    "additionalProperties": false,
                }),
                AgentProfile::Reactive,
            )
            .with_timeout(15),
            Some(Arc::new(EmailHandler(sink))),
        );
    }

    if let Some(sink) = document {
        registry.register(
            ToolDefinition::new(
                "createDocument",
                ToolCategory::Block,
                "Crée un document structuré à partir de la réponse",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "content": {"type": "string"},
                    },
                    "required": ["title", "content"],
                }),
                AgentProfile::Balanced,
            )
            .with_block_type("document")
            .with_timeout(20),
            Some(Arc::new(DocumentHandler(sink))),
        );
    }

    registry.register(
        ToolDefinition::new(
            "search_documents",
            ToolCategory::Retrieval,
            "Recherche dans les documents de l'assistant",
            serde_json::json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"],
            }),
            AgentProfile::Reactive,
        )
        .with_timeout(30),
        Some(Arc::new(RetrievalHandler(retrieval.clone()))),
    );

    if let Some(backend) = web_search {
        registry.register(
            ToolDefinition::new(
                "search_web",
                ToolCategory::Retrieval,
                "Recherche des informations récentes sur le web",
                serde_json::json!({
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"],
                }),
                AgentProfile::Balanced,
            )
            .with_timeout(15),
            Some(Arc::new(WebSearchHandler(backend))),
        );
    }

    if let Some(backend) = calendar {
        register_calendar_tools(registry, backend);
    }

    if let Some(service) = contacts {
        register_contact_tools(registry, service);
    }

    if let (Some(dir), Some(providers)) = (directory, providers) {
        registry.register(
            ToolDefinition::new(
                "delegate_to_assistant",
                ToolCategory::Delegation,
                "Délègue une question à un autre assistant spécialisé",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "target_assistant_id": {"type": "string"},
                        "query": {"type": "string"},
                        "context": {"type": "string"},
                        "expected_output": {"type": "string"},
                    },
                    "required": ["target_assistant_id", "query"],
                }),
                AgentProfile::Balanced,
            )
            .with_timeout(60),
            Some(Arc::new(DelegationHandler { directory: dir, retrieval, providers })),
        );
    }

    for provider_id in connected_integration_providers {
        registry.register(
            ToolDefinition::new(
                format!("integration_{provider_id}"),
                ToolCategory::Integration,
                format!("Appelle l'intégration connectée '{provider_id}'"),
                serde_json::json!({"type": "object", "properties": {}}),
                AgentProfile::Balanced,
            )
            .with_provider(provider_id.clone())
            .with_timeout(20),
            Some(Arc::new(IntegrationPassthroughHandler { provider: provider_id.clone() })),
        );
    }
}

fn register_block_tools(registry: &mut ToolRegistry) {
    registry.register(
        block_tool(
            "kpi_cards",
            "Affiche une série d'indicateurs clés",
            "kpi_cards",
            serde_json::json!({"type": "object", "properties": {"cards": {"type": "array"}}}),
        ),
        None,
    );
    registry.register(
        block_tool(
            "table",
            "Affiche des données tabulaires",
            "table",
            serde_json::json!({"type": "object", "properties": {"columns": {"type": "array"}, "rows": {"type": "array"}}}),
        ),
        None,
    );
    registry.register(
        block_tool(
            "steps",
            "Affiche une séquence d'étapes",
            "steps",
            serde_json::json!({"type": "object", "properties": {"steps": {"type": "array"}}}),
        ),
        None,
    );
    registry.register(
        block_tool(
            "callout",
            "Affiche un encart de mise en avant",
            "callout",
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}, "tone": {"type": "string"}}}),
        ),
        None,
    );
}

/// `create_contact` / `search_contacts` (spec.md §4.3's "contact tools",
/// `original_source/app/core/tools/contact_tools.py`'s `register_contact_tools`).
/// Registered as INTEGRATION since the CRM backend itself is out of scope.
fn register_contact_tools(registry: &mut ToolRegistry, service: Arc<dyn ContactService>) {
    registry.register(
        ToolDefinition::new(
            "create_contact",
            ToolCategory::Integration,
            "Crée un nouveau contact dans le CRM",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "email": {"type": "string"},
                    "first_name": {"type": "string"},
                    "last_name": {"type": "string"},
                    "phone": {"type": "string"},
                    "company_name": {"type": "string"},
                },
                "required": ["email"],
            }),
            AgentProfile::Balanced,
        )
        .with_timeout(20),
        Some(Arc::new(CreateContactHandler(service.clone()))),
    );
    registry.register(
        ToolDefinition::new(
            "search_contacts",
            ToolCategory::Integration,
            "Recherche des contacts par nom, email ou entreprise",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "default": 5},
                },
                "required": ["query"],
            }),
            AgentProfile::Reactive,
        )
        .with_timeout(15),
        Some(Arc::new(SearchContactsHandler(service))),
    );
}

fn register_calendar_tools(registry: &mut ToolRegistry, backend: Arc<dyn CalendarBackend>) {
    let tools = [
        ("calendar_parse_command", "Interprète une commande calendrier en langage naturel"),
        ("calendar_execute_command", "Exécute une commande calendrier préalablement interprétée"),
        ("calendar_list_events", "Liste les événements à venir"),
        ("calendar_find_events", "Recherche des événements par critère"),
    ];
    for (name, description) in tools {
        registry.register(
            ToolDefinition::new(
                name,
                ToolCategory::Calendar,
                description,
                serde_json::json!({"type": "object", "properties": {}}),
                AgentProfile::Balanced,
            )
            .with_timeout(20),
            Some(Arc::new(CalendarHandler { tool_name: name.to_string(), backend: backend.clone() })),
        );
    }
}
