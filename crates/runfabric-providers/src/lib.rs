//! OpenAI-compatible Chat Completions transport (spec §6): provider
//! selection, env-var API key fallback, and SSE frame parsing, generalized
//! over `runfabric_types`' wire shapes instead of ad hoc provider-local ones.
//!
//! The agent loop (spec §4.4) only ever speaks to [`Provider::stream`]; the
//! planner and the delegation tool (spec §4.3) use [`Provider::complete`]
//! for their single-shot, non-streaming calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use runfabric_types::{ChatMessage, ChatRole, FunctionSchema, ModelInfo, ProviderInfo, StreamChunk, TokenUsage};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

/// Options for a single-shot, non-streaming call (spec §4.4 planner step,
/// spec §4.3 delegation synthesis).
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub model_override: Option<String>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f32>,
    /// Requests `response_format: {"type": "json_object"}` — used by the
    /// planner, which needs strict JSON back.
    pub json_mode: bool,
}

#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: CompletionOptions,
    ) -> anyhow::Result<CompletionResult>;

    /// Streaming chat completion with optional function-calling schemas
    /// (spec §4.4 step 3.b). The default implementation degrades a
    /// provider with no native streaming support to a single `complete`
    /// call re-exposed as a two-chunk stream; every provider here
    /// overrides it with real SSE parsing.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        _tools: Option<Vec<FunctionSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>> {
        let result = self
            .complete(
                &messages,
                CompletionOptions {
                    model_override: model_override.map(str::to_string),
                    ..Default::default()
                },
            )
            .await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta { text: result.text }),
            Ok(StreamChunk::Done {
                finish_reason: Some("stop".to_string()),
                usage: result.usage,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    /// Builds a registry from already-constructed providers, bypassing env
    /// var discovery. Used by callers (and tests) that need to substitute a
    /// fake `Provider` for a real HTTP-backed one.
    pub fn with_providers(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
        }
    }

    pub async fn reload(&self, config: AppConfig) {
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers.read().await.iter().map(|p| p.info()).collect()
    }

    pub async fn complete_for_provider(
        &self,
        provider_id: Option<&str>,
        messages: &[ChatMessage],
        opts: CompletionOptions,
    ) -> anyhow::Result<(CompletionResult, String)> {
        let provider = self.select_provider(provider_id).await?;
        let id = provider.info().id;
        let result = provider.complete(messages, opts).await?;
        Ok((result, id))
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<FunctionSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<(Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>, String)> {
        let provider = self.select_provider(provider_id).await?;
        let id = provider.info().id;
        let stream = provider.stream(messages, model_id, tools, cancel).await?;
        Ok((stream, id))
    }

    pub async fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_provider(config, &mut providers, "openai", "OpenAI", "https://api.openai.com/v1", "gpt-4o-mini");
    add_openai_provider(
        config,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
    );
    add_openai_provider(
        config,
        &mut providers,
        "mistral",
        "Mistral",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
    );
    add_openai_provider(
        config,
        &mut providers,
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
    );
    add_openai_provider(
        config,
        &mut providers,
        "together",
        "Together",
        "https://api.together.xyz/v1",
        "meta-llama/Llama-3.1-8B-Instruct-Turbo",
    );

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn add_openai_provider(
    config: &AppConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    providers.push(Arc::new(OpenAICompatibleProvider {
        id: id.to_string(),
        name: name.to_string(),
        base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
        api_key: entry
            .api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key))
            .map(|key| key.to_string())
            .or_else(|| env_api_key_for_provider(id)),
        default_model: entry.default_model.clone().unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("x") || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => "OPENAI_API_KEY",
        "openrouter" => "OPENROUTER_API_KEY",
        "groq" => "GROQ_API_KEY",
        "mistral" => "MISTRAL_API_KEY",
        "together" => "TOGETHER_API_KEY",
        _ => return None,
    };
    std::env::var(env_name).ok().filter(|v| !v.trim().is_empty())
}

fn provider_api_key_env_hint(id: &str) -> &'static str {
    match id {
        "openrouter" => "OPENROUTER_API_KEY",
        "openai" => "OPENAI_API_KEY",
        "groq" => "GROQ_API_KEY",
        "mistral" => "MISTRAL_API_KEY",
        "together" => "TOGETHER_API_KEY",
        _ => "provider API key",
    }
}

struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn complete(&self, messages: &[ChatMessage], _opts: CompletionOptions) -> anyhow::Result<CompletionResult> {
        let prompt = messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content.clone().unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(CompletionResult {
            text: format!("Echo: {prompt}"),
            usage: None,
        })
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn message_to_wire(m: &ChatMessage) -> serde_json::Value {
    let mut value = json!({
        "role": role_str(m.role),
        "content": m.content,
    });
    if !m.tool_calls.is_empty() {
        value["tool_calls"] = json!(m
            .tool_calls
            .iter()
            .map(|tc| json!({
                "id": tc.id,
                "type": "function",
                "function": {"name": tc.name, "arguments": tc.arguments},
            }))
            .collect::<Vec<_>>());
    }
    if let Some(id) = &m.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    fn extra_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.id == "openrouter" {
            req.header("HTTP-Referer", "https://runfabric.example").header("X-Title", "runfabric")
        } else {
            req
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn complete(&self, messages: &[ChatMessage], opts: CompletionOptions) -> anyhow::Result<CompletionResult> {
        let model = opts.model_override.as_deref().unwrap_or(self.default_model.as_str());
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": model,
            "messages": messages.iter().map(message_to_wire).collect::<Vec<_>>(),
            "stream": false,
        });
        if let Some(max_tokens) = opts.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = opts.temperature {
            body["temperature"] = json!(temperature);
        }
        if opts.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut req = self.client.post(url).json(&body);
        req = self.extra_headers(req);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail =
                extract_openai_error(&value).unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }

        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "provider returned no completion content for model `{}` (response: {})",
                    model,
                    truncate_for_error(&value.to_string(), 500)
                )
            })?;

        Ok(CompletionResult {
            text,
            usage: extract_usage(&value),
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<FunctionSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>> {
        let model = model_override.unwrap_or(self.default_model.as_str()).to_string();
        let url = format!("{}/chat/completions", self.base_url);
        let wire_messages = messages.iter().map(message_to_wire).collect::<Vec<_>>();

        let wire_tools = tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !wire_tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(url).json(&body);
        req = self.extra_headers(req);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let key_hint = provider_api_key_env_hint(&self.id);
            anyhow::bail!(
                "provider stream request failed with status {} for `{}` (set `{}`?): {}",
                status,
                self.id,
                key_hint,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done { finish_reason: Some("cancelled".to_string()), usage: None };
                    break;
                }

                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            continue;
                        }

                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };

                        if let Some(detail) = extract_openai_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }

                        // `usage` only appears on the final chunk, when present
                        // at all (spec §4.4 step 3.c).
                        let usage = extract_usage(&value);

                        let choices = value.get("choices").and_then(|v| v.as_array()).cloned().unwrap_or_default();
                        for choice in &choices {
                            let delta = choice.get("delta").cloned().unwrap_or_default();

                            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    yield StreamChunk::TextDelta { text: text.to_string() };
                                }
                            }

                            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                                for call in tool_calls {
                                    let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                                    let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                                    let function = call.get("function").cloned().unwrap_or_default();
                                    let name = function.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                                    let args_fragment =
                                        function.get("arguments").and_then(|v| v.as_str()).unwrap_or_default().to_string();

                                    if !id.is_empty() || !name.is_empty() {
                                        yield StreamChunk::ToolCallStart { index, id, name };
                                    }
                                    if !args_fragment.is_empty() {
                                        yield StreamChunk::ToolCallDelta { index, arguments_fragment: args_fragment };
                                    }
                                }
                            }

                            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                                yield StreamChunk::Done { finish_reason: Some(reason.to_string()), usage: usage.clone() };
                            }
                        }

                        if choices.is_empty() && usage.is_some() {
                            yield StreamChunk::Done { finish_reason: None, usage };
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>) -> AppConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some("sk-test".to_string()),
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        AppConfig {
            providers,
            default_provider: default_provider.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openai")));
        let provider = registry.select_provider(Some("openrouter")).await.expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[tokio::test]
    async fn falls_back_to_first_provider_when_default_provider_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai"], Some("anthropic")));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "openai");
    }

    #[tokio::test]
    async fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None));
        let err = registry.select_provider(Some("openruter")).await.err().expect("expected error");
        assert!(err.to_string().contains("provider `openruter` is not configured"));
    }

    #[tokio::test]
    async fn no_providers_configured_falls_back_to_local_echo() {
        let registry = ProviderRegistry::new(AppConfig::default());
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "local");
    }
}
