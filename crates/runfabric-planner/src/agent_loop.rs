//! Multi-round LLM orchestration with tool calling (spec §4.4 "Agent
//! loop"), grounded on `original_source/app/core/agent_loop.py`.
//!
//! Events are pushed onto an unbounded channel rather than returned as a
//! `Stream` directly: each run has exactly one consumer (the worker), and
//! a channel sidesteps holding `&mut BudgetManager` across an
//! `async-stream` generator's yield points, matching the publish/consume
//! shape the host workspace's own engine loop uses around its `EventBus`.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use futures::StreamExt;
use runfabric_budget::BudgetManager;
use runfabric_providers::ProviderRegistry;
use runfabric_types::{
    AgentContext, AgentEvent, Citation, ChatMessage, Plan, PlanStepStatus, RetrievedChunk, StreamChunk,
    ToolEventStatus, ToolResult,
};
use runfabric_tools::{execute_tool_call, ToolCallContext, ToolRegistry};

#[derive(Default, Clone)]
struct ToolCallAcc {
    id: String,
    name: String,
    arguments: String,
}

fn plan_prompt_summary(plan: &Plan) -> String {
    let mut out = String::from("PLAN:\n");
    for step in &plan.steps {
        let marker = if matches!(step.status, PlanStepStatus::Completed) { "✓" } else { "○" };
        out.push_str(&format!("  {marker} {}: {}\n", step.action, step.description));
        if let Some(summary) = &step.result_summary {
            out.push_str(&format!("    → {summary}\n"));
        }
    }
    out
}

fn format_chunks_for_llm(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return "Aucun document pertinent trouvé.".to_string();
    }
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let page = c.page_number.map(|p| format!(", p. {p}")).unwrap_or_default();
            format!("[Document {}: {}{}]\n{}", i + 1, c.document_filename, page, c.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn chunk_citation(chunk: &RetrievedChunk) -> Citation {
    Citation {
        chunk_id: Some(chunk.chunk_id),
        document_id: Some(chunk.document_id),
        document_filename: Some(chunk.document_filename.clone()),
        page_number: chunk.page_number,
        excerpt: Some(chunk.text.chars().take(200).collect()),
        score: Some(chunk.score),
        url: None,
    }
}

fn emit(events: &mpsc::UnboundedSender<AgentEvent>, event: AgentEvent) {
    let _ = events.send(event);
}

/// Drives one run's agent loop to completion, publishing every event on
/// `events`. The final event is always `Done` or `Error` (spec §5
/// "Ordering guarantees": the terminal event is the last one appended).
pub async fn run_agent_loop(
    mut ctx: AgentContext,
    budget: &mut BudgetManager,
    registry: &ToolRegistry,
    providers: &ProviderRegistry,
    events: mpsc::UnboundedSender<AgentEvent>,
) {
    let max_rounds = ctx.profile.max_tool_rounds();

    let mut system_prompt = ctx.system_prompt.clone();
    if let Some(plan) = &ctx.plan {
        system_prompt.push_str("\n\n");
        system_prompt.push_str(&plan_prompt_summary(plan));
        emit(&events, AgentEvent::Plan(serde_json::json!({
            "reasoning": plan.reasoning,
            "steps": plan.steps,
        })));
    }

    let mut messages = Vec::with_capacity(ctx.history.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(ctx.history.clone());
    messages.push(ChatMessage::user(ctx.message.clone()));

    emit(&events, AgentEvent::Status("analyzing".to_string()));

    let mut tokens_input: u64 = 0;
    let mut tokens_output: u64 = 0;
    let mut blocks_count: u32 = 0;
    let mut all_citations: Vec<Citation> = Vec::new();
    let mut rounds_completed: u32 = 0;

    let emit_citations = |events: &mpsc::UnboundedSender<AgentEvent>, citations: &[Citation]| {
        let values = citations.iter().map(|c| serde_json::to_value(c).unwrap_or_default()).collect();
        emit(events, AgentEvent::Citations(values));
    };

    for round in 1..=max_rounds {
        if !budget.check(500) {
            break;
        }
        rounds_completed = round;

        let tool_schemas = registry.get_openai_schemas(&ctx.allowed_tools);
        let schemas_arg = if tool_schemas.is_empty() { None } else { Some(tool_schemas) };

        let stream_result = providers
            .stream_for_provider(None, None, messages.clone(), schemas_arg, CancellationToken::new())
            .await;

        let (mut stream, _provider_id) = match stream_result {
            Ok(pair) => pair,
            Err(err) => {
                emit(&events, AgentEvent::Error { code: "llm_error".to_string(), message: Some(err.to_string()) });
                return;
            }
        };

        let mut streamed_content = String::new();
        let mut tool_calls_acc: HashMap<usize, ToolCallAcc> = HashMap::new();
        let mut round_tokens_in: u64 = 0;
        let mut round_tokens_out: u64 = 0;

        loop {
            match stream.next().await {
                None => break,
                Some(Err(err)) => {
                    emit(&events, AgentEvent::Error { code: "llm_error".to_string(), message: Some(err.to_string()) });
                    return;
                }
                Some(Ok(StreamChunk::TextDelta { text })) => {
                    streamed_content.push_str(&text);
                    emit(&events, AgentEvent::Token(text));
                }
                Some(Ok(StreamChunk::ReasoningDelta { .. })) => {}
                Some(Ok(StreamChunk::ToolCallStart { index, id, name })) => {
                    let acc = tool_calls_acc.entry(index).or_default();
                    if !id.is_empty() {
                        acc.id = id;
                    }
                    if !name.is_empty() {
                        acc.name = name;
                    }
                }
                Some(Ok(StreamChunk::ToolCallDelta { index, arguments_fragment })) => {
                    tool_calls_acc.entry(index).or_default().arguments.push_str(&arguments_fragment);
                }
                Some(Ok(StreamChunk::ToolCallEnd { .. })) => {}
                Some(Ok(StreamChunk::Done { usage, .. })) => {
                    if let Some(usage) = usage {
                        round_tokens_in = usage.prompt_tokens;
                        round_tokens_out = usage.completion_tokens;
                    }
                }
            }
        }

        budget.consume_safe(round_tokens_in + round_tokens_out);
        tokens_input += round_tokens_in;
        tokens_output += round_tokens_out;

        if tool_calls_acc.is_empty() {
            break;
        }

        let mut ordered: Vec<(usize, ToolCallAcc)> = tool_calls_acc.into_iter().collect();
        ordered.sort_by_key(|(index, _)| *index);

        let tool_calls: Vec<runfabric_types::ToolCall> = ordered
            .iter()
            .map(|(_, acc)| runfabric_types::ToolCall { id: acc.id.clone(), name: acc.name.clone(), arguments: acc.arguments.clone() })
            .collect();
        messages.push(ChatMessage::assistant(
            if streamed_content.is_empty() { None } else { Some(streamed_content.clone()) },
            tool_calls,
        ));

        let mut round_has_continuation = false;

        for (_, call) in ordered {
            emit(&events, AgentEvent::Tool { tool: call.name.clone(), status: ToolEventStatus::Calling, detail: None });

            let arguments: serde_json::Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));

            let call_ctx = ToolCallContext {
                arguments: arguments.clone(),
                tenant_id: ctx.tenant_id,
                assistant_id: Some(ctx.assistant_id),
                conversation_id: Some(ctx.conversation_id),
                collection_ids: ctx.collection_ids.clone(),
                citations: all_citations.clone(),
                profile: ctx.profile,
                budget: Some(&mut *budget),
                user_context: ctx.user_context.clone(),
            };

            let result = execute_tool_call(registry, &call.name, call_ctx).await;

            emit(
                &events,
                AgentEvent::Tool {
                    tool: call.name.clone(),
                    status: if result.success { ToolEventStatus::Completed } else { ToolEventStatus::Failed },
                    detail: None,
                },
            );

            if let Some(block) = &result.block {
                blocks_count += 1;
                emit(&events, AgentEvent::Block(block.clone()));
            }

            let tool_content = match (&result.result, &result.error) {
                (Some(ToolResult::Chunks { chunks }), _) => {
                    let content = format_chunks_for_llm(chunks);
                    all_citations.extend(chunks.iter().map(chunk_citation));
                    emit_citations(&events, &all_citations);
                    content
                }
                (Some(ToolResult::WebSearch { formatted, results }), _) => {
                    all_citations.extend(results.iter().map(|r| Citation {
                        chunk_id: None,
                        document_id: None,
                        document_filename: None,
                        page_number: None,
                        excerpt: Some(r.snippet.chars().take(200).collect()),
                        score: None,
                        url: Some(r.url.clone()),
                    }));
                    emit_citations(&events, &all_citations);
                    formatted.clone()
                }
                (Some(ToolResult::Delegation { assistant_name, answer, citations }), _) => {
                    all_citations.extend(citations.iter().cloned());
                    emit_citations(&events, &all_citations);
                    format!("[Réponse de l'assistant '{assistant_name}']\n{answer}")
                }
                (Some(ToolResult::Calendar { payload }), _) if result.success => payload.to_string(),
                (_, Some(error_message)) => serde_json::json!({ "error": error_message }).to_string(),
                (Some(other), _) => other.to_tool_message(),
                (None, None) => "{}".to_string(),
            };

            messages.push(ChatMessage::tool(call.id.clone(), tool_content));

            let definition_continues = registry.get(&call.name).map(|d| d.continues_loop).unwrap_or(false);
            round_has_continuation = round_has_continuation || (result.success && definition_continues);
        }

        if let Some(plan) = ctx.plan.as_mut() {
            plan.complete_next_step();
        }

        if !round_has_continuation {
            break;
        }
    }

    emit(
        &events,
        AgentEvent::Done {
            tokens_input,
            tokens_output,
            tool_rounds: rounds_completed.min(max_rounds),
            blocks_count,
            citations_count: all_citations.len() as u32,
        },
    );
}
