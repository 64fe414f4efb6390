//! Tool registry and dispatcher (spec §4.3), grounded on
//! `original_source/app/core/tool_registry.py` and
//! `original_source/app/core/tools/executor.py`.
//!
//! Handlers for retrieval, web search, calendar, email, contacts and
//! assistant lookup are out-of-scope external collaborators (spec §1): they
//! are expressed here as trait seams ([`RetrievalBackend`], [`WebSearchBackend`],
//! [`CalendarBackend`], [`EmailDraftSink`], [`ContactService`],
//! [`AssistantDirectory`]) rather than concrete implementations, mirroring
//! the way the Python original reaches into `retrieval_service`/`search_web`/
//! DB sessions it does not own.

mod dispatch;
mod handlers;
mod registry;

pub use dispatch::{execute_tool_call, ToolCallContext, ToolHandler};
pub use handlers::{
    delegation_budget_cap, format_web_results_for_llm, register_builtin_tools, AssistantDirectory, CalendarBackend,
    ContactService, DelegationCap, DocumentSink, EmailDraftSink, RetrievalBackend, WebSearchBackend,
};
pub use registry::ToolRegistry;
