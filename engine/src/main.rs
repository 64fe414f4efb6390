//! `runfabric-engine`: the CLI binary that assembles the runfabric crates
//! into a runnable process — a `clap` subcommand parser, a `build_state`
//! wiring function, and a `serve`/one-shot split.
//!
//! The collaborators this core doesn't own (assistant storage, chat
//! history, usage billing) are out of scope per spec.md §1; this binary
//! still needs *something* behind those seams to be runnable standalone,
//! so it wires minimal file-backed stand-ins rather than leaving the
//! traits unimplemented.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use runfabric_eventstream::InMemoryLogStore;
use runfabric_providers::{AppConfig, ProviderConfig, ProviderRegistry};
use runfabric_server::{serve, AppState};
use runfabric_store::{FileStorage, RunLifecycle, Storage};
use runfabric_tools::{register_builtin_tools, RetrievalBackend, ToolRegistry};
use runfabric_types::AgentProfile;
use runfabric_worker::{RuntimeConfig, Worker};

mod collaborators;

use collaborators::{FileAssistantDirectory, FileChatSink, FileConversationHistory, LoggingUsageRecorder, NoRetrieval};

#[derive(Parser, Debug)]
#[command(name = "runfabric-engine")]
#[command(about = "Headless runfabric agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the chat SSE endpoint (spec §6) over HTTP.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long, env = "RUNFABRIC_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// Run a single prompt against one assistant to completion and print
    /// the final answer, bypassing HTTP entirely.
    Run {
        assistant_id: Uuid,
        tenant_id: Uuid,
        prompt: String,
        #[arg(long, default_value = "reactive")]
        profile: String,
        #[arg(long, env = "RUNFABRIC_STATE_DIR")]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logs_dir = runfabric_observability::canonical_logs_dir_from_root(&resolve_state_dir(match &cli.command {
        Command::Serve { state_dir, .. } => state_dir.clone(),
        Command::Run { state_dir, .. } => state_dir.clone(),
    }));
    let (_guard, _info) =
        runfabric_observability::init_process_logging(runfabric_observability::ProcessKind::Engine, &logs_dir, 14)?;

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            tracing::info!(state_dir = %state_dir.display(), "starting runfabric-engine");
            let worker = build_worker(&state_dir).await?;
            let addr: SocketAddr = format!("{hostname}:{port}").parse().context("invalid hostname or port")?;
            serve(addr, AppState::new(worker)).await?;
        }
        Command::Run { assistant_id, tenant_id, prompt, profile, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let worker = build_worker(&state_dir).await?;
            let profile = AgentProfile::parse_or_reactive(&profile);
            let run = worker
                .lifecycle
                .create_run(tenant_id, assistant_id, Uuid::new_v4(), prompt, profile, None, None)
                .await?;
            runfabric_worker::run_agent(&worker, run.id).await;
            let finished = worker
                .lifecycle
                .get_run(run.id, Some(tenant_id))
                .await?
                .context("run vanished immediately after completion")?;
            match finished.output_text {
                Some(text) => println!("{text}"),
                None => {
                    println!(
                        "(no output; status={:?} error={:?})",
                        finished.status, finished.error_code
                    );
                }
            }
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    PathBuf::from(".runfabric")
}

/// Assembles the six components (spec §2) behind a single `Worker`: run
/// lifecycle + storage, budget (constructed per-run inside `run_agent`),
/// tool registry, provider registry, event stream fabric, and the
/// collaborator seams `run_agent` needs but this core doesn't own.
async fn build_worker(state_dir: &Path) -> anyhow::Result<Arc<Worker<InMemoryLogStore>>> {
    tokio::fs::create_dir_all(state_dir).await.ok();

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(state_dir.join("storage")).await?);
    let lifecycle = Arc::new(RunLifecycle::new(storage));

    let mut registry = ToolRegistry::new();
    let retrieval: Arc<dyn RetrievalBackend> = Arc::new(NoRetrieval);
    register_builtin_tools(&mut registry, retrieval, None, None, None, None, None, None, None, &[]);

    let providers = Arc::new(ProviderRegistry::new(provider_config_from_env()));

    let assistants = Arc::new(FileAssistantDirectory::load(state_dir.join("assistants.json")).await?);
    let history = Arc::new(FileConversationHistory::new(state_dir.join("conversations")));
    let chat_sink = Arc::new(FileChatSink::new(state_dir.join("conversations")));

    Ok(Arc::new(Worker {
        lifecycle,
        event_store: Arc::new(InMemoryLogStore::new()),
        tools: Arc::new(registry),
        providers,
        assistants,
        history,
        chat_sink,
        usage: Arc::new(LoggingUsageRecorder),
        config: RuntimeConfig::from_env(),
    }))
}

/// Every known provider id gets an (initially empty) entry so
/// `ProviderRegistry::new` picks up its API key from the environment
/// (`OPENAI_API_KEY` and friends) even with no config file on disk.
fn provider_config_from_env() -> AppConfig {
    let mut providers = HashMap::new();
    for id in ["openai", "openrouter", "mistral", "groq", "together"] {
        providers.insert(id.to_string(), ProviderConfig::default());
    }
    AppConfig {
        providers,
        default_provider: std::env::var("RUNFABRIC_DEFAULT_PROVIDER").ok(),
    }
}

