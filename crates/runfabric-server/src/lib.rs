//! HTTP SSE relay (spec §6): the one HTTP surface in scope — a `Clone`-able
//! state handle wrapping `Arc`s, a router built once at startup, and a
//! handful of
//! long-running background tasks (here: the watchdog) spawned alongside the
//! listener rather than a full routine scheduler / channel listener stack,
//! none of which this core owns.

mod http;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use runfabric_eventstream::EventLogStore;
use runfabric_worker::{watchdog_stuck_runs, RuntimeConfig, Worker};

pub use http::{router, ChatRequest};

/// Shared state handed to every axum handler. Cloning is cheap: every field
/// is already an `Arc` inside `Worker`.
#[derive(Clone)]
pub struct AppState<S: EventLogStore> {
    pub worker: Arc<Worker<S>>,
}

impl<S: EventLogStore> AppState<S> {
    pub fn new(worker: Arc<Worker<S>>) -> Self {
        Self { worker }
    }
}

/// Binds the router and serves it, running the stuck-run watchdog
/// (spec §4.6) on a fixed interval alongside it: spawn the background loop,
/// bind the listener, serve with graceful shutdown on Ctrl-C, then stop
/// the background loop.
pub async fn serve<S: EventLogStore + 'static>(addr: SocketAddr, state: AppState<S>) -> anyhow::Result<()> {
    let watchdog_worker = state.worker.clone();
    let watchdog = tokio::spawn(async move {
        watchdog_loop(watchdog_worker).await;
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "runfabric-server listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    watchdog.abort();
    result.map_err(Into::into)
}

async fn watchdog_loop<S: EventLogStore>(worker: Arc<Worker<S>>) {
    let mut interval = tokio::time::interval(watchdog_poll_interval(&worker.config));
    loop {
        interval.tick().await;
        match watchdog_stuck_runs(&worker).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(reaped = n, "watchdog failed stuck runs"),
            Err(err) => tracing::error!(%err, "watchdog pass failed"),
        }
    }
}

/// Polls at a quarter of the stuck-run threshold, floored at 5s, so a run
/// is never stuck for much longer than the documented threshold before
/// being reaped.
fn watchdog_poll_interval(config: &RuntimeConfig) -> Duration {
    (config.agent_stuck_run_threshold / 4).max(Duration::from_secs(5))
}
