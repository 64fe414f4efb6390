//! The chat endpoint (spec §6): `POST /chat` enqueues a run and relays its
//! event stream back as `text/event-stream` — a thin SSE wrapper around a
//! runtime that does the real work, not a place to put business logic.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use runfabric_eventstream::{AgentStreamConsumer, ConsumerEvent, ConsumerOptions, EventLogStore};
use runfabric_types::AgentProfile;
use runfabric_wire::{frame_for_record, ErrorPayload, SseFrame};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub tenant_id: Uuid,
    pub assistant_id: Uuid,
    pub conversation_id: Uuid,
    pub message: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub budget_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResumeQuery {
    #[serde(default)]
    last_seq: i64,
}

pub fn router<S: EventLogStore + 'static>(state: AppState<S>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/chat", post(create_chat::<S>))
        .route("/chat/{run_id}/stream", get(resume_chat::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Enqueues a run and immediately starts streaming its events: create,
/// spawn the worker, hand the caller an SSE body they can start reading
/// before the worker does any real work.
async fn create_chat<S: EventLogStore + 'static>(
    State(state): State<AppState<S>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let profile = req
        .profile
        .as_deref()
        .map(AgentProfile::parse_or_reactive)
        .unwrap_or(AgentProfile::Reactive);

    let run = match state
        .worker
        .lifecycle
        .create_run(
            req.tenant_id,
            req.assistant_id,
            req.conversation_id,
            req.message,
            profile,
            req.budget_tokens,
            None,
        )
        .await
    {
        Ok(run) => run,
        Err(err) => {
            let error_only = futures::stream::iter(vec![Ok::<_, Infallible>(event_from_frame(SseFrame::json(
                "error",
                &ErrorPayload {
                    code: "run_not_found".to_string(),
                    message: Some(err.to_string()),
                },
            )))]);
            return sse_response(error_only);
        }
    };

    let worker = state.worker.clone();
    let run_id = run.id;
    tokio::spawn(async move {
        runfabric_worker::run_agent(&worker, run_id).await;
    });

    let framing = vec![
        Ok::<_, Infallible>(event_from_frame(SseFrame::conversation_id(run.conversation_id))),
        Ok(event_from_frame(SseFrame::run_id(run.id))),
    ];
    let consumer_options = consumer_options_for(&state, 0);
    let tail = event_stream(state.worker.event_store.clone(), run.id, consumer_options);
    sse_response(futures::stream::iter(framing).chain(tail))
}

/// Reattaches to an in-flight or already-finished run from a given
/// sequence number (spec §6 resume-from-seq), without re-emitting the
/// framing events — those are only ever sent once, at creation.
async fn resume_chat<S: EventLogStore + 'static>(
    State(state): State<AppState<S>>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<ResumeQuery>,
) -> impl IntoResponse {
    let consumer_options = consumer_options_for(&state, query.last_seq);
    sse_response(event_stream(state.worker.event_store.clone(), run_id, consumer_options))
}

fn consumer_options_for<S: EventLogStore>(state: &AppState<S>, last_seq: i64) -> ConsumerOptions {
    let config = &state.worker.config;
    ConsumerOptions {
        last_seq,
        heartbeat_interval: config.agent_sse_heartbeat_interval,
        hard_timeout: config.agent_sse_hard_timeout,
        ..ConsumerOptions::default()
    }
}

fn event_stream<S: EventLogStore + 'static>(
    store: Arc<S>,
    run_id: Uuid,
    options: ConsumerOptions,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut consumer = AgentStreamConsumer::new(store, run_id, options);
        while let Some(event) = consumer.next_event().await {
            let ends = event.ends_stream();
            let record = match &event {
                ConsumerEvent::Record(r) | ConsumerEvent::Heartbeat(r) | ConsumerEvent::HardTimeout(r) => r,
            };
            yield Ok(event_from_frame(frame_for_record(record)));
            if ends {
                break;
            }
        }
    }
}

fn sse_response<St>(stream: St) -> axum::response::Response
where
    St: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)));
    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
    headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
    headers.insert("X-Accel-Buffering", "no".parse().unwrap());
    response
}

fn event_from_frame(frame: SseFrame) -> Event {
    Event::default().event(frame.event).data(frame.data)
}
