//! `AgentStreamConsumer`, grounded on
//! `original_source/app/core/streams.py::AgentStreamConsumer`: same
//! hard-timeout-as-terminal-error and heartbeat-on-idle rules, same
//! synthetic `seq = -1` convention for events that never touch the store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use runfabric_types::EventRecord;

use crate::store::EventLogStore;

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub last_seq: i64,
    pub block: Duration,
    pub heartbeat_interval: Duration,
    pub hard_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            last_seq: 0,
            block: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(15),
            hard_timeout: Duration::from_secs(180),
        }
    }
}

/// A record read from the store, or one of the two consumer-synthesized
/// events that never touch it.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Record(EventRecord),
    Heartbeat(EventRecord),
    HardTimeout(EventRecord),
}

impl ConsumerEvent {
    pub fn record(&self) -> &EventRecord {
        match self {
            ConsumerEvent::Record(r) | ConsumerEvent::Heartbeat(r) | ConsumerEvent::HardTimeout(r) => r,
        }
    }

    /// `done`, `error`, or the synthetic hard-timeout error all end the
    /// consumer loop.
    pub fn ends_stream(&self) -> bool {
        matches!(self, ConsumerEvent::HardTimeout(_)) || self.record().is_terminal()
    }
}

fn heartbeat_record() -> EventRecord {
    EventRecord {
        seq: -1,
        kind: "status".to_string(),
        ts: chrono::Utc::now(),
        data: json!({ "status": "heartbeat" }),
    }
}

fn hard_timeout_record() -> EventRecord {
    EventRecord {
        seq: -1,
        kind: "error".to_string(),
        ts: chrono::Utc::now(),
        data: json!({ "code": "hard_timeout", "message": "Stream timeout" }),
    }
}

pub struct AgentStreamConsumer<S: EventLogStore> {
    store: Arc<S>,
    key: String,
    last_seq: i64,
    block: Duration,
    heartbeat_interval: Duration,
    hard_timeout: Duration,
    start: tokio::time::Instant,
    last_event_at: tokio::time::Instant,
    queue: VecDeque<EventRecord>,
    finished: bool,
}

impl<S: EventLogStore> AgentStreamConsumer<S> {
    pub fn new(store: Arc<S>, run_id: Uuid, opts: ConsumerOptions) -> Self {
        let now = tokio::time::Instant::now();
        Self {
            store,
            key: format!("agent:{run_id}"),
            last_seq: opts.last_seq,
            block: opts.block,
            heartbeat_interval: opts.heartbeat_interval,
            hard_timeout: opts.hard_timeout,
            start: now,
            last_event_at: now,
            queue: VecDeque::new(),
            finished: false,
        }
    }

    /// Pulls the next event, blocking up to `block` per underlying store
    /// poll. Returns `None` once a terminal event (real or synthetic) has
    /// already been yielded — callers should stop polling at that point.
    pub async fn next_event(&mut self) -> Option<ConsumerEvent> {
        if self.finished {
            return None;
        }
        if let Some(record) = self.queue.pop_front() {
            self.last_event_at = tokio::time::Instant::now();
            let event = ConsumerEvent::Record(record);
            if event.ends_stream() {
                self.finished = true;
            }
            return Some(event);
        }

        loop {
            if self.start.elapsed() > self.hard_timeout {
                self.finished = true;
                return Some(ConsumerEvent::HardTimeout(hard_timeout_record()));
            }

            match self.store.read_from(&self.key, self.last_seq, self.block, 50).await {
                Ok(records) if !records.is_empty() => {
                    self.queue.extend(records);
                    let record = self.queue.pop_front().expect("just extended");
                    self.last_seq = self.last_seq.max(record.seq);
                    self.last_event_at = tokio::time::Instant::now();
                    let event = ConsumerEvent::Record(record);
                    if event.ends_stream() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Ok(_) => {
                    if self.last_event_at.elapsed() >= self.heartbeat_interval {
                        self.last_event_at = tokio::time::Instant::now();
                        return Some(ConsumerEvent::Heartbeat(heartbeat_record()));
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, key = %self.key, "event log read failed, retrying");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::AgentStreamPublisher;
    use crate::store::InMemoryLogStore;
    use runfabric_types::ToolEventStatus;

    #[tokio::test]
    async fn consumer_replays_then_stops_at_done() {
        let store = Arc::new(InMemoryLogStore::new());
        let run_id = Uuid::new_v4();
        let mut publisher = AgentStreamPublisher::new(store.clone(), run_id);
        publisher.setup(Duration::from_secs(600), 2000).await.unwrap();
        publisher.emit_status("searching").await.unwrap();
        publisher.emit_delta("hello").await.unwrap();
        publisher.emit_done(10, 5, 1, 0, 0).await.unwrap();

        let mut consumer = AgentStreamConsumer::new(store, run_id, ConsumerOptions::default());
        let mut kinds = Vec::new();
        while let Some(event) = consumer.next_event().await {
            kinds.push(event.record().kind.clone());
            if event.ends_stream() {
                break;
            }
        }
        assert_eq!(kinds, vec!["status", "token", "done"]);
    }

    #[tokio::test]
    async fn heartbeat_fires_while_idle() {
        let store = Arc::new(InMemoryLogStore::new());
        let run_id = Uuid::new_v4();
        let mut consumer = AgentStreamConsumer::new(
            store,
            run_id,
            ConsumerOptions {
                block: Duration::from_millis(20),
                heartbeat_interval: Duration::from_millis(30),
                hard_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        let event = consumer.next_event().await.unwrap();
        assert_eq!(event.record().kind, "status");
        assert_eq!(event.record().seq, -1);
        assert!(!event.ends_stream());
    }

    #[tokio::test]
    async fn hard_timeout_yields_synthetic_error_and_ends_stream() {
        let store = Arc::new(InMemoryLogStore::new());
        let run_id = Uuid::new_v4();
        let mut consumer = AgentStreamConsumer::new(
            store,
            run_id,
            ConsumerOptions {
                block: Duration::from_millis(10),
                heartbeat_interval: Duration::from_secs(600),
                hard_timeout: Duration::from_millis(30),
                ..Default::default()
            },
        );
        let event = consumer.next_event().await.unwrap();
        assert!(matches!(event, ConsumerEvent::HardTimeout(_)));
        assert!(event.ends_stream());
        assert!(consumer.next_event().await.is_none());
    }

    #[tokio::test]
    async fn tool_event_status_round_trips_through_store() {
        let store = Arc::new(InMemoryLogStore::new());
        let run_id = Uuid::new_v4();
        let mut publisher = AgentStreamPublisher::new(store.clone(), run_id);
        publisher.setup(Duration::from_secs(600), 2000).await.unwrap();
        publisher
            .emit_tool("search_documents", ToolEventStatus::Calling, None)
            .await
            .unwrap();

        let mut consumer = AgentStreamConsumer::new(store, run_id, ConsumerOptions::default());
        let event = consumer.next_event().await.unwrap();
        assert_eq!(event.record().kind, "tool");
        assert_eq!(event.record().data["status"], "calling");
    }
}
