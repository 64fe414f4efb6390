//! The abstract log-store contract (spec §4.5): append with a
//! publisher-assigned monotonic seq, read-from-seq with a blocking timeout,
//! approximate-length trimming, and a per-key TTL. A Redis Streams backend
//! satisfies this directly; [`InMemoryLogStore`] is the default used by
//! tests and the single-process `engine` binary.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use runfabric_types::EventRecord;

#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Appends an already-sequenced record, trimming the backlog to
    /// approximately `maxlen` entries.
    async fn append(&self, key: &str, record: EventRecord, maxlen: usize) -> anyhow::Result<()>;

    /// Returns records with `seq > after_seq`, waiting up to `block` for at
    /// least one to arrive if none are immediately available. An empty
    /// result means the wait elapsed with nothing new — not an error.
    async fn read_from(
        &self,
        key: &str,
        after_seq: i64,
        block: Duration,
        count: usize,
    ) -> anyhow::Result<Vec<EventRecord>>;

    /// Refreshes (or sets) the key's TTL. Never fails due to a missing key —
    /// that just means the key hasn't been written to yet.
    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;
}

struct RunLog {
    tx: broadcast::Sender<EventRecord>,
    backlog: VecDeque<EventRecord>,
    expires_at: Option<Instant>,
}

impl RunLog {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            tx,
            backlog: VecDeque::new(),
            expires_at: None,
        }
    }
}

/// `tokio::sync::broadcast` per run plus a bounded backlog for
/// replay-from-seq, generalized from a single process-wide fire-and-forget
/// channel: here each run gets its own channel and late subscribers can
/// still catch up via the backlog.
#[derive(Default)]
pub struct InMemoryLogStore {
    logs: RwLock<HashMap<String, RunLog>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops logs whose TTL has elapsed. Not called automatically — a
    /// maintenance task (e.g. the worker's watchdog tick) should invoke it
    /// periodically if long process lifetimes are expected.
    pub async fn evict_expired(&self) {
        let now = Instant::now();
        self.logs
            .write()
            .await
            .retain(|_, log| log.expires_at.map_or(true, |exp| exp > now));
    }
}

#[async_trait]
impl EventLogStore for InMemoryLogStore {
    async fn append(&self, key: &str, record: EventRecord, maxlen: usize) -> anyhow::Result<()> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(key.to_string()).or_insert_with(RunLog::new);
        log.backlog.push_back(record.clone());
        while log.backlog.len() > maxlen {
            log.backlog.pop_front();
        }
        let _ = log.tx.send(record);
        Ok(())
    }

    async fn read_from(
        &self,
        key: &str,
        after_seq: i64,
        block: Duration,
        count: usize,
    ) -> anyhow::Result<Vec<EventRecord>> {
        let mut rx = {
            let mut logs = self.logs.write().await;
            let log = logs.entry(key.to_string()).or_insert_with(RunLog::new);
            let backlogged: Vec<EventRecord> = log
                .backlog
                .iter()
                .filter(|r| r.seq > after_seq)
                .take(count)
                .cloned()
                .collect();
            if !backlogged.is_empty() {
                return Ok(backlogged);
            }
            log.tx.subscribe()
        };

        match tokio::time::timeout(block, rx.recv()).await {
            Ok(Ok(record)) if record.seq > after_seq => Ok(vec![record]),
            Ok(Ok(_)) => Ok(Vec::new()),
            Ok(Err(_)) => Ok(Vec::new()),
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(key.to_string()).or_insert_with(RunLog::new);
        log.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(seq: i64, kind: &str) -> EventRecord {
        EventRecord {
            seq,
            kind: kind.to_string(),
            ts: chrono::Utc::now(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn replay_from_backlog_does_not_block() {
        let store = InMemoryLogStore::new();
        store.append("agent:1", record(1, "status"), 2000).await.unwrap();
        store.append("agent:1", record(2, "token"), 2000).await.unwrap();

        let records = store
            .read_from("agent:1", 0, Duration::from_millis(50), 50)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 1);
    }

    #[tokio::test]
    async fn read_from_beyond_backlog_times_out_empty() {
        let store = InMemoryLogStore::new();
        store.append("agent:1", record(1, "status"), 2000).await.unwrap();

        let records = store
            .read_from("agent:1", 1, Duration::from_millis(30), 50)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn backlog_trims_to_approximately_maxlen() {
        let store = InMemoryLogStore::new();
        for seq in 1..=10 {
            store.append("agent:1", record(seq, "token"), 3).await.unwrap();
        }
        let records = store
            .read_from("agent:1", 0, Duration::from_millis(10), 100)
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].seq, 8);
    }
}
