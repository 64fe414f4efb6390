//! The `Storage` seam (SPEC_FULL "Storage" section), grounded on a
//! per-entity-file JSON layout, generalized from a single `base`-directory
//! `HashMap` cache to three entity kinds.
//! Every read method takes `tenant_id` and filters server-side — the tenant
//! isolation invariant from spec §3 isn't just a caller convention.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use runfabric_types::{AuditLog, LLMTrace, Run, RunStatus};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_run(&self, run: Run) -> anyhow::Result<()>;
    async fn get_run(&self, run_id: Uuid, tenant_id: Option<Uuid>) -> anyhow::Result<Option<Run>>;
    async fn list_runs(
        &self,
        tenant_id: Uuid,
        conversation_id: Option<Uuid>,
        status: Option<RunStatus>,
        limit: usize,
    ) -> anyhow::Result<Vec<Run>>;
    async fn find_stuck_runs(&self, running_since_before: DateTime<Utc>) -> anyhow::Result<Vec<Run>>;
    async fn put_audit(&self, entry: AuditLog) -> anyhow::Result<()>;
    async fn put_trace(&self, trace: LLMTrace) -> anyhow::Result<()>;
}

/// Default backend for tests and the `run` CLI subcommand: a
/// `tokio::sync::RwLock<HashMap<_>>` per entity, an in-memory session
/// cache with no persistence.
#[derive(Default)]
pub struct MemoryStorage {
    runs: RwLock<HashMap<Uuid, Run>>,
    audit: RwLock<Vec<AuditLog>>,
    traces: RwLock<Vec<LLMTrace>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_run(&self, run: Run) -> anyhow::Result<()> {
        self.runs.write().await.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid, tenant_id: Option<Uuid>) -> anyhow::Result<Option<Run>> {
        let guard = self.runs.read().await;
        Ok(guard
            .get(&run_id)
            .filter(|r| tenant_id.map_or(true, |t| r.tenant_id == t))
            .cloned())
    }

    async fn list_runs(
        &self,
        tenant_id: Uuid,
        conversation_id: Option<Uuid>,
        status: Option<RunStatus>,
        limit: usize,
    ) -> anyhow::Result<Vec<Run>> {
        let guard = self.runs.read().await;
        let mut runs: Vec<Run> = guard
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| conversation_id.map_or(true, |c| r.conversation_id == c))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn find_stuck_runs(&self, running_since_before: DateTime<Utc>) -> anyhow::Result<Vec<Run>> {
        let guard = self.runs.read().await;
        Ok(guard
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .filter(|r| r.started_at.map_or(false, |s| s < running_since_before))
            .cloned()
            .collect())
    }

    async fn put_audit(&self, entry: AuditLog) -> anyhow::Result<()> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn put_trace(&self, trace: LLMTrace) -> anyhow::Result<()> {
        self.traces.write().await.push(trace);
        Ok(())
    }
}

/// One JSON file per entity under `<base>/{runs,audit,traces}/<id>.json`,
/// matching a file-per-session layout. No SQL database is in scope (spec
/// §1), but a run's terminal state still
/// needs to survive a worker crash for the watchdog guarantee to mean
/// anything across process restarts.
pub struct FileStorage {
    base: PathBuf,
    // Mirrors MemoryStorage's in-process cache so reads don't round-trip
    // through the filesystem on every call; writes go to disk first.
    cache: MemoryStorage,
}

impl FileStorage {
    pub async fn open(base: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base = base.into();
        for sub in ["runs", "audit", "traces"] {
            tokio::fs::create_dir_all(base.join(sub)).await?;
        }
        let storage = Self {
            base,
            cache: MemoryStorage::new(),
        };
        storage.hydrate().await?;
        Ok(storage)
    }

    async fn hydrate(&self) -> anyhow::Result<()> {
        for entry in read_json_dir::<Run>(&self.base.join("runs")).await? {
            self.cache.put_run(entry).await?;
        }
        for entry in read_json_dir::<AuditLog>(&self.base.join("audit")).await? {
            self.cache.put_audit(entry).await?;
        }
        for entry in read_json_dir::<LLMTrace>(&self.base.join("traces")).await? {
            self.cache.put_trace(entry).await?;
        }
        Ok(())
    }

    fn run_path(&self, id: Uuid) -> PathBuf {
        self.base.join("runs").join(format!("{id}.json"))
    }

    fn audit_path(&self, id: Uuid) -> PathBuf {
        self.base.join("audit").join(format!("{id}.json"))
    }

    fn trace_path(&self, id: Uuid) -> PathBuf {
        self.base.join("traces").join(format!("{id}.json"))
    }
}

async fn read_json_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> anyhow::Result<Vec<T>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => out.push(value),
            Err(err) => tracing::warn!(path = %path.display(), %err, "failed to parse persisted entity, skipping"),
        }
    }
    Ok(out)
}

async fn write_json(path: &Path, value: &impl serde::Serialize) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn put_run(&self, run: Run) -> anyhow::Result<()> {
        write_json(&self.run_path(run.id), &run).await?;
        self.cache.put_run(run).await
    }

    async fn get_run(&self, run_id: Uuid, tenant_id: Option<Uuid>) -> anyhow::Result<Option<Run>> {
        self.cache.get_run(run_id, tenant_id).await
    }

    async fn list_runs(
        &self,
        tenant_id: Uuid,
        conversation_id: Option<Uuid>,
        status: Option<RunStatus>,
        limit: usize,
    ) -> anyhow::Result<Vec<Run>> {
        self.cache.list_runs(tenant_id, conversation_id, status, limit).await
    }

    async fn find_stuck_runs(&self, running_since_before: DateTime<Utc>) -> anyhow::Result<Vec<Run>> {
        self.cache.find_stuck_runs(running_since_before).await
    }

    async fn put_audit(&self, entry: AuditLog) -> anyhow::Result<()> {
        write_json(&self.audit_path(entry.id), &entry).await?;
        self.cache.put_audit(entry).await
    }

    async fn put_trace(&self, trace: LLMTrace) -> anyhow::Result<()> {
        write_json(&self.trace_path(trace.id), &trace).await?;
        self.cache.put_trace(trace).await
    }
}

pub type SharedStorage = Arc<dyn Storage>;
