//! Recognized settings (spec §6 "Environment / configuration"), loaded from
//! the process environment with explicit overrides layered under documented
//! defaults, reduced to the subset this core actually reads, so a worker
//! with no environment configured still behaves per spec.

use std::time::Duration;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub agent_stream_ttl: Duration,
    pub agent_stream_maxlen: usize,
    pub agent_sse_heartbeat_interval: Duration,
    pub agent_sse_hard_timeout: Duration,
    pub agent_stuck_run_threshold: Duration,
    pub agent_delta_batch_ms: Duration,
    pub llm_model: Option<String>,
    pub llm_max_tokens: Option<u64>,
    pub web_search_enabled: bool,
    pub web_search_provider: Option<String>,
    pub web_search_api_key: Option<String>,
    pub web_search_topk: u64,
    pub web_cache_ttl_hours: u64,
    /// Spec §4.6 step 7: "Load last N (default 10) messages of the
    /// conversation for history." Not in §6's settings table, but it is a
    /// named default, so it lives alongside the rest of the runtime knobs.
    pub history_window: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            agent_stream_ttl: Duration::from_secs(600),
            agent_stream_maxlen: 2000,
            agent_sse_heartbeat_interval: Duration::from_secs(15),
            agent_sse_hard_timeout: Duration::from_secs(180),
            agent_stuck_run_threshold: Duration::from_secs(600),
            agent_delta_batch_ms: Duration::from_millis(300),
            llm_model: None,
            llm_max_tokens: None,
            web_search_enabled: false,
            web_search_provider: None,
            web_search_api_key: None,
            web_search_topk: 5,
            web_cache_ttl_hours: 24,
            history_window: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            agent_stream_ttl: Duration::from_secs(env_u64("AGENT_STREAM_TTL", defaults.agent_stream_ttl.as_secs())),
            agent_stream_maxlen: env_u64("AGENT_STREAM_MAXLEN", defaults.agent_stream_maxlen as u64) as usize,
            agent_sse_heartbeat_interval: Duration::from_secs(env_u64(
                "AGENT_SSE_HEARTBEAT_INTERVAL",
                defaults.agent_sse_heartbeat_interval.as_secs(),
            )),
            agent_sse_hard_timeout: Duration::from_secs(env_u64(
                "AGENT_SSE_HARD_TIMEOUT",
                defaults.agent_sse_hard_timeout.as_secs(),
            )),
            agent_stuck_run_threshold: Duration::from_secs(env_u64(
                "AGENT_STUCK_RUN_THRESHOLD",
                defaults.agent_stuck_run_threshold.as_secs(),
            )),
            agent_delta_batch_ms: Duration::from_millis(env_u64(
                "AGENT_DELTA_BATCH_MS",
                defaults.agent_delta_batch_ms.as_millis() as u64,
            )),
            llm_model: env_string("LLM_MODEL"),
            llm_max_tokens: env_string("LLM_MAX_TOKENS").and_then(|v| v.parse().ok()),
            web_search_enabled: env_bool("WEB_SEARCH_ENABLED", defaults.web_search_enabled),
            web_search_provider: env_string("WEB_SEARCH_PROVIDER"),
            web_search_api_key: env_string("WEB_SEARCH_API_KEY"),
            web_search_topk: env_u64("WEB_SEARCH_TOPK", defaults.web_search_topk),
            web_cache_ttl_hours: env_u64("WEB_CACHE_TTL_HOURS", defaults.web_cache_ttl_hours),
            history_window: env_u64("AGENT_HISTORY_WINDOW", defaults.history_window as u64) as usize,
        }
    }
}
