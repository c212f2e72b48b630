//! Configuration for the orchestration protocol.
//!
//! Every bound the protocol leaves open is an explicit constant here rather
//! than an inferred magic number: retry economics, the fallback trigger, the
//! tool fan-out, the loop iteration cap, and the client watchdog ceiling.

use std::time::Duration;

use crate::types::ModelId;

/// Crate-wide configuration, shared by the run loop and the client session.
#[derive(Debug, Clone)]
pub struct KestrelConfig {
    /// Model used for every run until a fallback is triggered.
    pub primary_model: ModelId,
    /// Model switched to (at most once per run) when the primary degrades.
    pub fallback_model: ModelId,
    /// Maximum provider call attempts per model turn (including the first).
    pub max_attempts: u32,
    /// Attempt count at which the gateway switches to the fallback model.
    pub fallback_after_attempts: u32,
    /// Initial backoff before the first retry.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Backoff multiplier between attempts.
    pub backoff_multiplier: f64,
    /// Maximum model↔tool round trips per run.
    pub max_tool_iterations: usize,
    /// Concurrent tool executions within a single turn.
    pub tool_concurrency: usize,
    /// Per-tool-call execution ceiling.
    pub tool_timeout: Duration,
    /// Idle ceiling between provider stream deltas, in milliseconds.
    /// Zero disables the idle check.
    pub stream_idle_timeout_ms: u64,
    /// Client-side ceiling for a run stuck in `streaming` with no tracked
    /// transport.
    pub watchdog_ceiling: Duration,
}

impl Default for KestrelConfig {
    fn default() -> Self {
        Self {
            primary_model: ModelId::new("atlas-pro"),
            fallback_model: ModelId::new("atlas-lite"),
            max_attempts: 4,
            fallback_after_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_tool_iterations: 8,
            tool_concurrency: 4,
            tool_timeout: Duration::from_secs(30),
            stream_idle_timeout_ms: 120_000,
            watchdog_ceiling: Duration::from_secs(30),
        }
    }
}

impl KestrelConfig {
    /// Load configuration from `KESTREL_*` environment variables, with
    /// defaults for anything unset. Reads `.env` if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(model) = std::env::var("KESTREL_PRIMARY_MODEL") {
            config.primary_model = ModelId::new(model);
        }
        if let Ok(model) = std::env::var("KESTREL_FALLBACK_MODEL") {
            config.fallback_model = ModelId::new(model);
        }
        if let Some(n) = env_parse::<u32>("KESTREL_MAX_ATTEMPTS") {
            config.max_attempts = n;
        }
        if let Some(n) = env_parse::<u32>("KESTREL_FALLBACK_AFTER_ATTEMPTS") {
            config.fallback_after_attempts = n;
        }
        if let Some(ms) = env_parse::<u64>("KESTREL_INITIAL_BACKOFF_MS") {
            config.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("KESTREL_MAX_BACKOFF_MS") {
            config.max_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("KESTREL_MAX_TOOL_ITERATIONS") {
            config.max_tool_iterations = n;
        }
        if let Some(n) = env_parse::<usize>("KESTREL_TOOL_CONCURRENCY") {
            config.tool_concurrency = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("KESTREL_TOOL_TIMEOUT_MS") {
            config.tool_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("KESTREL_STREAM_IDLE_TIMEOUT_MS") {
            config.stream_idle_timeout_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("KESTREL_WATCHDOG_CEILING_MS") {
            config.watchdog_ceiling = Duration::from_millis(ms);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_fallback_before_exhaustion() {
        let config = KestrelConfig::default();
        assert!(config.fallback_after_attempts < config.max_attempts);
        assert!(config.tool_concurrency >= 1);
        assert!(config.max_tool_iterations >= 1);
    }
}
