//! Pipeline configuration.
//!
//! Mirrors the teacher crate's `ExecutionSettings` pattern: a plain struct
//! the embedder constructs and passes in, with `Default` covering every
//! field. The *core* does not read environment variables or config files
//! for its primary tunables (worker count, cache size/TTL, build timeout,
//! allowlisted commands) — per the spec, "None are defined by the core".
//!
//! A small number of `OnceLock`-backed env-var fallbacks exist for values
//! that are awkward to thread through every call site in tests, following
//! `BytecodeCache::global()`/`InterpreterPool::global()` in the teacher
//! crate, which read `PYEXEC_BYTECODE_CACHE_SIZE`/`PYEXEC_POOL_SIZE` once.

use std::sync::OnceLock;
use std::time::Duration;

/// Default build timeout when none is configured: 5 minutes.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default worker thread count when [`PipelineConfig::worker_count`] is 0.
fn default_worker_count() -> usize {
    static CACHED: OnceLock<usize> = OnceLock::new();
    *CACHED.get_or_init(|| {
        std::env::var("TEMPLAR_POOL_DEFAULT_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(4)
    })
}

/// Configuration governing one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of worker threads. `0` resolves to [`default_worker_count`].
    pub worker_count: usize,
    /// Maximum bytes the LRU+TTL cache may hold.
    pub cache_max_bytes: u64,
    /// Time-to-live for cache entries.
    pub cache_ttl: Duration,
    /// Per-build deadline for the external generator. `None` resolves to
    /// [`DEFAULT_BUILD_TIMEOUT`].
    pub build_timeout: Option<Duration>,
    /// Capacity of the normal-priority task channel.
    pub task_queue_capacity: usize,
    /// Capacity of the high-priority task channel.
    pub priority_queue_capacity: usize,
    /// Capacity of the results channel.
    pub results_queue_capacity: usize,
    /// Allowlisted command names the invoker may execute.
    pub allowed_commands: Vec<String>,
    /// Fixed arguments passed to the generator on every invocation.
    pub generator_args: Vec<String>,
}

impl PipelineConfig {
    /// Resolves [`Self::worker_count`], applying the `0` → default rule.
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            default_worker_count()
        } else {
            self.worker_count
        }
    }

    /// Resolves [`Self::build_timeout`], applying the `None` → 5 minute rule.
    pub fn resolved_build_timeout(&self) -> Duration {
        match self.build_timeout {
            Some(d) if d > Duration::ZERO => d,
            _ => DEFAULT_BUILD_TIMEOUT,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            cache_max_bytes: 64 * 1024 * 1024,
            cache_ttl: Duration::from_secs(10 * 60),
            build_timeout: None,
            task_queue_capacity: 100,
            priority_queue_capacity: 10,
            results_queue_capacity: 100,
            allowed_commands: vec!["templar-generate".to_string()],
            generator_args: vec!["generate".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_resolves_build_timeout_to_five_minutes() {
        let config = PipelineConfig::default();
        assert_eq!(config.resolved_build_timeout(), DEFAULT_BUILD_TIMEOUT);
    }

    #[test]
    fn test_explicit_positive_build_timeout_is_used_unchanged() {
        let config = PipelineConfig {
            build_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        assert_eq!(config.resolved_build_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_worker_count_resolves_to_a_positive_default() {
        let config = PipelineConfig { worker_count: 0, ..Default::default() };
        assert!(config.resolved_worker_count() > 0);
    }

    #[test]
    fn test_explicit_worker_count_is_used_unchanged() {
        let config = PipelineConfig { worker_count: 7, ..Default::default() };
        assert_eq!(config.resolved_worker_count(), 7);
    }
}
