//! Per-subsystem configuration records with compiled-in defaults.
//!
//! One record per subsystem, aggregated into [`EngineConfig`]. An optional
//! `mindex.toml` in the data root overrides individual fields; everything it
//! omits keeps its default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Retry policy (one place, not per call site)
// ---------------------------------------------------------------------------

/// Bounded exponential backoff shared by provider calls and pipeline retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: u32,
    /// Cumulative per-task ceiling across all attempts.
    pub task_deadline_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 250, factor: 2, task_deadline_secs: 120 }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt, capped at 30 s.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.base_delay_ms.saturating_mul(u64::from(self.factor).pow(exp));
        Duration::from_millis(ms.min(30_000))
    }
}

// ---------------------------------------------------------------------------
// Subsystem records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLITE_BUSY retry attempts before surfacing `Busy`.
    pub busy_max_attempts: u32,
    pub busy_base_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { busy_max_attempts: 5, busy_base_delay_ms: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Default throttle window for progress events.
    pub throttle_ms: u64,
    /// Default debounce window for coalesced refresh events.
    pub debounce_ms: u64,
    /// Default buffer capacity before a forced flush.
    pub buffer_capacity: usize,
    /// Buffer flush timer.
    pub buffer_flush_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { throttle_ms: 1_000, debounce_ms: 800, buffer_capacity: 32, buffer_flush_ms: 2_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Candidate channel bound; the walker blocks when screening lags.
    pub channel_capacity: usize,
    /// Re-walk cadence when the OS watcher is lost.
    pub fallback_rescan_secs: u64,
    /// Watcher event debounce.
    pub watch_debounce_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { channel_capacity: 1_024, fallback_rescan_secs: 300, watch_debounce_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Files at or below this size skip hashing entirely.
    pub small_file_threshold: u64,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self { small_file_threshold: 4 * 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggingConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Excerpt handed to the structured-output model.
    pub excerpt_bytes: usize,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self { workers: 2, queue_capacity: 256, excerpt_bytes: 4 * 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorizeConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub parent_max_tokens: usize,
    pub child_max_tokens: usize,
    pub child_overlap_tokens: usize,
}

impl Default for VectorizeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 512,
            parent_max_tokens: 1_600,
            child_max_tokens: 320,
            child_overlap_tokens: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub semantic_weight: f32,
    pub lexical_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 12, semantic_weight: 0.7, lexical_weight: 0.3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Loopback only unless the host says otherwise.
    pub bind_addr: String,
    /// 0 = auto-scan from `port_base`.
    pub port: u16,
    pub port_base: u16,
    pub port_range: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1".to_string(), port: 0, port_base: 8710, port_range: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderNetConfig {
    /// Per-call deadline for provider HTTP.
    pub request_timeout_secs: u64,
    /// User-configured proxy, applied to providers with `use_proxy`.
    pub proxy_url: Option<String>,
}

impl Default for ProviderNetConfig {
    fn default() -> Self {
        Self { request_timeout_secs: 30, proxy_url: None }
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// Everything the engine needs, resolved at startup and passed by value to
/// each subsystem at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(skip)]
    pub data_root: PathBuf,
    pub store: StoreConfig,
    pub events: EventBusConfig,
    pub scanner: ScannerConfig,
    pub screening: ScreeningConfig,
    pub tagging: TaggingConfig,
    pub vectorize: VectorizeConfig,
    pub retrieval: RetrievalConfig,
    pub http: HttpConfig,
    pub provider_net: ProviderNetConfig,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::new(),
            store: StoreConfig::default(),
            events: EventBusConfig::default(),
            scanner: ScannerConfig::default(),
            screening: ScreeningConfig::default(),
            tagging: TaggingConfig::default(),
            vectorize: VectorizeConfig::default(),
            retrieval: RetrievalConfig::default(),
            http: HttpConfig::default(),
            provider_net: ProviderNetConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_root`, overlaid with `<data_root>/mindex.toml`
    /// when present. A malformed file is reported, not fatal.
    pub fn load(data_root: &Path) -> Self {
        let mut config = match std::fs::read_to_string(data_root.join("mindex.toml")) {
            Ok(raw) => match toml::from_str::<EngineConfig>(&raw) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed mindex.toml");
                    EngineConfig::default()
                }
            },
            Err(_) => EngineConfig::default(),
        };
        config.data_root = data_root.to_path_buf();
        config
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_root.join("db")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.data_root.join("vectors")
    }

    pub fn builtin_models_dir(&self) -> PathBuf {
        self.data_root.join("builtin_models")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = EngineConfig::default();
        assert!(c.vectorize.child_max_tokens < c.vectorize.parent_max_tokens);
        assert!(c.vectorize.child_overlap_tokens < c.vectorize.child_max_tokens);
        assert!((c.retrieval.semantic_weight + c.retrieval.lexical_weight - 1.0).abs() < 1e-6);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_millis(250));
        assert_eq!(p.delay_for(2), Duration::from_millis(500));
        assert!(p.delay_for(20) <= Duration::from_millis(30_000));
    }

    #[test]
    fn overlay_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mindex.toml"), "[retrieval]\ntop_k = 5\n").unwrap();
        let c = EngineConfig::load(dir.path());
        assert_eq!(c.retrieval.top_k, 5);
        assert_eq!(c.vectorize.parent_max_tokens, 1_600);
        assert_eq!(c.data_root, dir.path());
    }
}
