//! Coordinator configuration with layered overrides
//!
//! Resolution order: built-in defaults, then `coordinator.json` in the
//! runtime root, then environment variables, then caller-supplied overrides.
//! Env values are clamped to explicit bounds and fall back to the default
//! when malformed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{env_flag, env_parse};

use super::fsio;
use super::paths::RuntimePaths;

/// Resolved coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CoordinatorConfig {
    /// Shared LLM parallelism budget across all instances on this host
    pub total_max_llm: usize,

    /// Heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,

    /// A record older than this is considered dead
    pub heartbeat_timeout_ms: u64,

    /// Kill switch for work stealing
    pub disable_work_stealing: bool,

    /// TTL for the per-donor steal lock
    pub steal_lock_ttl_ms: u64,

    /// A peer qualifies as a steal donor above this pending count
    pub steal_min_peer_pending: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            total_max_llm: 6,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 60_000,
            disable_work_stealing: false,
            steal_lock_ttl_ms: 30_000,
            steal_min_peer_pending: 2,
        }
    }
}

/// Partial overlay, used both for `coordinator.json` and caller overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CoordinatorOverrides {
    pub total_max_llm: Option<usize>,
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub disable_work_stealing: Option<bool>,
    pub steal_lock_ttl_ms: Option<u64>,
    pub steal_min_peer_pending: Option<usize>,
}

impl CoordinatorConfig {
    /// Resolve the full layering for a runtime root
    pub async fn load(paths: &RuntimePaths, overrides: Option<CoordinatorOverrides>) -> Self {
        let mut config = Self::default();

        if let Some(file) = fsio::read_json::<CoordinatorOverrides>(&paths.config_file()).await {
            debug!(path = %paths.config_file().display(), "applying coordinator.json overrides");
            config.apply(&file);
        }

        config.apply_env();

        if let Some(caller) = overrides {
            config.apply(&caller);
        }

        config
    }

    /// Apply an overlay in place
    pub fn apply(&mut self, overlay: &CoordinatorOverrides) {
        if let Some(v) = overlay.total_max_llm {
            self.total_max_llm = v.clamp(1, 64);
        }
        if let Some(v) = overlay.heartbeat_interval_ms {
            self.heartbeat_interval_ms = v.clamp(1_000, 300_000);
        }
        if let Some(v) = overlay.heartbeat_timeout_ms {
            self.heartbeat_timeout_ms = v.clamp(5_000, 3_600_000);
        }
        if let Some(v) = overlay.disable_work_stealing {
            self.disable_work_stealing = v;
        }
        if let Some(v) = overlay.steal_lock_ttl_ms {
            self.steal_lock_ttl_ms = v.clamp(1_000, 600_000);
        }
        if let Some(v) = overlay.steal_min_peer_pending {
            self.steal_min_peer_pending = v;
        }
    }

    /// Apply environment variables with clamping
    pub fn apply_env(&mut self) {
        self.total_max_llm = env_parse("PI_TOTAL_MAX_LLM", self.total_max_llm, 1, 64);
        self.heartbeat_interval_ms = env_parse("PI_HEARTBEAT_INTERVAL_MS", self.heartbeat_interval_ms, 1_000, 300_000);
        self.heartbeat_timeout_ms = env_parse("PI_HEARTBEAT_TIMEOUT_MS", self.heartbeat_timeout_ms, 5_000, 3_600_000);
        self.disable_work_stealing = env_flag("PI_DISABLE_WORK_STEALING", self.disable_work_stealing);
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_interval_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_interval_ms as i64)
    }

    pub fn heartbeat_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_timeout_ms as i64)
    }

    pub fn steal_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.steal_lock_ttl_ms)
    }
}
