//! Configuration types and loading
//!
//! Everything is resolved once at startup into an immutable [`Config`] that
//! downstream components take by value or reference; nothing reads the
//! environment after load. File resolution follows the fallback chain:
//! explicit path, then `.piloop.yml` in the working directory, then
//! `~/.config/piloop/piloop.yml`, then built-in defaults. Environment
//! variables are applied on top, clamped to explicit bounds with fallback to
//! the default when malformed.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorOverrides;

/// Parse an env var, clamping parsed values into `[min, max]` and falling
/// back to `default` when the variable is unset or malformed
pub(crate) fn env_parse<T>(name: &str, default: T, min: T, max: T) -> T
where
    T: FromStr + PartialOrd + Copy,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) if v < min => min,
            Ok(v) if v > max => max,
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(%name, %raw, "ignoring malformed env value");
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a boolean-ish env var (`0/1/true/false`, case-insensitive)
pub(crate) fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                tracing::warn!(%name, %raw, "ignoring malformed env flag");
                default
            }
        },
        Err(_) => default,
    }
}

/// Backoff jitter strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    /// Delay drawn uniformly from `[0, computed]`
    #[default]
    Full,
    /// Half fixed, half uniform
    Partial,
    /// Exact exponential delays
    None,
}

impl FromStr for JitterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "partial" => Ok(Self::Partial),
            "none" => Ok(Self::None),
            _ => Err(format!("Unknown jitter mode: {}", s)),
        }
    }
}

/// Retry and backoff policy for model calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetrySettings {
    /// Attempts after the first failure for transient errors
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: JitterMode,

    /// Rate-limited attempts get their own, more patient budget
    pub max_rate_limit_retries: u32,
    pub max_rate_limit_wait_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: JitterMode::Full,
            max_rate_limit_retries: 5,
            max_rate_limit_wait_ms: 300_000,
        }
    }
}

impl RetrySettings {
    pub fn apply_env(&mut self) {
        self.max_retries = env_parse("PI_LOOP_MAX_RETRIES", self.max_retries, 0, 10);
        self.initial_delay_ms = env_parse("PI_LOOP_INITIAL_DELAY_MS", self.initial_delay_ms, 100, 60_000);
        self.max_delay_ms = env_parse("PI_LOOP_MAX_DELAY_MS", self.max_delay_ms, 1_000, 600_000);
        self.backoff_multiplier = env_parse("PI_LOOP_BACKOFF_MULTIPLIER", self.backoff_multiplier, 1.0, 10.0);
        self.max_rate_limit_retries = env_parse("PI_LOOP_MAX_RATE_LIMIT_RETRIES", self.max_rate_limit_retries, 0, 20);
        self.max_rate_limit_wait_ms =
            env_parse("PI_LOOP_MAX_RATE_LIMIT_WAIT_MS", self.max_rate_limit_wait_ms, 1_000, 3_600_000);
        if let Ok(raw) = std::env::var("PI_LOOP_JITTER") {
            match raw.parse::<JitterMode>() {
                Ok(mode) => self.jitter = mode,
                Err(_) => tracing::warn!(%raw, "ignoring malformed PI_LOOP_JITTER"),
            }
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.max_rate_limit_wait_ms)
    }
}

/// Adaptive rate-controller tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateControlSettings {
    /// Sliding window for recent rejections, in seconds
    pub rejection_window_secs: u64,

    /// Consecutive successes before the adaptive limit recovers one step
    pub recovery_threshold: u32,

    /// Recent rejections at or above this set `should_throttle`
    pub high_rejection_threshold: usize,
}

impl Default for RateControlSettings {
    fn default() -> Self {
        Self {
            rejection_window_secs: 300,
            recovery_threshold: 5,
            high_rejection_threshold: 3,
        }
    }
}

impl RateControlSettings {
    pub fn apply_env(&mut self) {
        self.high_rejection_threshold =
            env_parse("PI_LOOP_HIGH_REJECTION_THRESHOLD", self.high_rejection_threshold, 1, 100);
    }

    pub fn rejection_window(&self) -> Duration {
        Duration::from_secs(self.rejection_window_secs)
    }
}

/// Loop pacing and heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoopSettings {
    pub min_cycle_interval_ms: u64,
    pub max_cycle_interval_ms: u64,
    pub perspective_delay_ms: u64,

    /// Mean score at which a run is considered converged
    pub target_score: f64,

    /// Stagnation sensitivity: variance below `(1 - threshold) * 0.1` counts
    pub stagnation_threshold: f64,
    pub max_stagnation_count: u32,

    /// Cycles scoring at least this become reusable success patterns
    pub success_pattern_min_score: f64,

    /// Cycles scoring at least this skip the detailed verification passes
    pub skip_verification_min_score: f64,

    /// Minimum confidence for patterns from the integrated detection pass
    pub min_pattern_confidence: f64,

    /// Trailing cycle summaries included in prompts
    pub summary_window: usize,
    pub max_improvement_actions: usize,
    pub max_success_patterns_in_prompt: usize,

    /// UL mode
    pub ul_max_phase_retries: u32,
    pub ul_phase_completion_min_chars: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            min_cycle_interval_ms: 2_000,
            max_cycle_interval_ms: 60_000,
            perspective_delay_ms: 500,
            target_score: 0.95,
            stagnation_threshold: 0.8,
            max_stagnation_count: 3,
            success_pattern_min_score: 0.75,
            skip_verification_min_score: 0.75,
            min_pattern_confidence: 0.6,
            summary_window: 3,
            max_improvement_actions: 5,
            max_success_patterns_in_prompt: 3,
            ul_max_phase_retries: 3,
            ul_phase_completion_min_chars: 200,
        }
    }
}

impl LoopSettings {
    pub fn apply_env(&mut self) {
        self.min_cycle_interval_ms = env_parse("PI_LOOP_MIN_CYCLE_INTERVAL_MS", self.min_cycle_interval_ms, 0, 600_000);
        self.max_cycle_interval_ms =
            env_parse("PI_LOOP_MAX_CYCLE_INTERVAL_MS", self.max_cycle_interval_ms, 1_000, 3_600_000);
        self.perspective_delay_ms = env_parse("PI_LOOP_PERSPECTIVE_DELAY_MS", self.perspective_delay_ms, 0, 60_000);
        self.ul_max_phase_retries = env_parse("PI_UL_MAX_PHASE_RETRIES", self.ul_max_phase_retries, 0, 10);
        self.ul_phase_completion_min_chars = env_parse(
            "PI_UL_PHASE_COMPLETION_MIN_CHARS",
            self.ul_phase_completion_min_chars,
            0,
            100_000,
        );
    }

    pub fn min_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.min_cycle_interval_ms)
    }

    pub fn max_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.max_cycle_interval_ms)
    }

    pub fn perspective_delay(&self) -> Duration {
        Duration::from_millis(self.perspective_delay_ms)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Caller-layer overrides for the coordinator (merged over
    /// `coordinator.json` and env at registration time)
    pub coordinator: CoordinatorOverrides,

    #[serde(rename = "loop")]
    pub loop_settings: LoopSettings,

    pub retry: RetrySettings,

    pub rate: RateControlSettings,
}

impl Config {
    /// Load with the fallback chain, then apply environment variables
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_layer(config_path)?;
        config.loop_settings.apply_env();
        config.retry.apply_env();
        config.rate.apply_env();
        Ok(config)
    }

    fn load_file_layer(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".piloop.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("piloop").join("piloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
