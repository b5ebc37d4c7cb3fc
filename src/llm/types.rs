//! Model request types and timeout math

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Thinking budget requested for a call; scales the per-attempt timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[serde(rename = "none")]
    Off,
    Low,
    #[default]
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn timeout_multiplier(&self) -> f64 {
        match self {
            Self::Off => 1.0,
            Self::Low => 1.5,
            Self::Medium => 2.0,
            Self::High => 3.0,
        }
    }
}

/// One model invocation as the host exposes it
#[derive(Clone)]
pub struct ModelRequest {
    pub provider: String,
    pub model_id: String,
    pub thinking_level: ThinkingLevel,
    pub prompt: String,

    /// Per-attempt timeout; a retry wrapper re-arms this for every attempt
    pub timeout: Duration,
    pub cancel: CancellationToken,

    /// Short human-readable purpose, used in logs
    pub label: String,
}

impl ModelRequest {
    pub fn new(provider: &str, model_id: &str, prompt: impl Into<String>) -> Self {
        let thinking_level = ThinkingLevel::default();
        Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            thinking_level,
            prompt: prompt.into(),
            timeout: model_timeout(model_id, thinking_level),
            cancel: CancellationToken::new(),
            label: String::new(),
        }
    }

    pub fn with_thinking(mut self, level: ThinkingLevel) -> Self {
        self.thinking_level = level;
        self.timeout = model_timeout(&self.model_id, level);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl std::fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRequest")
            .field("provider", &self.provider)
            .field("model_id", &self.model_id)
            .field("thinking_level", &self.thinking_level)
            .field("prompt_len", &self.prompt.len())
            .field("timeout", &self.timeout)
            .field("label", &self.label)
            .finish()
    }
}

/// Per-attempt timeout: a model-family baseline scaled by thinking level
pub fn model_timeout(model_id: &str, thinking: ThinkingLevel) -> Duration {
    let lower = model_id.to_lowercase();
    let baseline_secs: u64 = if lower.contains("opus") {
        180
    } else if lower.contains("sonnet") {
        120
    } else if lower.contains("haiku") || lower.contains("mini") {
        60
    } else {
        90
    };
    Duration::from_secs_f64(baseline_secs as f64 * thinking.timeout_multiplier())
}
