//! On-disk instance record
//!
//! One record per live agent process, persisted as a small JSON file under
//! the instance-registry directory. Only the owning process writes its own
//! record; peers read it and may delete it once it has expired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::id::InstanceId;

/// A (provider, model) pair an instance currently has in use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveModel {
    pub provider: String,
    pub model_id: String,
    pub since: DateTime<Utc>,
}

/// Persisted record for a single live agent instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub process_id: u32,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub working_dir: PathBuf,

    /// Models currently marked active by this instance
    #[serde(default)]
    pub active_models: Vec<ActiveModel>,

    /// Workload telemetry, refreshed alongside the heartbeat
    #[serde(default)]
    pub pending_task_count: usize,
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub last_task_completed_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Create a fresh record for this process
    pub fn new(session_id: impl Into<String>, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            instance_id: InstanceId::new(),
            process_id: std::process::id(),
            session_id: session_id.into(),
            started_at: now,
            last_heartbeat_at: now,
            working_dir,
            active_models: Vec::new(),
            pending_task_count: 0,
            avg_latency_ms: 0.0,
            last_task_completed_at: None,
        }
    }

    /// A record is alive iff its heartbeat is younger than the timeout
    pub fn is_alive(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat_at < heartbeat_timeout
    }

    /// Mark a model active, replacing any previous entry for the same pair
    pub fn set_active_model(&mut self, provider: &str, model_id: &str) {
        self.clear_active_model(provider, model_id);
        self.active_models.push(ActiveModel {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            since: Utc::now(),
        });
    }

    /// Remove a model from the active set (no-op when absent)
    pub fn clear_active_model(&mut self, provider: &str, model_id: &str) {
        self.active_models
            .retain(|m| !(m.provider == provider && m.model_id == model_id));
    }

    pub fn has_active_model(&self, provider: &str, model_id: &str) -> bool {
        self.active_models
            .iter()
            .any(|m| m.provider == provider && m.model_id == model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_alive() {
        let rec = InstanceRecord::new("session-1", PathBuf::from("/tmp"));
        assert!(rec.is_alive(Utc::now(), chrono::Duration::seconds(60)));
        assert_eq!(rec.process_id, std::process::id());
    }

    #[test]
    fn test_expired_record_is_dead() {
        let mut rec = InstanceRecord::new("session-1", PathBuf::from("/tmp"));
        rec.last_heartbeat_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(!rec.is_alive(Utc::now(), chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_active_model_set_is_idempotent() {
        let mut rec = InstanceRecord::new("session-1", PathBuf::from("/tmp"));
        rec.set_active_model("anthropic", "claude-sonnet-4");
        rec.set_active_model("anthropic", "claude-sonnet-4");
        assert_eq!(rec.active_models.len(), 1);
        assert!(rec.has_active_model("anthropic", "claude-sonnet-4"));

        rec.clear_active_model("anthropic", "claude-sonnet-4");
        assert!(!rec.has_active_model("anthropic", "claude-sonnet-4"));
        assert!(rec.active_models.is_empty());
    }

    #[test]
    fn test_record_json_roundtrip() {
        let mut rec = InstanceRecord::new("session-1", PathBuf::from("/work"));
        rec.set_active_model("openai", "gpt-5");
        rec.pending_task_count = 3;

        let json = serde_json::to_string(&rec).unwrap();
        let back: InstanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, rec.instance_id);
        assert_eq!(back.pending_task_count, 3);
        assert_eq!(back.active_models, rec.active_models);
    }
}
