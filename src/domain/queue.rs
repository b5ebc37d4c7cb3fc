//! Queue-state broadcast records
//!
//! Each instance publishes a small JSON snapshot of its queue so idle peers
//! can discover surplus work. Readers drop snapshots older than twice the
//! heartbeat interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::InstanceId;
use super::priority::StealPriority;

/// Upper bound on published stealable entries per instance
pub const MAX_STEALABLE_ENTRIES: usize = 20;

/// A queue entry a busy instance is willing to hand to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StealableEntry {
    pub id: String,
    pub tool_name: String,
    pub priority: StealPriority,
    pub instance_id: InstanceId,
    pub enqueued_at: DateTime<Utc>,

    /// Expected duration, when the donor can estimate it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,

    /// Orchestration round the entry belongs to, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
}

/// Snapshot of one instance's queue, broadcast on workload changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStateBroadcast {
    pub instance_id: InstanceId,
    pub timestamp: DateTime<Utc>,
    pub pending_task_count: usize,
    pub active_orchestrations: usize,
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub stealable_entries: Vec<StealableEntry>,
}

impl QueueStateBroadcast {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            timestamp: Utc::now(),
            pending_task_count: 0,
            active_orchestrations: 0,
            avg_latency_ms: 0.0,
            stealable_entries: Vec::new(),
        }
    }

    /// Stale snapshots are ignored by readers
    pub fn is_stale(&self, now: DateTime<Utc>, heartbeat_interval: chrono::Duration) -> bool {
        now - self.timestamp > heartbeat_interval * 2
    }

    /// Cap the stealable list at the published bound, highest priority first
    pub fn truncate_stealable(&mut self) {
        self.stealable_entries
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));
        self.stealable_entries.truncate(MAX_STEALABLE_ENTRIES);
    }
}
