//! Queue-state broadcasts and work stealing
//!
//! Busy instances publish their queue snapshots; idle instances scan them for
//! surplus work. Stealing is advisory: a thief serializes against other
//! thieves with a per-donor distributed lock, but the donor is never mutated —
//! its next broadcast shrinks its own queue.

use chrono::Utc;
use eyre::Result;
use std::time::Instant;
use tracing::{debug, warn};

use crate::domain::{InstanceRecord, QueueStateBroadcast, StealableEntry};

use super::fsio;
use super::registry::InstanceCoordinator;
use super::stealing::StealingStatsSnapshot;

/// Workload snapshot published by the owning instance
#[derive(Debug, Clone, Default)]
pub struct QueueStateUpdate {
    pub pending_task_count: usize,
    pub active_orchestrations: usize,
    pub avg_latency_ms: f64,
    pub stealable_entries: Vec<StealableEntry>,
}

impl InstanceCoordinator {
    /// Atomically rewrite this instance's queue-state file (and mirror the
    /// workload telemetry into the instance record)
    pub async fn broadcast_queue_state(&self, update: QueueStateUpdate) -> Result<()> {
        let mut record = self.record.lock().await;
        record.pending_task_count = update.pending_task_count;
        record.avg_latency_ms = update.avg_latency_ms;
        fsio::write_json_atomic(&self.paths.instance_file(&record.instance_id), &*record).await?;

        let mut broadcast = QueueStateBroadcast::new(record.instance_id.clone());
        broadcast.pending_task_count = update.pending_task_count;
        broadcast.active_orchestrations = update.active_orchestrations;
        broadcast.avg_latency_ms = update.avg_latency_ms;
        broadcast.stealable_entries = update.stealable_entries;
        broadcast.truncate_stealable();

        fsio::write_json_atomic(&self.paths.queue_state_file(&record.instance_id), &broadcast).await
    }

    /// Peer queue states, excluding this instance and anything stale
    /// (older than twice the heartbeat interval)
    pub async fn get_remote_queue_states(&self) -> Vec<QueueStateBroadcast> {
        let own_id = self.record.lock().await.instance_id.clone();
        let now = Utc::now();
        let interval = self.config.heartbeat_interval_chrono();

        let mut states = Vec::new();
        for path in fsio::list_files(&self.paths.queue_states_dir()).await {
            if let Some(state) = fsio::read_json::<QueueStateBroadcast>(&path).await
                && state.instance_id != own_id
                && !state.is_stale(now, interval)
            {
                states.push(state);
            }
        }
        states
    }

    /// Remove queue-state files that are stale, corrupt or orphaned (no
    /// live instance record behind them)
    pub async fn cleanup_queue_states(&self) -> Result<usize> {
        let own_id = self.record.lock().await.instance_id.clone();
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout_chrono();
        let mut removed = 0;

        for path in fsio::list_files(&self.paths.queue_states_dir()).await {
            let should_remove = match fsio::read_json::<QueueStateBroadcast>(&path).await {
                Some(state) if state.instance_id == own_id => false,
                Some(state) => {
                    let orphaned = fsio::read_json::<InstanceRecord>(&self.paths.instance_file(&state.instance_id))
                        .await
                        .is_none_or(|r| !r.is_alive(now, timeout));
                    orphaned && (now - state.timestamp) > timeout
                }
                None => true,
            };
            if should_remove && fsio::remove_if_exists(&path).await? {
                debug!(path = %path.display(), "removed stale queue state");
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// True iff this instance is idle and some peer has surplus work
    pub async fn should_attempt_stealing(&self) -> bool {
        if self.config.disable_work_stealing {
            return false;
        }
        if self.record.lock().await.pending_task_count > 0 {
            return false;
        }
        let threshold = self.config.steal_min_peer_pending;
        self.get_remote_queue_states()
            .await
            .iter()
            .any(|s| s.pending_task_count > threshold)
    }

    /// Pick the best stealable entry across all qualifying donors
    ///
    /// Candidates come from peers with surplus pending work; the winner is
    /// the highest-priority entry, earliest-enqueued on ties.
    pub async fn steal_work(&self) -> Option<StealableEntry> {
        let threshold = self.config.steal_min_peer_pending;
        let mut best: Option<StealableEntry> = None;

        for state in self.get_remote_queue_states().await {
            if state.pending_task_count <= threshold {
                continue;
            }
            for entry in state.stealable_entries {
                let better = match &best {
                    None => true,
                    Some(current) => {
                        entry.priority > current.priority
                            || (entry.priority == current.priority && entry.enqueued_at < current.enqueued_at)
                    }
                };
                if better {
                    best = Some(entry);
                }
            }
        }

        best
    }

    /// Steal with a per-donor distributed lock so concurrent thieves do not
    /// pile onto the same donor
    pub async fn safe_steal_work(&self) -> Result<Option<StealableEntry>> {
        if self.config.disable_work_stealing {
            return Ok(None);
        }

        let started = Instant::now();
        self.stealing.lock().await.record_attempt();

        let Some(candidate) = self.steal_work().await else {
            self.stealing.lock().await.record_failure();
            return Ok(None);
        };

        let resource = format!("steal:{}", candidate.instance_id);
        let lock = match self.locks.try_acquire(&resource, self.config.steal_lock_ttl()).await? {
            Some(lock) => lock,
            None => {
                debug!(%resource, "steal lock contended");
                self.stealing.lock().await.record_failure();
                return Ok(None);
            }
        };

        // Re-scan under the lock: the donor's broadcast may have changed
        // while we raced for the lock.
        let confirmed = self
            .steal_work()
            .await
            .filter(|e| e.instance_id == candidate.instance_id);

        if let Err(e) = self.locks.release(&lock).await {
            warn!(%resource, error = %e, "failed to release steal lock");
        }

        let mut stats = self.stealing.lock().await;
        match confirmed {
            Some(entry) => {
                stats.record_success(started.elapsed().as_secs_f64() * 1_000.0);
                Ok(Some(entry))
            }
            None => {
                stats.record_failure();
                Ok(None)
            }
        }
    }

    /// Snapshot of this instance's stealing counters
    pub async fn get_stealing_stats(&self) -> StealingStatsSnapshot {
        self.stealing.lock().await.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::config::CoordinatorConfig;
    use crate::coordinator::paths::RuntimePaths;
    use crate::domain::{InstanceId, StealPriority};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn registered(temp: &tempfile::TempDir) -> Arc<InstanceCoordinator> {
        InstanceCoordinator::register(
            "session-test",
            PathBuf::from("/tmp"),
            RuntimePaths::new(temp.path()),
            CoordinatorConfig::default(),
        )
        .await
        .unwrap()
    }

    fn entry(id: &str, donor: &str, priority: StealPriority) -> StealableEntry {
        StealableEntry {
            id: id.to_string(),
            tool_name: "subagent".to_string(),
            priority,
            instance_id: InstanceId::from_string(donor),
            enqueued_at: Utc::now(),
            estimated_duration_ms: None,
            round: None,
        }
    }

    async fn write_donor(paths: &RuntimePaths, donor: &str, pending: usize, entries: Vec<StealableEntry>) {
        let mut state = QueueStateBroadcast::new(InstanceId::from_string(donor));
        state.pending_task_count = pending;
        state.stealable_entries = entries;
        fsio::write_json_atomic(&paths.queue_state_file(&state.instance_id), &state)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_roundtrip_and_own_exclusion() {
        let temp = tempdir().unwrap();
        let coordinator = registered(&temp).await;

        coordinator
            .broadcast_queue_state(QueueStateUpdate {
                pending_task_count: 3,
                active_orchestrations: 1,
                avg_latency_ms: 250.0,
                stealable_entries: vec![],
            })
            .await
            .unwrap();

        // Own broadcast is filtered out of remote reads
        assert!(coordinator.get_remote_queue_states().await.is_empty());

        // Telemetry mirrored into the instance record
        let paths = RuntimePaths::new(temp.path());
        let record: InstanceRecord = fsio::read_json(&paths.instance_file(&coordinator.instance_id().await))
            .await
            .unwrap();
        assert_eq!(record.pending_task_count, 3);
    }

    #[tokio::test]
    async fn test_stale_broadcasts_are_ignored() {
        let temp = tempdir().unwrap();
        let coordinator = registered(&temp).await;
        let paths = RuntimePaths::new(temp.path());

        let mut state = QueueStateBroadcast::new(InstanceId::from_string("inst-old"));
        state.pending_task_count = 10;
        state.timestamp = Utc::now() - chrono::Duration::seconds(120);
        fsio::write_json_atomic(&paths.queue_state_file(&state.instance_id), &state)
            .await
            .unwrap();

        assert!(coordinator.get_remote_queue_states().await.is_empty());
        assert!(!coordinator.should_attempt_stealing().await);
    }

    #[tokio::test]
    async fn test_should_steal_requires_idle_self_and_busy_peer() {
        let temp = tempdir().unwrap();
        let coordinator = registered(&temp).await;
        let paths = RuntimePaths::new(temp.path());

        // No peers: nothing to steal
        assert!(!coordinator.should_attempt_stealing().await);

        write_donor(&paths, "inst-busy", 5, vec![]).await;
        assert!(coordinator.should_attempt_stealing().await);

        // Busy self: no stealing even with busy peers
        coordinator
            .broadcast_queue_state(QueueStateUpdate {
                pending_task_count: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!coordinator.should_attempt_stealing().await);
    }

    #[tokio::test]
    async fn test_peer_at_threshold_is_not_a_donor() {
        let temp = tempdir().unwrap();
        let coordinator = registered(&temp).await;
        let paths = RuntimePaths::new(temp.path());

        // pending == 2 is not "> 2"
        write_donor(&paths, "inst-borderline", 2, vec![entry("e", "inst-borderline", StealPriority::High)]).await;
        assert!(!coordinator.should_attempt_stealing().await);
        assert!(coordinator.steal_work().await.is_none());
    }

    #[tokio::test]
    async fn test_steal_picks_highest_priority_across_donors() {
        let temp = tempdir().unwrap();
        let coordinator = registered(&temp).await;
        let paths = RuntimePaths::new(temp.path());

        write_donor(
            &paths,
            "inst-a",
            4,
            vec![entry("normal-1", "inst-a", StealPriority::Normal)],
        )
        .await;
        write_donor(
            &paths,
            "inst-b",
            6,
            vec![
                entry("low-1", "inst-b", StealPriority::Low),
                entry("critical-1", "inst-b", StealPriority::Critical),
            ],
        )
        .await;

        let stolen = coordinator.steal_work().await.unwrap();
        assert_eq!(stolen.id, "critical-1");
    }

    #[tokio::test]
    async fn test_safe_steal_takes_and_releases_donor_lock() {
        let temp = tempdir().unwrap();
        let coordinator = registered(&temp).await;
        let paths = RuntimePaths::new(temp.path());

        write_donor(&paths, "inst-d", 5, vec![entry("e1", "inst-d", StealPriority::High)]).await;

        let stolen = coordinator.safe_steal_work().await.unwrap().unwrap();
        assert_eq!(stolen.id, "e1");

        let stats = coordinator.get_stealing_stats().await;
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.successes, 1);
        assert!(stats.last_success_at.is_some());

        // The steal lock was released
        let lock = coordinator
            .locks()
            .try_acquire("steal:inst-d", std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn test_safe_steal_backs_off_when_lock_held() {
        let temp = tempdir().unwrap();
        let coordinator = registered(&temp).await;
        let paths = RuntimePaths::new(temp.path());

        write_donor(&paths, "inst-d", 5, vec![entry("e1", "inst-d", StealPriority::High)]).await;

        // A competing thief holds the donor lock
        let _held = coordinator
            .locks()
            .try_acquire("steal:inst-d", std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let stolen = coordinator.safe_steal_work().await.unwrap();
        assert!(stolen.is_none());
        assert_eq!(coordinator.get_stealing_stats().await.failures, 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_orphaned_queue_state() {
        let temp = tempdir().unwrap();
        let coordinator = registered(&temp).await;
        let paths = RuntimePaths::new(temp.path());

        // Orphan: queue state older than the heartbeat timeout, no record
        let mut state = QueueStateBroadcast::new(InstanceId::from_string("inst-gone"));
        state.timestamp = Utc::now() - chrono::Duration::seconds(120);
        fsio::write_json_atomic(&paths.queue_state_file(&state.instance_id), &state)
            .await
            .unwrap();
        // Corrupt file
        tokio::fs::write(paths.queue_states_dir().join("junk.json"), "??")
            .await
            .unwrap();

        assert_eq!(coordinator.cleanup_queue_states().await.unwrap(), 2);
    }
}
