//! Instance registry, heartbeat and capacity math
//!
//! Each agent process registers one record under the instances directory and
//! keeps it fresh with a periodic heartbeat. Peers observe each other purely
//! through these files; capacity is divided among records that are alive.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use eyre::Result;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{InstanceId, InstanceRecord};

use super::config::CoordinatorConfig;
use super::fsio;
use super::lock::LockManager;
use super::paths::RuntimePaths;
use super::stealing::StealingStats;

/// Process-wide view of the peer registry, owned by the registering process
pub struct InstanceCoordinator {
    pub(super) config: CoordinatorConfig,
    pub(super) paths: RuntimePaths,
    pub(super) locks: LockManager,
    pub(super) record: Mutex<InstanceRecord>,
    pub(super) stealing: Mutex<StealingStats>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    unregistered: AtomicBool,
}

impl InstanceCoordinator {
    /// Register this process: write the instance record and start the
    /// heartbeat timer
    ///
    /// The heartbeat task holds only a `Weak` reference, so it neither keeps
    /// the coordinator alive nor the process running once the last strong
    /// reference is dropped.
    pub async fn register(
        session_id: &str,
        working_dir: PathBuf,
        paths: RuntimePaths,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>> {
        let record = InstanceRecord::new(session_id, working_dir);
        let instance_id = record.instance_id.clone();
        fsio::write_json_atomic(&paths.instance_file(&instance_id), &record).await?;

        let coordinator = Arc::new(Self {
            locks: LockManager::new(paths.clone()),
            config,
            paths,
            record: Mutex::new(record),
            stealing: Mutex::new(StealingStats::default()),
            heartbeat_task: Mutex::new(None),
            unregistered: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&coordinator);
        let interval = coordinator.config.heartbeat_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let Some(me) = weak.upgrade() else { break };
                if me.unregistered.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = me.enhanced_heartbeat().await {
                    warn!(error = %e, "heartbeat pass failed");
                }
            }
        });
        *coordinator.heartbeat_task.lock().await = Some(task);

        info!(instance_id = %instance_id, "instance registered");
        Ok(coordinator)
    }

    pub async fn instance_id(&self) -> InstanceId {
        self.record.lock().await.instance_id.clone()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Stop the heartbeat and remove this instance's files (idempotent)
    pub async fn unregister(&self) -> Result<()> {
        if self.unregistered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }

        let record = self.record.lock().await;
        fsio::remove_if_exists(&self.paths.instance_file(&record.instance_id)).await?;
        fsio::remove_if_exists(&self.paths.queue_state_file(&record.instance_id)).await?;
        info!(instance_id = %record.instance_id, "instance unregistered");
        Ok(())
    }

    /// Refresh this instance's heartbeat timestamp on disk
    ///
    /// Recreates the file from the in-memory record (preserving
    /// `instance_id` and `started_at`) when a peer's cleanup removed it.
    pub async fn heartbeat(&self) -> Result<()> {
        if self.unregistered.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut record = self.record.lock().await;
        record.last_heartbeat_at = Utc::now();
        fsio::write_json_atomic(&self.paths.instance_file(&record.instance_id), &*record).await
    }

    /// The periodic composite pass: heartbeat, then registry, queue-state
    /// and lock cleanup
    pub async fn enhanced_heartbeat(&self) -> Result<()> {
        self.heartbeat().await?;
        self.cleanup_dead_instances().await?;
        self.cleanup_queue_states().await?;
        self.locks.cleanup_expired().await?;
        Ok(())
    }

    /// Remove expired, corrupt and dead-pid records of peers
    pub async fn cleanup_dead_instances(&self) -> Result<usize> {
        let own_id = self.record.lock().await.instance_id.clone();
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout_chrono();
        let mut removed = 0;

        for path in fsio::list_files(&self.paths.instances_dir()).await {
            match fsio::read_json::<InstanceRecord>(&path).await {
                Some(record) if record.instance_id == own_id => {}
                Some(record) => {
                    let expired = !record.is_alive(now, timeout);
                    let dead_pid = !process_alive(record.process_id);
                    if (expired || dead_pid) && fsio::remove_if_exists(&path).await? {
                        debug!(instance_id = %record.instance_id, expired, dead_pid, "removed dead instance record");
                        removed += 1;
                    }
                }
                None => {
                    if fsio::remove_if_exists(&path).await? {
                        warn!(path = %path.display(), "removed corrupt instance record");
                        removed += 1;
                    }
                }
            }
        }

        Ok(removed)
    }

    /// All currently-alive records, always including this instance
    pub async fn get_active_instances(&self) -> Vec<InstanceRecord> {
        let own = self.record.lock().await.clone();
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout_chrono();

        let mut records = Vec::new();
        for path in fsio::list_files(&self.paths.instances_dir()).await {
            if let Some(record) = fsio::read_json::<InstanceRecord>(&path).await
                && record.instance_id != own.instance_id
                && record.is_alive(now, timeout)
            {
                records.push(record);
            }
        }

        // The in-memory copy of our own record is authoritative even when a
        // peer's cleanup just deleted the file.
        records.push(own);
        records.sort_by(|a, b| a.instance_id.as_str().cmp(b.instance_id.as_str()));
        records
    }

    /// Number of alive instances, never below 1
    pub async fn get_active_instance_count(&self) -> usize {
        self.get_active_instances().await.len().max(1)
    }

    /// Even split of the shared LLM budget, never below 1
    pub async fn get_parallel_limit(&self) -> usize {
        let count = self.get_active_instance_count().await;
        (self.config.total_max_llm / count).max(1)
    }

    /// Inverse-workload weighted share of the shared LLM budget
    ///
    /// Each instance weighs `1 / (pending + 1)`; shares are normalized so
    /// they sum to `total_max_llm`. Idle instances get proportionally more.
    pub async fn get_dynamic_parallel_limit(&self, my_pending: usize) -> usize {
        let own_id = self.record.lock().await.instance_id.clone();
        let instances = self.get_active_instances().await;

        let weight = |pending: usize| 1.0 / (pending as f64 + 1.0);
        let my_weight = weight(my_pending);
        let total_weight: f64 = instances
            .iter()
            .map(|r| {
                if r.instance_id == own_id {
                    my_weight
                } else {
                    weight(r.pending_task_count)
                }
            })
            .sum();

        if total_weight <= 0.0 {
            return 1;
        }

        let share = (self.config.total_max_llm as f64 * my_weight / total_weight).floor() as usize;
        share.max(1)
    }

    /// Mark a (provider, model) pair active for this instance
    pub async fn set_active_model(&self, provider: &str, model_id: &str) -> Result<()> {
        let mut record = self.record.lock().await;
        record.set_active_model(provider, model_id);
        fsio::write_json_atomic(&self.paths.instance_file(&record.instance_id), &*record).await
    }

    /// Clear a (provider, model) pair from this instance's active set
    pub async fn clear_active_model(&self, provider: &str, model_id: &str) -> Result<()> {
        let mut record = self.record.lock().await;
        record.clear_active_model(provider, model_id);
        fsio::write_json_atomic(&self.paths.instance_file(&record.instance_id), &*record).await
    }

    /// Alive instances with a matching model active, never below 1
    pub async fn get_active_instances_for_model(&self, provider: &str, model_query: &str) -> usize {
        let count = self
            .get_active_instances()
            .await
            .iter()
            .filter(|r| {
                r.active_models
                    .iter()
                    .any(|m| m.provider == provider && model_matches(model_query, &m.model_id))
            })
            .count();
        count.max(1)
    }

    /// Split a model-specific budget across the peers using that model
    pub async fn get_model_parallel_limit(&self, provider: &str, model_query: &str, base_limit: usize) -> usize {
        let users = self.get_active_instances_for_model(provider, model_query).await;
        (base_limit / users).max(1)
    }
}

/// Match a model query against an active model id
///
/// Supports exact equality, prefix matching, and glob patterns where every
/// regex metacharacter except `*` is escaped.
pub fn model_matches(query: &str, model_id: &str) -> bool {
    if query == model_id {
        return true;
    }
    if query.contains('*') {
        let escaped = regex::escape(query).replace("\\*", ".*");
        return Regex::new(&format!("^{}$", escaped))
            .map(|re| re.is_match(model_id))
            .unwrap_or(false);
    }
    model_id.starts_with(query)
}

#[cfg(unix)]
pub(super) fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub(super) fn process_alive(_pid: u32) -> bool {
    true
}
