//! Run manager: the process-wide singleton owning the active run
//!
//! Exposes the three public operations (start, stop, status) both as plain
//! methods and as `ToolOutput`-shaped wrappers for host registration. At
//! most one run is active per process; stop goes through the stop-signal
//! file so any actor can request it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use eyre::{Result, bail};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::InstanceCoordinator;
use crate::host::{HostAgent, StartRunArgs, ToolDescriptor, ToolOutput};
use crate::llm::{ModelClient, ThinkingLevel};
use crate::rate::RateController;
use crate::vcs::Vcs;

use super::engine::{CycleEngine, EngineDeps};
use super::run_state::{LoopRunState, RunOptions, RunProgress};
use super::stop::StopSignal;
use super::ul::{UlDriver, UlDriverDeps};

/// Returned by a successful start
#[derive(Debug, Clone, Serialize)]
pub struct RunStartInfo {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub max_cycles: u32,
    pub ul_mode: bool,
    pub auto_approve: bool,
    pub log_path: PathBuf,
}

/// Structured status record
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trajectory_stats: Option<crate::r#loop::trajectory::TrajectoryStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<RunProgress>,
    pub rate_control: crate::rate::RateSummary,
    pub config: Config,
}

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<LoopRunState>,
    progress: Arc<StdMutex<RunProgress>>,
}

/// Dependencies shared by every run this manager starts
pub struct LoopManagerDeps {
    pub model: Arc<dyn ModelClient>,
    pub vcs: Arc<dyn Vcs>,
    pub rate: Arc<RateController>,
    pub coordinator: Option<Arc<InstanceCoordinator>>,
    pub host: Option<Arc<dyn HostAgent>>,
    pub config: Config,
    pub provider: String,
    pub model_id: String,
    pub thinking: ThinkingLevel,
    pub project_dir: PathBuf,
}

pub struct LoopManager {
    deps: LoopManagerDeps,
    active: tokio::sync::Mutex<Option<ActiveRun>>,
}

impl LoopManager {
    pub fn new(deps: LoopManagerDeps) -> Self {
        Self {
            deps,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Tool descriptors for host registration
    pub fn tool_descriptors() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "self_improvement_start".to_string(),
                description: "Start an autonomous self-improvement run on a task".to_string(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "task": {"type": "string"},
                        "max_cycles": {"type": "integer"},
                        "auto_commit": {"type": "boolean"},
                        "ul_mode": {"type": "boolean"},
                        "auto_approve": {"type": "boolean"}
                    },
                    "required": ["task"]
                }),
            },
            ToolDescriptor {
                name: "self_improvement_stop".to_string(),
                description: "Stop the active self-improvement run".to_string(),
                schema: serde_json::json!({"type": "object", "properties": {}}),
            },
            ToolDescriptor {
                name: "self_improvement_status".to_string(),
                description: "Inspect the active self-improvement run".to_string(),
                schema: serde_json::json!({"type": "object", "properties": {}}),
            },
        ]
    }

    /// Start a run; errors when one is already active or the task is empty
    pub async fn start_run(&self, args: StartRunArgs) -> Result<RunStartInfo> {
        if args.task.trim().is_empty() {
            bail!("a task is required to start a run");
        }

        let mut active = self.active.lock().await;
        if let Some(run) = active.as_ref()
            && !run.handle.is_finished()
        {
            bail!("a run is already active: {}", run.run_id);
        }

        let options = RunOptions {
            task: args.task.clone(),
            max_cycles: args.max_cycles.unwrap_or(10).max(1),
            auto_commit: args.auto_commit.unwrap_or(true),
            ul_mode: args.ul_mode.unwrap_or(true),
            auto_approve: args.auto_approve.unwrap_or(true),
        };

        let ul_mode = options.ul_mode && self.deps.host.is_some();
        if options.ul_mode && self.deps.host.is_none() {
            warn!("UL mode requested but no host agent wired; falling back to cycle mode");
        }

        let state = LoopRunState::new(options);
        let run_id = state.run_id.to_string();
        let started_at = state.started_at;
        let max_cycles = state.max_cycles;
        let auto_approve = state.auto_approve;
        let cancel = CancellationToken::new();
        let progress = Arc::new(StdMutex::new(RunProgress::default()));

        let (handle, log_path) = if ul_mode {
            let driver = UlDriver::new(
                UlDriverDeps {
                    host: self.deps.host.clone().expect("host checked above"),
                    model: self.deps.model.clone(),
                    vcs: self.deps.vcs.clone(),
                    rate: self.deps.rate.clone(),
                    config: self.deps.config.clone(),
                    provider: self.deps.provider.clone(),
                    model_id: self.deps.model_id.clone(),
                    project_dir: self.deps.project_dir.clone(),
                },
                state,
                cancel.clone(),
                progress.clone(),
            );
            let log_path = driver.log_path();
            (tokio::spawn(driver.run()), log_path)
        } else {
            let engine = CycleEngine::new(
                EngineDeps {
                    model: self.deps.model.clone(),
                    vcs: self.deps.vcs.clone(),
                    rate: self.deps.rate.clone(),
                    coordinator: self.deps.coordinator.clone(),
                    config: self.deps.config.clone(),
                    provider: self.deps.provider.clone(),
                    model_id: self.deps.model_id.clone(),
                    thinking: self.deps.thinking,
                    project_dir: self.deps.project_dir.clone(),
                },
                state,
                cancel.clone(),
                progress.clone(),
            );
            let log_path = engine.log_path();
            (tokio::spawn(engine.run()), log_path)
        };

        info!(%run_id, ul_mode, max_cycles, "run started");
        *active = Some(ActiveRun {
            run_id: run_id.clone(),
            cancel,
            handle,
            progress,
        });

        Ok(RunStartInfo {
            run_id,
            started_at,
            max_cycles,
            ul_mode,
            auto_approve,
            log_path,
        })
    }

    /// Request a stop by writing the stop-signal file
    pub async fn stop_run(&self) -> Result<bool> {
        let active = self.active.lock().await;
        let running = active.as_ref().is_some_and(|run| !run.handle.is_finished());
        StopSignal::for_project(&self.deps.project_dir).request_stop().await?;
        Ok(running)
    }

    /// Hard-cancel the active run (used on shutdown)
    pub async fn cancel_run(&self) {
        if let Some(run) = self.active.lock().await.as_ref() {
            run.cancel.cancel();
        }
    }

    /// Await the active run's final state, if any
    pub async fn wait_for_completion(&self) -> Option<LoopRunState> {
        let run = self.active.lock().await.take()?;
        match run.handle.await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "run task failed to join");
                None
            }
        }
    }

    pub async fn status(&self) -> StatusReport {
        let active = self.active.lock().await;
        let (running, run_id, progress) = match active.as_ref() {
            Some(run) => {
                let snapshot = run.progress.lock().expect("progress lock").clone();
                (!run.handle.is_finished(), Some(run.run_id.clone()), Some(snapshot))
            }
            None => (false, None, None),
        };

        StatusReport {
            running,
            run_id,
            cycle: progress.as_ref().map(|p| p.cycle),
            trajectory_stats: progress.as_ref().and_then(|p| p.trajectory_stats.clone()),
            progress,
            rate_control: self.deps.rate.get_summary(&self.deps.provider, &self.deps.model_id),
            config: self.deps.config.clone(),
        }
    }

    // Tool-shaped wrappers

    pub async fn start_tool(&self, args: StartRunArgs) -> ToolOutput {
        match self.start_run(args).await {
            Ok(info) => {
                let details = serde_json::to_value(&info).unwrap_or_default();
                ToolOutput::text(format!(
                    "Run {} started ({} mode, max {} cycles). Log: {}",
                    info.run_id,
                    if info.ul_mode { "research/plan/implement" } else { "cycle" },
                    info.max_cycles,
                    info.log_path.display()
                ))
                .with_details(details)
            }
            Err(e) => ToolOutput::error(format!("{:#}", e)),
        }
    }

    pub async fn stop_tool(&self) -> ToolOutput {
        match self.stop_run().await {
            Ok(true) => ToolOutput::text("Stop requested; the run will halt at the next boundary."),
            Ok(false) => ToolOutput::text("No active run; stop signal written anyway."),
            Err(e) => ToolOutput::error(format!("{:#}", e)),
        }
    }

    pub async fn status_tool(&self) -> ToolOutput {
        let report = self.status().await;
        let details = serde_json::to_value(&report).unwrap_or_default();
        let text = if report.running {
            format!(
                "Run {} active, cycle {}.",
                report.run_id.as_deref().unwrap_or("?"),
                report.cycle.unwrap_or(0)
            )
        } else {
            "No active run.".to_string()
        };
        ToolOutput::text(text).with_details(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopSettings;
    use crate::llm::MockModelClient;
    use crate::vcs::git::mock::MockVcs;
    use tempfile::tempdir;

    const GOOD_OUTPUT: &str = "SCORE: 80\nSUMMARY: fine\nNEXT_FOCUS: keep going\n";

    fn manager(project_dir: PathBuf) -> LoopManager {
        let config = Config {
            loop_settings: LoopSettings {
                min_cycle_interval_ms: 1,
                max_cycle_interval_ms: 5,
                perspective_delay_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        LoopManager::new(LoopManagerDeps {
            model: Arc::new(MockModelClient::always(GOOD_OUTPUT)),
            vcs: Arc::new(MockVcs::default()),
            rate: Arc::new(RateController::new(config.rate.clone(), 6)),
            coordinator: None,
            host: None,
            config,
            provider: "anthropic".to_string(),
            model_id: "claude-sonnet-4".to_string(),
            thinking: ThinkingLevel::Off,
            project_dir,
        })
    }

    #[tokio::test]
    async fn test_start_rejects_empty_task() {
        let temp = tempdir().unwrap();
        let manager = manager(temp.path().to_path_buf());
        assert!(manager.start_run(StartRunArgs::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_single_active_run() {
        let temp = tempdir().unwrap();
        let manager = manager(temp.path().to_path_buf());

        let info = manager
            .start_run(StartRunArgs {
                task: "first".to_string(),
                max_cycles: Some(100),
                ..Default::default()
            })
            .await
            .unwrap();
        // UL requested by default but no host wired: cycle-mode fallback
        assert!(!info.ul_mode);

        let second = manager
            .start_run(StartRunArgs {
                task: "second".to_string(),
                ..Default::default()
            })
            .await;
        assert!(second.is_err());

        manager.cancel_run().await;
        let state = manager.wait_for_completion().await.unwrap();
        assert!(state.stop_reason.is_some());
    }

    #[tokio::test]
    async fn test_run_to_completion_and_status() {
        let temp = tempdir().unwrap();
        let manager = manager(temp.path().to_path_buf());

        let status = manager.status().await;
        assert!(!status.running);

        manager
            .start_run(StartRunArgs {
                task: "small run".to_string(),
                max_cycles: Some(1),
                auto_commit: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = manager.wait_for_completion().await.unwrap();
        assert_eq!(state.cycle, 1);

        // After completion a new run may start
        let info = manager
            .start_run(StartRunArgs {
                task: "again".to_string(),
                max_cycles: Some(1),
                auto_commit: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!info.run_id.is_empty());
        manager.wait_for_completion().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_tool_writes_signal() {
        let temp = tempdir().unwrap();
        let manager = manager(temp.path().to_path_buf());

        let output = manager.stop_tool().await;
        assert!(output.error.is_none());
        assert!(StopSignal::for_project(temp.path()).is_requested().await);
    }

    #[test]
    fn test_tool_descriptors() {
        let descriptors = LoopManager::tool_descriptors();
        assert_eq!(descriptors.len(), 3);
        assert!(descriptors.iter().any(|d| d.name == "self_improvement_start"));
    }
}
