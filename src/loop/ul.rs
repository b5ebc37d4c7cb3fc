//! UL mode: the Research → Plan → Implement state machine
//!
//! The machine itself is pure: transitions are functions of the current
//! phase, the parsed output, the output length and the retry count. A thin
//! driver owns the host dispatch, scoring, commits and termination checks.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::host::{DeliverAs, HostAgent, HostEvent};
use crate::llm::ModelClient;
use crate::rate::RateController;
use crate::vcs::{CommitContext, Vcs, append_gitignore_patterns, commit_cycle_changes};

use super::logfile::{CycleLogEntry, RunLog};
use super::parser::{LoopDirective, find_phase_marker, parse_loop_status, parse_perspective_scores};
use super::prompts::build_phase_prompt;
use super::run_state::{CycleSummary, LoopRunState, Phase, RunProgress, ScoreVector, StopReason};
use super::stop::StopSignal;
use super::trajectory::TrajectoryTracker;

/// Transition produced by one `agent_end` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlTransition {
    /// Phase done; dispatch the next phase of the same cycle
    Advance { next_phase: Phase },
    /// Implement phase done; run post-cycle processing
    CycleComplete,
    /// Output unusable; re-dispatch the same phase
    Retry,
    /// Retries exhausted; terminate with `error`
    Fail,
}

/// Pure phase state machine keyed on `(run_id, phase, cycle)`
#[derive(Debug)]
pub struct UlMachine {
    pub run_id: String,
    pub phase: Phase,
    pub cycle: u32,
    pub retry_count: u32,
    max_phase_retries: u32,
    min_completion_chars: usize,
}

impl UlMachine {
    pub fn new(run_id: impl Into<String>, max_phase_retries: u32, min_completion_chars: usize) -> Self {
        Self {
            run_id: run_id.into(),
            phase: Phase::Research,
            cycle: 1,
            retry_count: 0,
            max_phase_retries,
            min_completion_chars,
        }
    }

    /// Transition on a finished agent turn
    ///
    /// The expected marker advances; a missing marker with a long-enough
    /// body counts as "completed anyway"; otherwise the phase is retried up
    /// to the cap.
    pub fn on_agent_end(&mut self, output: &str) -> UlTransition {
        let marker_matches = find_phase_marker(output)
            .is_some_and(|(run_id, phase, cycle)| run_id == self.run_id && phase == self.phase && cycle == self.cycle);

        if marker_matches || output.len() >= self.min_completion_chars {
            self.retry_count = 0;
            return if self.phase == Phase::Implement {
                self.cycle += 1;
                self.phase = Phase::Research;
                UlTransition::CycleComplete
            } else {
                self.phase = self.phase.next();
                UlTransition::Advance { next_phase: self.phase }
            };
        }

        self.retry_count += 1;
        if self.retry_count >= self.max_phase_retries {
            UlTransition::Fail
        } else {
            UlTransition::Retry
        }
    }
}

/// Dependencies the driver needs beyond the host
pub struct UlDriverDeps {
    pub host: Arc<dyn HostAgent>,
    pub model: Arc<dyn ModelClient>,
    pub vcs: Arc<dyn Vcs>,
    pub rate: Arc<RateController>,
    pub config: Config,
    pub provider: String,
    pub model_id: String,
    pub project_dir: PathBuf,
}

/// Drives a UL-mode run against the host event stream
pub struct UlDriver {
    deps: UlDriverDeps,
    machine: UlMachine,
    state: LoopRunState,
    trajectory: TrajectoryTracker,
    log: RunLog,
    stop: StopSignal,
    cancel: CancellationToken,
    progress: Arc<StdMutex<RunProgress>>,
}

impl UlDriver {
    pub fn new(
        deps: UlDriverDeps,
        state: LoopRunState,
        cancel: CancellationToken,
        progress: Arc<StdMutex<RunProgress>>,
    ) -> Self {
        let settings = &deps.config.loop_settings;
        let machine = UlMachine::new(
            state.run_id.as_str(),
            settings.ul_max_phase_retries,
            settings.ul_phase_completion_min_chars,
        );
        let log = RunLog::for_project(&deps.project_dir, state.run_id.as_str());
        let stop = StopSignal::for_project(&deps.project_dir);
        Self {
            deps,
            machine,
            state,
            trajectory: TrajectoryTracker::new(),
            log,
            stop,
            cancel,
            progress,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log.path().to_path_buf()
    }

    fn publish_progress(&self) {
        let mut progress = self.progress.lock().expect("progress lock");
        progress.cycle = self.state.cycle;
        progress.mean_score = self.state.recent_means(1).first().copied().unwrap_or(0.0);
        progress.current_phase = Some(self.state.current_phase.to_string());
        progress.stop_reason = self.state.stop_reason;
        progress.finished = self.state.stop_reason.is_some();
        progress.trajectory_stats = Some(self.trajectory.stats(&self.state.recent_means(5)));
    }

    async fn dispatch_phase(&mut self) -> Result<()> {
        let phase = self.machine.phase;
        let cycle = self.machine.cycle;
        self.state.current_phase = phase;
        self.state.in_flight_cycle = Some(cycle);

        // Snapshot the changed set at cycle start so only new changes commit
        if phase == Phase::Research {
            self.state.files_changed_before_cycle = match self.deps.vcs.changed_files().await {
                Ok(changed) => changed.into_iter().map(|c| c.path).collect(),
                Err(e) => {
                    warn!(error = %e, "could not snapshot changed files");
                    HashSet::new()
                }
            };
        }

        let prompt = build_phase_prompt(
            self.machine.run_id.as_str(),
            phase,
            cycle,
            &self.state.task,
            &self.state.phase_context,
        );
        debug!(%phase, cycle, "dispatching UL phase");
        self.deps.host.send_user_message(&prompt, DeliverAs::FollowUp).await?;
        self.publish_progress();
        Ok(())
    }

    /// Post-cycle processing for a finished implement phase; returns false
    /// when the run should terminate
    async fn complete_cycle(&mut self, output: &str) -> bool {
        self.state.cycle += 1;
        self.state.in_flight_cycle = None;
        let cycle = self.state.cycle;

        let scores = parse_perspective_scores(output).unwrap_or_default();
        let vector = ScoreVector::new(cycle, scores.clone());
        let mean = vector.mean;
        self.state.perspective_score_history.push(vector);

        // Commit before the summary so the hash lands in the log entry
        let mut commit_hash = None;
        if self.state.auto_commit {
            let ctx = CommitContext {
                task: &self.state.task,
                cycle,
                files_changed_before_cycle: &self.state.files_changed_before_cycle,
                mean_score: mean,
                scores: &scores,
                provider: &self.deps.provider,
                model_id: &self.deps.model_id,
                cancel: self.cancel.clone(),
            };
            match commit_cycle_changes(self.deps.vcs.as_ref(), self.deps.model.as_ref(), ctx).await {
                Ok(outcome) => {
                    commit_hash = outcome.commit_hash.clone();
                    self.state.last_commit_hash = outcome.commit_hash;
                    self.state.gitignore_patterns_to_add.extend(outcome.gitignore_patterns);
                }
                Err(e) => warn!(cycle, error = %e, "cycle commit failed, continuing"),
            }

            if !self.state.gitignore_patterns_to_add.is_empty() {
                let patterns = std::mem::take(&mut self.state.gitignore_patterns_to_add);
                if let Err(e) =
                    append_gitignore_patterns(&self.deps.project_dir, &patterns, self.deps.vcs.as_ref()).await
                {
                    warn!(cycle, error = %e, "gitignore update failed");
                }
            }
        }

        let summary_text = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("").to_string();
        self.state.push_cycle_summary(CycleSummary {
            cycle,
            mean_score: mean,
            summary: summary_text.clone(),
            commit_hash: commit_hash.clone(),
        });
        self.trajectory.record_step(output);

        if let Err(e) = self
            .log
            .append_cycle(&CycleLogEntry {
                cycle,
                mean_score: mean,
                scores,
                summary: summary_text,
                commit_hash,
                detections: vec![],
                is_stuck: self.trajectory.is_stuck(),
            })
            .await
        {
            warn!(cycle, error = %e, "failed to append cycle log entry");
        }

        // Termination checks, in precedence order
        let settings = self.deps.config.loop_settings.clone();
        if parse_loop_status(output) == Some(LoopDirective::Done) {
            info!(cycle, "agent reported the loop done");
            self.state.stop_reason = Some(StopReason::Completed);
            return false;
        }
        if !scores_empty_or_zero(&self.state) && mean >= settings.target_score {
            info!(cycle, mean, "target score reached");
            self.state.stop_reason = Some(StopReason::Completed);
            return false;
        }
        if self
            .state
            .check_stagnation(settings.stagnation_threshold, settings.max_stagnation_count)
            || self.trajectory.is_stuck()
        {
            info!(cycle, "run stagnated");
            self.state.stop_reason = Some(StopReason::Stagnation);
            return false;
        }
        if cycle >= self.state.max_cycles {
            info!(cycle, "max cycles reached");
            self.state.stop_reason = Some(StopReason::Completed);
            return false;
        }

        true
    }

    /// Footer, stop-file cleanup and final progress publication; runs no
    /// matter how the run ended
    async fn finalize(&mut self) {
        self.state.current_phase = Phase::Completed;
        if let Err(e) = self.log.write_footer(&self.state).await {
            warn!(error = %e, "failed to write run log footer");
        }
        if let Err(e) = self.stop.clear().await {
            warn!(error = %e, "failed to clear stop signal");
        }
        self.publish_progress();
    }

    /// Run until termination; always writes the footer and clears the stop
    /// file
    pub async fn run(mut self) -> LoopRunState {
        if let Err(e) = self.log.write_header(&self.state).await {
            warn!(error = %e, "failed to write run log header");
        }

        let mut events = self.deps.host.subscribe();

        if let Err(e) = self.dispatch_phase().await {
            warn!(error = %e, "initial dispatch failed");
            self.state.stop_reason = Some(StopReason::Error);
            self.finalize().await;
            return self.state;
        }

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state.stop_reason = Some(StopReason::UserRequest);
                    break;
                }
                event = events.recv() => event,
            };

            let output = match event {
                Ok(HostEvent::AgentEnd { output }) => output,
                Ok(HostEvent::Input { .. }) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "host event stream lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    warn!("host event stream closed");
                    self.state.stop_reason = Some(StopReason::Error);
                    break;
                }
            };

            // The stop file wins over any in-memory state
            if self.state.stop_requested || self.stop.is_requested().await {
                info!("stop signal observed");
                self.state.stop_reason = Some(StopReason::UserRequest);
                break;
            }

            let completed_phase = self.machine.phase;
            match self.machine.on_agent_end(&output) {
                UlTransition::Advance { next_phase } => {
                    self.state.phase_context.insert(completed_phase.as_str().to_string(), output);
                    self.state.phase_retry_count = 0;
                    self.state.current_phase = next_phase;
                    if let Err(e) = self.dispatch_phase().await {
                        warn!(error = %e, "phase dispatch failed");
                        self.state.stop_reason = Some(StopReason::Error);
                        break;
                    }
                }
                UlTransition::CycleComplete => {
                    self.state.phase_context.insert(completed_phase.as_str().to_string(), output.clone());
                    self.state.phase_retry_count = 0;
                    if !self.complete_cycle(&output).await {
                        break;
                    }
                    self.publish_progress();
                    if let Err(e) = self.dispatch_phase().await {
                        warn!(error = %e, "research dispatch failed");
                        self.state.stop_reason = Some(StopReason::Error);
                        break;
                    }
                }
                UlTransition::Retry => {
                    self.state.phase_retry_count = self.machine.retry_count;
                    debug!(retry = self.machine.retry_count, phase = %self.machine.phase, "re-dispatching phase");
                    if let Err(e) = self.dispatch_phase().await {
                        warn!(error = %e, "retry dispatch failed");
                        self.state.stop_reason = Some(StopReason::Error);
                        break;
                    }
                }
                UlTransition::Fail => {
                    warn!(phase = %self.machine.phase, "phase retries exhausted");
                    self.state.stop_reason = Some(StopReason::Error);
                    break;
                }
            }
        }

        self.finalize().await;
        self.state
    }
}

fn scores_empty_or_zero(state: &LoopRunState) -> bool {
    state
        .perspective_score_history
        .last()
        .map(|v| v.scores.is_empty())
        .unwrap_or(true)
}
