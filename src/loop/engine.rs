//! Cycle-mode engine
//!
//! One cycle sweeps the seven perspectives: prompts are built from run
//! history, dispatched through the worker pool (bounded by the adaptive
//! rate limit and this instance's coordinator share), parsed, scored and
//! folded back into run state. Post-cycle work covers the metacognitive
//! check, detection passes, auto-commit and stagnation tracking.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use eyre::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::InstanceCoordinator;
use crate::detect::{detect_claim_result_mismatch, run_detection_pass, run_metacognitive_check};
use crate::llm::{ModelClient, ModelError, ModelRequest, ThinkingLevel, model_timeout};
use crate::pool::{PoolError, PoolOptions, run_with_limit};
use crate::rate::{RateController, adaptive_cycle_delay, call_with_retry, sleep_with_cancel};
use crate::vcs::{CommitContext, Vcs, append_gitignore_patterns, commit_cycle_changes};

use super::logfile::{CycleLogEntry, RunLog};
use super::perspectives::{PERSPECTIVES, PerspectiveState, initial_perspective_states};
use super::prompts::{PerspectivePromptInputs, build_perspective_prompt, quality_guidance, strategy_hint};
use super::run_state::{CycleSummary, LoopRunState, Phase, RunProgress, ScoreVector, StopReason, SuccessfulPattern};
use super::stop::StopSignal;
use super::trajectory::TrajectoryTracker;

/// Worker-side marker raised when the stop file is observed mid-cycle
#[derive(Debug, Error)]
#[error("stop signal observed")]
struct StopObserved;

/// Dependencies for a cycle-mode run
pub struct EngineDeps {
    pub model: Arc<dyn ModelClient>,
    pub vcs: Arc<dyn Vcs>,
    pub rate: Arc<RateController>,
    pub coordinator: Option<Arc<InstanceCoordinator>>,
    pub config: Config,
    pub provider: String,
    pub model_id: String,
    pub thinking: ThinkingLevel,
    pub project_dir: PathBuf,
}

enum CycleOutcome {
    Finished { mean: f64 },
    Stopped,
}

pub struct CycleEngine {
    deps: EngineDeps,
    state: LoopRunState,
    perspectives: Vec<PerspectiveState>,
    trajectory: TrajectoryTracker,
    log: RunLog,
    stop: StopSignal,
    /// Caller-owned cancellation (user cancel)
    cancel: CancellationToken,
    /// Child handle the engine may signal itself (stop-file propagation)
    run_cancel: CancellationToken,
    progress: Arc<StdMutex<RunProgress>>,
}

impl CycleEngine {
    pub fn new(
        deps: EngineDeps,
        state: LoopRunState,
        cancel: CancellationToken,
        progress: Arc<StdMutex<RunProgress>>,
    ) -> Self {
        let log = RunLog::for_project(&deps.project_dir, state.run_id.as_str());
        let stop = StopSignal::for_project(&deps.project_dir);
        let run_cancel = cancel.child_token();
        Self {
            deps,
            state,
            perspectives: initial_perspective_states(),
            trajectory: TrajectoryTracker::new(),
            log,
            stop,
            cancel,
            run_cancel,
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
        progress.current_phase = None;
        progress.stop_reason = self.state.stop_reason;
        progress.finished = self.state.stop_reason.is_some();
        progress.trajectory_stats = Some(self.trajectory.stats(&self.state.recent_means(5)));
    }

    /// Run to termination; the footer is always written and the stop file
    /// cleared
    pub async fn run(mut self) -> LoopRunState {
        if let Err(e) = self.log.write_header(&self.state).await {
            warn!(error = %e, "failed to write run log header");
        }

        if let Some(coordinator) = &self.deps.coordinator
            && let Err(e) = coordinator.set_active_model(&self.deps.provider, &self.deps.model_id).await
        {
            warn!(error = %e, "failed to mark model active");
        }

        let settings = self.deps.config.loop_settings.clone();

        loop {
            // Cycle-boundary termination checks; the stop file wins over the
            // in-memory flag
            if self.cancel.is_cancelled() {
                self.state.stop_reason = Some(StopReason::UserRequest);
                break;
            }
            if self.state.stop_requested || self.stop.is_requested().await {
                info!("stop signal observed at cycle boundary");
                self.state.stop_reason = Some(StopReason::UserRequest);
                break;
            }
            if self.state.cycle >= self.state.max_cycles {
                info!(cycles = self.state.cycle, "max cycles reached");
                self.state.stop_reason = Some(StopReason::Completed);
                break;
            }

            self.state.cycle += 1;
            self.state.in_flight_cycle = Some(self.state.cycle);
            info!(cycle = self.state.cycle, max = self.state.max_cycles, "starting cycle");

            match self.run_cycle().await {
                Ok(CycleOutcome::Stopped) => {
                    self.state.stop_reason = Some(StopReason::UserRequest);
                    break;
                }
                Ok(CycleOutcome::Finished { mean }) => {
                    self.state.in_flight_cycle = None;
                    self.publish_progress();

                    if mean >= settings.target_score {
                        info!(mean, "target score reached");
                        self.state.stop_reason = Some(StopReason::Completed);
                        break;
                    }
                    if self
                        .state
                        .check_stagnation(settings.stagnation_threshold, settings.max_stagnation_count)
                        || self.trajectory.is_stuck()
                    {
                        info!("run stagnated");
                        self.state.stop_reason = Some(StopReason::Stagnation);
                        break;
                    }
                }
                Err(e) => {
                    if self.cancel.is_cancelled() || is_cancellation(&e) {
                        self.state.stop_reason = Some(StopReason::UserRequest);
                    } else {
                        warn!(error = %e, "cycle failed");
                        self.state.stop_reason = Some(StopReason::Error);
                    }
                    break;
                }
            }

            // Adaptive inter-cycle delay from the rate controller
            let summary = self.deps.rate.get_summary(&self.deps.provider, &self.deps.model_id);
            let delay = adaptive_cycle_delay(settings.min_cycle_interval(), &summary, &settings);
            debug!(?delay, "inter-cycle delay");
            if sleep_with_cancel(delay, &self.cancel).await.is_err() {
                self.state.stop_reason = Some(StopReason::UserRequest);
                break;
            }
        }

        if let Some(coordinator) = &self.deps.coordinator
            && let Err(e) = coordinator.clear_active_model(&self.deps.provider, &self.deps.model_id).await
        {
            warn!(error = %e, "failed to clear active model");
        }

        self.state.current_phase = Phase::Completed;
        if let Err(e) = self.log.write_footer(&self.state).await {
            warn!(error = %e, "failed to write run log footer");
        }
        if let Err(e) = self.stop.clear().await {
            warn!(error = %e, "failed to clear stop signal");
        }
        self.publish_progress();
        self.state
    }

    /// How many perspective calls may be in flight at once: the adaptive
    /// per-model cap bounded by this instance's coordinator share
    async fn perspective_limit(&self) -> usize {
        let summary = self.deps.rate.get_summary(&self.deps.provider, &self.deps.model_id);
        let mut limit = summary.adaptive_limit.max(1);
        if let Some(coordinator) = &self.deps.coordinator {
            let share = coordinator
                .get_model_parallel_limit(
                    &self.deps.provider,
                    &self.deps.model_id,
                    coordinator.config().total_max_llm,
                )
                .await;
            limit = limit.min(share);
        }
        limit.max(1)
    }

    async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let cycle = self.state.cycle;
        let settings = self.deps.config.loop_settings.clone();

        // Snapshot the changed set so commits only cover this cycle's work
        self.state.files_changed_before_cycle = match self.deps.vcs.changed_files().await {
            Ok(changed) => changed.into_iter().map(|c| c.path).collect(),
            Err(e) => {
                warn!(cycle, error = %e, "could not snapshot changed files");
                HashSet::new()
            }
        };

        let limit = self.perspective_limit().await;
        debug!(cycle, limit, "dispatching perspectives");

        // Prompt inputs are all computed up front; the pool workers only
        // carry owned data.
        let recent_means = self.state.recent_means(5);
        let hint = strategy_hint(&recent_means);
        let action = self.trajectory.recommended_action(&recent_means);
        let guidance = self.state.last_metacog.as_ref().and_then(quality_guidance);
        let summaries: Vec<CycleSummary> = {
            let window = settings.summary_window;
            let skip = self.state.cycle_summaries.len().saturating_sub(window);
            self.state.cycle_summaries.iter().skip(skip).cloned().collect()
        };
        let improvements: Vec<String> = self
            .state
            .improvement_actions
            .iter()
            .take(settings.max_improvement_actions)
            .cloned()
            .collect();
        let patterns: Vec<SuccessfulPattern> = {
            let qualifying: Vec<SuccessfulPattern> = self
                .state
                .successful_patterns
                .iter()
                .filter(|p| p.avg_score >= settings.success_pattern_min_score)
                .cloned()
                .collect();
            let skip = qualifying.len().saturating_sub(settings.max_success_patterns_in_prompt);
            qualifying.into_iter().skip(skip).collect()
        };

        let items: Vec<(usize, String)> = PERSPECTIVES
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let prompt = build_perspective_prompt(&PerspectivePromptInputs {
                    task: &self.state.task,
                    perspective: spec,
                    cycle,
                    recent_summaries: &summaries,
                    strategy_hint: &hint,
                    recommended_action: action,
                    quality_guidance: guidance.as_deref(),
                    improvements: &improvements,
                    patterns: &patterns,
                });
                (index, prompt)
            })
            .collect();

        // Weight by perspective order so the pool dispatches in-order even
        // when the share allows overlap
        let weights: HashMap<String, f64> = (0..items.len()).map(|i| (i.to_string(), (items.len() - i) as f64)).collect();
        let options = PoolOptions::default()
            .with_cancel(self.run_cancel.clone())
            .with_priority(weights, |item: &(usize, String)| item.0.to_string());

        let model = self.deps.model.clone();
        let rate = self.deps.rate.clone();
        let retry = self.deps.config.retry.clone();
        let stop = self.stop.clone();
        let run_cancel = self.run_cancel.clone();
        let provider = self.deps.provider.clone();
        let model_id = self.deps.model_id.clone();
        let thinking = self.deps.thinking;
        let delay = settings.perspective_delay();

        let worker = move |(index, prompt): (usize, String), _slot: usize| {
            let model = model.clone();
            let rate = rate.clone();
            let retry = retry.clone();
            let stop = stop.clone();
            let run_cancel = run_cancel.clone();
            let provider = provider.clone();
            let model_id = model_id.clone();

            async move {
                // Perspective-boundary stop poll; the file wins
                if stop.is_requested().await {
                    run_cancel.cancel();
                    return Err(StopObserved.into());
                }

                let request = ModelRequest {
                    provider,
                    model_id: model_id.clone(),
                    thinking_level: thinking,
                    prompt,
                    timeout: model_timeout(&model_id, thinking),
                    cancel: run_cancel.clone(),
                    label: format!("perspective {}", PERSPECTIVES[index].id),
                };
                let raw = call_with_retry(model.as_ref(), request, &retry, &rate).await?;
                let parsed = super::parser::parse_perspective_output(&raw);

                // Pacing between perspective calls; a cancelled sleep just
                // ends the pause early
                let _ = sleep_with_cancel(delay, &run_cancel).await;

                Ok((index, raw, parsed))
            }
        };

        let results = match run_with_limit(items, limit, worker, options).await {
            Ok(results) => results,
            Err(e) => {
                if e.downcast_ref::<StopObserved>().is_some() || self.stop.is_requested().await {
                    return Ok(CycleOutcome::Stopped);
                }
                return Err(e);
            }
        };

        // Fold results back into run state
        let mut scores = vec![0.5; PERSPECTIVES.len()];
        let mut raws = Vec::with_capacity(results.len());
        let mut perspective_summaries = Vec::new();
        let mut next_focus: Option<String> = None;
        let mut collected_improvements = Vec::new();

        for (index, raw, parsed) in results {
            self.perspectives[index].record(&parsed.findings, &parsed.questions, &parsed.improvements, parsed.score);
            scores[index] = parsed.score;
            if !parsed.summary.is_empty() {
                perspective_summaries.push(parsed.summary.clone());
            }
            if next_focus.is_none() {
                next_focus = parsed.next_focus.clone();
            }
            collected_improvements.extend(parsed.improvements);
            raws.push(raw);
        }

        let vector = ScoreVector::new(cycle, scores.clone());
        let mean = vector.mean;
        self.state.perspective_score_history.push(vector);

        let concatenated = raws.join("\n\n");
        let check = run_metacognitive_check(&concatenated);

        let mut detections = Vec::new();
        if mean >= settings.skip_verification_min_score {
            // High-scoring cycle: record the pattern, skip the detailed
            // verification passes
            let action_summary = next_focus
                .clone()
                .or_else(|| perspective_summaries.first().cloned())
                .unwrap_or_default();
            let applied = PERSPECTIVES.iter().map(|p| p.id.to_string()).collect();
            self.state
                .push_successful_pattern(SuccessfulPattern::new(cycle, mean, &action_summary, applied));
        } else {
            for pattern in run_detection_pass(&concatenated, settings.min_pattern_confidence) {
                detections.push(format!("{:?}: {}", pattern.kind, pattern.evidence));
            }
            let mismatch = detect_claim_result_mismatch(&concatenated);
            if mismatch.mismatch {
                detections.push(format!("claim/result mismatch: {}", mismatch.reasons.join("; ")));
            }
            collected_improvements.truncate(settings.max_improvement_actions * 2);
            self.state.improvement_actions = collected_improvements;
        }
        self.state.last_metacog = Some(check);

        // Auto-commit, with the gitignore flush at most once per cycle
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
                cancel: self.run_cancel.clone(),
            };
            match commit_cycle_changes(self.deps.vcs.as_ref(), self.deps.model.as_ref(), ctx).await {
                Ok(outcome) => {
                    commit_hash = outcome.commit_hash.clone();
                    if outcome.committed {
                        self.state.last_commit_hash = outcome.commit_hash;
                    }
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

        let summary_text = perspective_summaries.join("; ");
        self.state.push_cycle_summary(CycleSummary {
            cycle,
            mean_score: mean,
            summary: summary_text.clone(),
            commit_hash: commit_hash.clone(),
        });
        self.trajectory
            .record_step(next_focus.as_deref().unwrap_or(&summary_text));

        if let Err(e) = self
            .log
            .append_cycle(&CycleLogEntry {
                cycle,
                mean_score: mean,
                scores,
                summary: summary_text,
                commit_hash,
                detections,
                is_stuck: self.trajectory.is_stuck(),
            })
            .await
        {
            warn!(cycle, error = %e, "failed to append cycle log entry");
        }

        Ok(CycleOutcome::Finished { mean })
    }
}

fn is_cancellation(e: &eyre::Report) -> bool {
    matches!(e.downcast_ref::<PoolError>(), Some(PoolError::Cancelled))
        || matches!(e.downcast_ref::<ModelError>(), Some(ModelError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopSettings;
    use crate::llm::MockModelClient;
    use crate::r#loop::run_state::RunOptions;
    use crate::vcs::git::mock::MockVcs;
    use tempfile::tempdir;

    const GOOD_OUTPUT: &str = "FINDINGS:\n- solid separation of concerns\nQUESTIONS:\n- none\nIMPROVEMENTS:\n- tighten the retry cap\nSCORE: 80\nSUMMARY: in good shape\nNEXT_FOCUS: verify lock expiry handling\n";

    fn fast_config() -> Config {
        Config {
            loop_settings: LoopSettings {
                min_cycle_interval_ms: 1,
                max_cycle_interval_ms: 5,
                perspective_delay_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn engine_with(
        model: Arc<dyn ModelClient>,
        vcs: Arc<dyn Vcs>,
        options: RunOptions,
        project_dir: PathBuf,
    ) -> CycleEngine {
        let config = fast_config();
        let deps = EngineDeps {
            model,
            vcs,
            rate: Arc::new(RateController::new(config.rate.clone(), 6)),
            coordinator: None,
            config,
            provider: "anthropic".to_string(),
            model_id: "claude-sonnet-4".to_string(),
            thinking: ThinkingLevel::Off,
            project_dir,
        };
        CycleEngine::new(
            deps,
            LoopRunState::new(options),
            CancellationToken::new(),
            Arc::new(StdMutex::new(RunProgress::default())),
        )
    }

    #[tokio::test]
    async fn test_run_completes_after_max_cycles() {
        let temp = tempdir().unwrap();
        let model = Arc::new(MockModelClient::always(GOOD_OUTPUT));
        let vcs = Arc::new(MockVcs::default());

        let engine = engine_with(
            model.clone(),
            vcs,
            RunOptions {
                task: "improve things".to_string(),
                max_cycles: 2,
                auto_commit: false,
                ul_mode: false,
                auto_approve: true,
            },
            temp.path().to_path_buf(),
        );

        let state = engine.run().await;
        assert_eq!(state.cycle, 2);
        assert_eq!(state.stop_reason, Some(StopReason::Completed));
        assert_eq!(state.perspective_score_history.len(), 2);
        // Seven perspective calls per cycle
        assert_eq!(model.call_count(), 14);
        // 0.8 mean is a successful pattern
        assert!(!state.successful_patterns.is_empty());

        // The run log exists with header, cycles and footer
        let log_dir = temp.path().join(".pi").join("self-improvement-loop");
        let entries = std::fs::read_dir(log_dir).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_target_score_terminates_early() {
        let temp = tempdir().unwrap();
        let model = Arc::new(MockModelClient::always("SCORE: 98\nSUMMARY: excellent\n"));
        let vcs = Arc::new(MockVcs::default());

        let engine = engine_with(
            model,
            vcs,
            RunOptions {
                task: "t".to_string(),
                max_cycles: 10,
                auto_commit: false,
                ul_mode: false,
                auto_approve: true,
            },
            temp.path().to_path_buf(),
        );

        let state = engine.run().await;
        assert_eq!(state.cycle, 1);
        assert_eq!(state.stop_reason, Some(StopReason::Completed));
    }

    #[tokio::test]
    async fn test_preexisting_stop_file_stops_before_first_cycle() {
        let temp = tempdir().unwrap();
        let stop = StopSignal::for_project(temp.path());
        stop.request_stop().await.unwrap();

        let model = Arc::new(MockModelClient::always(GOOD_OUTPUT));
        let vcs = Arc::new(MockVcs::default());
        let engine = engine_with(
            model.clone(),
            vcs,
            RunOptions {
                task: "t".to_string(),
                max_cycles: 5,
                auto_commit: false,
                ul_mode: false,
                auto_approve: true,
            },
            temp.path().to_path_buf(),
        );

        let state = engine.run().await;
        assert_eq!(state.cycle, 0);
        assert_eq!(state.stop_reason, Some(StopReason::UserRequest));
        assert_eq!(model.call_count(), 0);
        // The stop file was cleared on the way out
        assert!(!stop.is_requested().await);
    }

    #[tokio::test]
    async fn test_auto_commit_commits_cycle_changes() {
        let temp = tempdir().unwrap();
        let model = Arc::new(MockModelClient::new(vec![
            // Seven perspectives then one commit-message call, repeated
            Ok(GOOD_OUTPUT.to_string()),
            Ok(GOOD_OUTPUT.to_string()),
            Ok(GOOD_OUTPUT.to_string()),
            Ok(GOOD_OUTPUT.to_string()),
            Ok(GOOD_OUTPUT.to_string()),
            Ok(GOOD_OUTPUT.to_string()),
            Ok(GOOD_OUTPUT.to_string()),
            Ok("feat(core): tighten retry cap".to_string()),
        ]));
        // The change shows up only after the cycle-start snapshot
        let vcs = Arc::new(MockVcs::appearing(&["src/lib.rs"]));

        let engine = engine_with(
            model,
            vcs.clone(),
            RunOptions {
                task: "t".to_string(),
                max_cycles: 1,
                auto_commit: true,
                ul_mode: false,
                auto_approve: true,
            },
            temp.path().to_path_buf(),
        );

        let state = engine.run().await;
        assert_eq!(state.cycle, 1);
        assert_eq!(vcs.commit_messages(), vec!["feat(core): tighten retry cap"]);
        assert!(state.last_commit_hash.is_some());
    }

    #[tokio::test]
    async fn test_user_cancellation_mid_run() {
        let temp = tempdir().unwrap();
        let model = Arc::new(MockModelClient::always(GOOD_OUTPUT).with_delay(std::time::Duration::from_millis(50)));
        let vcs = Arc::new(MockVcs::default());

        let config = fast_config();
        let cancel = CancellationToken::new();
        let deps = EngineDeps {
            model,
            vcs,
            rate: Arc::new(RateController::new(config.rate.clone(), 6)),
            coordinator: None,
            config,
            provider: "anthropic".to_string(),
            model_id: "claude-sonnet-4".to_string(),
            thinking: ThinkingLevel::Off,
            project_dir: temp.path().to_path_buf(),
        };
        let engine = CycleEngine::new(
            deps,
            LoopRunState::new(RunOptions {
                task: "t".to_string(),
                max_cycles: 50,
                auto_commit: false,
                ul_mode: false,
                auto_approve: true,
            }),
            cancel.clone(),
            Arc::new(StdMutex::new(RunProgress::default())),
        );

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let state = engine.run().await;
        assert_eq!(state.stop_reason, Some(StopReason::UserRequest));
        assert!(state.cycle <= 2);
    }
}
