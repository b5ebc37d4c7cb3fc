//! Adaptive per-model rate control
//!
//! Tracks recent rate-limit rejections per (provider, model) pair and adapts
//! a concurrency cap: halved on rejection (floor 1), recovered one step
//! toward the baseline after a run of consecutive successes. The outputs are
//! advisory; the loop uses them to pace cycles and the retry wrapper feeds
//! rejection/success events in.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::{LoopSettings, RateControlSettings};
use crate::llm::ModelError;

/// Summary consumed by the loop when pacing cycles
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSummary {
    pub adaptive_limit: usize,
    pub original_limit: usize,
    pub predictive_limit: usize,
    pub predicted_rejection_probability: f64,
    pub should_throttle: bool,
    pub recent_rejection_count: usize,
}

/// Trend over the rejection window, newest half vs oldest half
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateTrend {
    Improving,
    Stable,
    Degrading,
}

/// Extended analysis for status output
#[derive(Debug, Clone, Serialize)]
pub struct PredictiveAnalysis {
    pub summary: RateSummary,
    pub trend: RateTrend,
    pub consecutive_successes: u32,
}

#[derive(Debug)]
struct ModelRateState {
    rejections: VecDeque<Instant>,
    consecutive_successes: u32,
    adaptive_limit: usize,
    original_limit: usize,
}

impl ModelRateState {
    fn new(original_limit: usize) -> Self {
        Self {
            rejections: VecDeque::new(),
            consecutive_successes: 0,
            adaptive_limit: original_limit,
            original_limit,
        }
    }

    fn prune(&mut self, window: Duration) {
        let cutoff = Instant::now() - window;
        while self.rejections.front().is_some_and(|t| *t < cutoff) {
            self.rejections.pop_front();
        }
    }
}

/// Process-wide adaptive rate controller
pub struct RateController {
    settings: RateControlSettings,
    default_limit: usize,
    states: Mutex<HashMap<(String, String), ModelRateState>>,
}

impl RateController {
    pub fn new(settings: RateControlSettings, default_limit: usize) -> Self {
        Self {
            settings,
            default_limit: default_limit.max(1),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn with_state<R>(&self, provider: &str, model: &str, f: impl FnOnce(&ModelRateState, &RateControlSettings) -> R) -> R {
        let mut states = self.states.lock().expect("rate state lock");
        let state = states
            .entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| ModelRateState::new(self.default_limit));
        state.prune(self.settings.rejection_window());
        f(state, &self.settings)
    }

    /// Record a 429-equivalent rejection
    pub fn record_rejection(&self, provider: &str, model: &str, reason: &str) {
        let mut states = self.states.lock().expect("rate state lock");
        let state = states
            .entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| ModelRateState::new(self.default_limit));

        state.rejections.push_back(Instant::now());
        state.prune(self.settings.rejection_window());
        state.consecutive_successes = 0;
        state.adaptive_limit = (state.adaptive_limit / 2).max(1);

        debug!(
            provider,
            model,
            reason,
            adaptive_limit = state.adaptive_limit,
            recent = state.rejections.len(),
            "rate rejection recorded"
        );
    }

    /// Record a successful call; sustained success recovers capacity
    pub fn record_success(&self, provider: &str, model: &str) {
        let mut states = self.states.lock().expect("rate state lock");
        let state = states
            .entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| ModelRateState::new(self.default_limit));

        state.prune(self.settings.rejection_window());
        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.settings.recovery_threshold && state.adaptive_limit < state.original_limit
        {
            state.adaptive_limit += 1;
            state.consecutive_successes = 0;
            debug!(provider, model, adaptive_limit = state.adaptive_limit, "rate limit recovered a step");
        }
    }

    pub fn get_summary(&self, provider: &str, model: &str) -> RateSummary {
        self.with_state(provider, model, |state, settings| summarize(state, settings))
    }

    pub fn get_predictive_analysis(&self, provider: &str, model: &str) -> PredictiveAnalysis {
        self.with_state(provider, model, |state, settings| {
            let summary = summarize(state, settings);

            let trend = if state.rejections.len() < 2 {
                RateTrend::Stable
            } else {
                let midpoint = Instant::now() - settings.rejection_window() / 2;
                let newer = state.rejections.iter().filter(|t| **t >= midpoint).count();
                let older = state.rejections.len() - newer;
                match newer.cmp(&older) {
                    std::cmp::Ordering::Greater => RateTrend::Degrading,
                    std::cmp::Ordering::Less => RateTrend::Improving,
                    std::cmp::Ordering::Equal => RateTrend::Stable,
                }
            };

            PredictiveAnalysis {
                summary,
                trend,
                consecutive_successes: state.consecutive_successes,
            }
        })
    }

    /// Whether an error should be treated as a rate-limit rejection
    pub fn is_rate_limit_error(&self, err: &ModelError) -> bool {
        if err.is_rate_limit() {
            return true;
        }
        match err {
            ModelError::Api { status: 429, .. } => true,
            ModelError::Api { message, .. } | ModelError::Network(message) => {
                let lower = message.to_lowercase();
                lower.contains("rate limit") || lower.contains("overloaded") || lower.contains("429")
            }
            _ => false,
        }
    }
}

fn summarize(state: &ModelRateState, settings: &RateControlSettings) -> RateSummary {
    let recent = state.rejections.len();
    let probability = (recent as f64 / 10.0).min(1.0);
    let predictive_limit = ((state.original_limit as f64 * (1.0 - probability)).round() as usize).max(1);

    RateSummary {
        adaptive_limit: state.adaptive_limit,
        original_limit: state.original_limit,
        predictive_limit,
        predicted_rejection_probability: probability,
        should_throttle: recent >= settings.high_rejection_threshold,
        recent_rejection_count: recent,
    }
}

/// Inter-cycle delay: base scaled by rejection probability plus a linear
/// term per recent rejection, clamped to the configured interval bounds
pub fn adaptive_cycle_delay(base: Duration, summary: &RateSummary, settings: &LoopSettings) -> Duration {
    let scaled_ms = base.as_millis() as f64 * (1.0 + summary.predicted_rejection_probability * 4.0)
        + summary.recent_rejection_count as f64 * 1_000.0;
    let clamped = (scaled_ms as u64).clamp(settings.min_cycle_interval_ms, settings.max_cycle_interval_ms);
    Duration::from_millis(clamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller() -> RateController {
        RateController::new(RateControlSettings::default(), 6)
    }

    #[test]
    fn test_rejection_halves_limit_with_floor() {
        let rc = controller();
        for _ in 0..5 {
            rc.record_rejection("anthropic", "claude-sonnet-4", "429");
        }
        let summary = rc.get_summary("anthropic", "claude-sonnet-4");
        assert_eq!(summary.adaptive_limit, 1);
        assert_eq!(summary.recent_rejection_count, 5);
        assert!(summary.should_throttle);
        assert!(summary.predicted_rejection_probability > 0.0);
    }

    #[test]
    fn test_recovery_after_consecutive_successes() {
        let rc = controller();
        rc.record_rejection("anthropic", "claude-sonnet-4", "429");
        let degraded = rc.get_summary("anthropic", "claude-sonnet-4").adaptive_limit;
        assert_eq!(degraded, 3);

        // One short of the threshold: no recovery yet
        for _ in 0..4 {
            rc.record_success("anthropic", "claude-sonnet-4");
        }
        assert_eq!(rc.get_summary("anthropic", "claude-sonnet-4").adaptive_limit, 3);

        rc.record_success("anthropic", "claude-sonnet-4");
        assert_eq!(rc.get_summary("anthropic", "claude-sonnet-4").adaptive_limit, 4);
    }

    #[test]
    fn test_limit_never_exceeds_original() {
        let rc = controller();
        for _ in 0..100 {
            rc.record_success("anthropic", "claude-sonnet-4");
        }
        let summary = rc.get_summary("anthropic", "claude-sonnet-4");
        assert_eq!(summary.adaptive_limit, summary.original_limit);
    }

    #[test]
    fn test_states_are_isolated_per_model() {
        let rc = controller();
        rc.record_rejection("anthropic", "claude-opus-4", "429");
        assert_eq!(rc.get_summary("anthropic", "claude-opus-4").adaptive_limit, 3);
        assert_eq!(rc.get_summary("anthropic", "claude-sonnet-4").adaptive_limit, 6);
    }

    #[test]
    fn test_is_rate_limit_error_heuristics() {
        let rc = controller();
        assert!(rc.is_rate_limit_error(&ModelError::RateLimited { retry_after: None }));
        assert!(rc.is_rate_limit_error(&ModelError::Api { status: 429, message: "slow down".into() }));
        assert!(rc.is_rate_limit_error(&ModelError::Api { status: 529, message: "Overloaded".into() }));
        assert!(!rc.is_rate_limit_error(&ModelError::Api { status: 500, message: "oops".into() }));
        assert!(!rc.is_rate_limit_error(&ModelError::Cancelled));
    }

    #[test]
    fn test_adaptive_cycle_delay_clamped() {
        let settings = LoopSettings::default();
        let calm = RateSummary {
            adaptive_limit: 6,
            original_limit: 6,
            predictive_limit: 6,
            predicted_rejection_probability: 0.0,
            should_throttle: false,
            recent_rejection_count: 0,
        };
        assert_eq!(
            adaptive_cycle_delay(Duration::from_millis(2_000), &calm, &settings),
            Duration::from_millis(2_000)
        );

        let stormy = RateSummary {
            recent_rejection_count: 100,
            predicted_rejection_probability: 1.0,
            ..calm.clone()
        };
        assert_eq!(
            adaptive_cycle_delay(Duration::from_millis(2_000), &stormy, &settings),
            Duration::from_millis(settings.max_cycle_interval_ms)
        );

        // Below the floor clamps up
        let tiny = adaptive_cycle_delay(Duration::from_millis(1), &calm, &settings);
        assert_eq!(tiny, Duration::from_millis(settings.min_cycle_interval_ms));
    }

    #[test]
    fn test_trend_reports_stable_when_quiet() {
        let rc = controller();
        let analysis = rc.get_predictive_analysis("anthropic", "claude-sonnet-4");
        assert_eq!(analysis.trend, RateTrend::Stable);
        assert_eq!(analysis.summary.recent_rejection_count, 0);
    }

    proptest! {
        /// Any interleaving of events keeps 1 <= adaptive <= original
        #[test]
        fn prop_adaptive_limit_stays_in_bounds(events in proptest::collection::vec(any::<bool>(), 0..200)) {
            let rc = controller();
            for success in events {
                if success {
                    rc.record_success("p", "m");
                } else {
                    rc.record_rejection("p", "m", "429");
                }
                let summary = rc.get_summary("p", "m");
                prop_assert!(summary.adaptive_limit >= 1);
                prop_assert!(summary.adaptive_limit <= summary.original_limit);
            }
        }
    }
}
