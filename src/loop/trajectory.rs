//! Trajectory tracking across cycles
//!
//! Keeps a bounded ring of step signatures (key-term sets of what each cycle
//! said it did) and flags semantic repetition. The recommended action feeds
//! prompt strategy hints; a stuck trajectory terminates the run with
//! `stagnation`.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;

/// Ring capacity for recent step signatures
const MAX_STEPS: usize = 50;
/// Steps compared for repetition
const REPEAT_WINDOW: usize = 3;
/// Pairwise similarity above this counts as repetition
const SIMILARITY_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    Pivot,
    EarlyStop,
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Pivot => write!(f, "pivot"),
            Self::EarlyStop => write!(f, "early_stop"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrajectoryStats {
    pub steps_recorded: usize,
    pub is_stuck: bool,
    pub recommended_action: RecommendedAction,
    /// Mean pairwise similarity over the repeat window
    pub recent_similarity: f64,
}

/// Fixed-capacity ring of semantic step signatures
#[derive(Debug, Default)]
pub struct TrajectoryTracker {
    signatures: VecDeque<HashSet<String>>,
    total_recorded: usize,
}

fn signature(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 3)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 { 1.0 } else { intersection as f64 / union as f64 }
}

impl TrajectoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one cycle's step description
    pub fn record_step(&mut self, text: &str) {
        if self.signatures.len() == MAX_STEPS {
            self.signatures.pop_front();
        }
        self.signatures.push_back(signature(text));
        self.total_recorded += 1;
    }

    fn recent_similarity(&self) -> f64 {
        if self.signatures.len() < REPEAT_WINDOW {
            return 0.0;
        }
        let recent: Vec<&HashSet<String>> = self.signatures.iter().rev().take(REPEAT_WINDOW).collect();
        let mut total = 0.0;
        let mut pairs = 0;
        for i in 0..recent.len() {
            for j in (i + 1)..recent.len() {
                total += jaccard(recent[i], recent[j]);
                pairs += 1;
            }
        }
        if pairs == 0 { 0.0 } else { total / pairs as f64 }
    }

    /// The last few steps are near-duplicates of each other
    pub fn is_stuck(&self) -> bool {
        self.signatures.len() >= REPEAT_WINDOW && self.recent_similarity() > SIMILARITY_THRESHOLD
    }

    /// Strategy recommendation from repetition and score trend
    pub fn recommended_action(&self, recent_means: &[f64]) -> RecommendedAction {
        if self.is_stuck() {
            return RecommendedAction::EarlyStop;
        }
        // A strictly declining trend over three cycles suggests pivoting
        if recent_means.len() >= 3 {
            let tail = &recent_means[recent_means.len() - 3..];
            if tail.windows(2).all(|w| w[1] < w[0]) {
                return RecommendedAction::Pivot;
            }
        }
        RecommendedAction::Continue
    }

    pub fn stats(&self, recent_means: &[f64]) -> TrajectoryStats {
        TrajectoryStats {
            steps_recorded: self.total_recorded,
            is_stuck: self.is_stuck(),
            recommended_action: self.recommended_action(recent_means),
            recent_similarity: self.recent_similarity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetition_flags_stuck() {
        let mut tracker = TrajectoryTracker::new();
        for _ in 0..3 {
            tracker.record_step("refactor the scheduler queue locking again");
        }
        assert!(tracker.is_stuck());
        assert_eq!(tracker.recommended_action(&[0.7, 0.7, 0.7]), RecommendedAction::EarlyStop);
    }

    #[test]
    fn test_varied_steps_not_stuck() {
        let mut tracker = TrajectoryTracker::new();
        tracker.record_step("extract the heartbeat task into a weak handle");
        tracker.record_step("normalize score parsing and clamp bounds");
        tracker.record_step("rework commit exclusion policy for lockfiles");
        assert!(!tracker.is_stuck());
        assert_eq!(tracker.recommended_action(&[0.5, 0.6, 0.7]), RecommendedAction::Continue);
    }

    #[test]
    fn test_declining_scores_recommend_pivot() {
        let mut tracker = TrajectoryTracker::new();
        tracker.record_step("one direction");
        tracker.record_step("different direction entirely");
        assert_eq!(tracker.recommended_action(&[0.9, 0.7, 0.5]), RecommendedAction::Pivot);
    }

    #[test]
    fn test_ring_is_bounded_at_fifty() {
        let mut tracker = TrajectoryTracker::new();
        for i in 0..120 {
            tracker.record_step(&format!("unique step number {} with distinct words {}", i, i * 7));
        }
        assert_eq!(tracker.signatures.len(), MAX_STEPS);
        assert_eq!(tracker.stats(&[]).steps_recorded, 120);
    }

    #[test]
    fn test_too_few_steps_never_stuck() {
        let mut tracker = TrajectoryTracker::new();
        tracker.record_step("same thing");
        tracker.record_step("same thing");
        assert!(!tracker.is_stuck());
    }
}
