//! Per-run loop state

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detect::MetacognitiveCheck;
use crate::domain::RunId;

/// Cycle summaries kept in the ring
const MAX_CYCLE_SUMMARIES: usize = 20;
/// Successful patterns kept in the ring
const MAX_SUCCESS_PATTERNS: usize = 10;
/// Length cap for a pattern's action summary
const ACTION_SUMMARY_MAX_CHARS: usize = 100;

/// UL-mode phase; cycle mode stays in `Completed` semantics at run end only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Research,
    Plan,
    Implement,
    Completed,
}

impl Phase {
    /// Fixed order within a cycle; `Implement` wraps to `Research`
    pub fn next(&self) -> Phase {
        match self {
            Phase::Research => Phase::Plan,
            Phase::Plan => Phase::Implement,
            Phase::Implement => Phase::Research,
            Phase::Completed => Phase::Completed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Completed => "completed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(Phase::Research),
            "plan" => Ok(Phase::Plan),
            "implement" => Ok(Phase::Implement),
            "completed" => Ok(Phase::Completed),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequest,
    Completed,
    Error,
    Stagnation,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequest => write!(f, "user_request"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Stagnation => write!(f, "stagnation"),
        }
    }
}

/// Seven-valued score vector for one cycle
#[derive(Debug, Clone, Serialize)]
pub struct ScoreVector {
    pub cycle: u32,
    pub scores: Vec<f64>,
    pub mean: f64,
}

impl ScoreVector {
    pub fn new(cycle: u32, scores: Vec<f64>) -> Self {
        let mean = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        Self { cycle, scores, mean }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle: u32,
    pub mean_score: f64,
    pub summary: String,
    pub commit_hash: Option<String>,
}

/// A high-scoring cycle worth repeating
#[derive(Debug, Clone, Serialize)]
pub struct SuccessfulPattern {
    pub cycle: u32,
    pub avg_score: f64,
    pub action_summary: String,
    pub applied_perspectives: Vec<String>,
}

impl SuccessfulPattern {
    pub fn new(cycle: u32, avg_score: f64, action_summary: &str, applied_perspectives: Vec<String>) -> Self {
        let mut action_summary = action_summary.trim().to_string();
        if action_summary.len() > ACTION_SUMMARY_MAX_CHARS {
            let cut = action_summary
                .char_indices()
                .take_while(|(i, _)| *i < ACTION_SUMMARY_MAX_CHARS)
                .count();
            action_summary.truncate(cut);
            action_summary.push('…');
        }
        Self {
            cycle,
            avg_score,
            action_summary,
            applied_perspectives,
        }
    }
}

/// Coarse live status shared between a running engine and the manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunProgress {
    pub cycle: u32,
    pub mean_score: f64,
    pub current_phase: Option<String>,
    pub finished: bool,
    pub stop_reason: Option<StopReason>,
    pub trajectory_stats: Option<super::trajectory::TrajectoryStats>,
}

/// Options supplied when starting a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub task: String,
    pub max_cycles: u32,
    pub auto_commit: bool,
    pub ul_mode: bool,
    pub auto_approve: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            task: String::new(),
            max_cycles: 10,
            auto_commit: true,
            ul_mode: true,
            auto_approve: true,
        }
    }
}

/// Full mutable state for one active run
#[derive(Debug)]
pub struct LoopRunState {
    pub run_id: RunId,
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub max_cycles: u32,
    pub auto_commit: bool,
    pub ul_mode: bool,
    pub auto_approve: bool,

    pub cycle: u32,
    pub in_flight_cycle: Option<u32>,
    pub current_phase: Phase,
    pub phase_retry_count: u32,
    /// Phase outputs carried between phases within a cycle
    pub phase_context: HashMap<String, String>,

    pub cycle_summaries: VecDeque<CycleSummary>,
    pub perspective_score_history: Vec<ScoreVector>,
    pub successful_patterns: VecDeque<SuccessfulPattern>,

    pub stop_requested: bool,
    pub stop_reason: Option<StopReason>,
    pub last_commit_hash: Option<String>,

    pub files_changed_before_cycle: HashSet<String>,
    pub gitignore_patterns_to_add: BTreeSet<String>,

    /// Latest metacognitive check, feeding next-cycle quality guidance
    pub last_metacog: Option<MetacognitiveCheck>,
    /// Outstanding improvement actions collected from low-score cycles
    pub improvement_actions: Vec<String>,

    pub stagnation_streak: u32,
}

impl LoopRunState {
    pub fn new(options: RunOptions) -> Self {
        Self {
            run_id: RunId::new(),
            task: options.task,
            started_at: Utc::now(),
            max_cycles: options.max_cycles,
            auto_commit: options.auto_commit,
            ul_mode: options.ul_mode,
            auto_approve: options.auto_approve,
            cycle: 0,
            in_flight_cycle: None,
            current_phase: Phase::Research,
            phase_retry_count: 0,
            phase_context: HashMap::new(),
            cycle_summaries: VecDeque::new(),
            perspective_score_history: Vec::new(),
            successful_patterns: VecDeque::new(),
            stop_requested: false,
            stop_reason: None,
            last_commit_hash: None,
            files_changed_before_cycle: HashSet::new(),
            gitignore_patterns_to_add: BTreeSet::new(),
            last_metacog: None,
            improvement_actions: Vec::new(),
            stagnation_streak: 0,
        }
    }

    pub fn push_cycle_summary(&mut self, summary: CycleSummary) {
        if self.cycle_summaries.len() == MAX_CYCLE_SUMMARIES {
            self.cycle_summaries.pop_front();
        }
        self.cycle_summaries.push_back(summary);
    }

    pub fn push_successful_pattern(&mut self, pattern: SuccessfulPattern) {
        if self.successful_patterns.len() == MAX_SUCCESS_PATTERNS {
            self.successful_patterns.pop_front();
        }
        self.successful_patterns.push_back(pattern);
    }

    /// Means of the most recent `n` cycles, oldest first
    pub fn recent_means(&self, n: usize) -> Vec<f64> {
        let history = &self.perspective_score_history;
        history.iter().skip(history.len().saturating_sub(n)).map(|v| v.mean).collect()
    }

    /// Update the stagnation streak from a three-sample variance window;
    /// returns true once the streak reaches `max_count`
    pub fn check_stagnation(&mut self, threshold: f64, max_count: u32) -> bool {
        let means = self.recent_means(3);
        if means.len() < 3 {
            return false;
        }

        let mean = means.iter().sum::<f64>() / means.len() as f64;
        let variance = means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / means.len() as f64;

        if variance < (1.0 - threshold) * 0.1 {
            self.stagnation_streak += 1;
        } else {
            self.stagnation_streak = 0;
        }

        self.stagnation_streak >= max_count
    }
}
