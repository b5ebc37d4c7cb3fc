//! The seven analysis perspectives

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Static definition of one perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PerspectiveSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

/// The fixed seven, applied in this order within a cycle
pub const PERSPECTIVES: [PerspectiveSpec; 7] = [
    PerspectiveSpec {
        id: "correctness",
        name: "Correctness",
        description: "Does the work actually do what the task requires? Hunt for logic errors, unhandled edge cases and broken invariants.",
    },
    PerspectiveSpec {
        id: "architecture",
        name: "Architecture",
        description: "Do the boundaries, ownership and data flow hold up? Look for leaking abstractions and misplaced responsibilities.",
    },
    PerspectiveSpec {
        id: "performance",
        name: "Performance",
        description: "Where does this spend time and memory? Look for needless allocation, serialization in hot paths and unbounded growth.",
    },
    PerspectiveSpec {
        id: "security",
        name: "Security",
        description: "What can an adversary or a confused caller do? Check input handling, secrets, filesystem and process boundaries.",
    },
    PerspectiveSpec {
        id: "maintainability",
        name: "Maintainability",
        description: "Will the next reader understand and safely change this? Check naming, duplication and the cost of likely changes.",
    },
    PerspectiveSpec {
        id: "testing",
        name: "Testing",
        description: "What claims are actually verified? Find untested branches, over-mocked seams and tests that cannot fail.",
    },
    PerspectiveSpec {
        id: "alternatives",
        name: "Alternatives",
        description: "Steelman a different approach. What simpler or more robust design was not taken, and does the difference matter?",
    },
];

/// Mutable per-run state for one perspective
#[derive(Debug, Clone, Serialize)]
pub struct PerspectiveState {
    pub spec: PerspectiveSpec,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub findings: Vec<String>,
    pub questions: Vec<String>,
    pub improvements: Vec<String>,
    pub score: f64,
}

impl PerspectiveState {
    pub fn new(spec: PerspectiveSpec) -> Self {
        Self {
            spec,
            last_applied_at: None,
            findings: Vec::new(),
            questions: Vec::new(),
            improvements: Vec::new(),
            score: 0.0,
        }
    }

    /// Fold one cycle's parsed result into the accumulated state
    pub fn record(&mut self, findings: &[String], questions: &[String], improvements: &[String], score: f64) {
        self.last_applied_at = Some(Utc::now());
        self.findings.extend_from_slice(findings);
        self.questions.extend_from_slice(questions);
        self.improvements.extend_from_slice(improvements);
        self.score = score.clamp(0.0, 1.0);
    }
}

/// Fresh state for all seven perspectives
pub fn initial_perspective_states() -> Vec<PerspectiveState> {
    PERSPECTIVES.iter().map(|spec| PerspectiveState::new(*spec)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_seven_with_unique_ids() {
        assert_eq!(PERSPECTIVES.len(), 7);
        let mut ids: Vec<&str> = PERSPECTIVES.iter().map(|p| p.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 7);
    }

    #[test]
    fn test_record_clamps_score() {
        let mut state = PerspectiveState::new(PERSPECTIVES[0]);
        state.record(&["finding".to_string()], &[], &[], 1.7);
        assert_eq!(state.score, 1.0);
        assert!(state.last_applied_at.is_some());
        assert_eq!(state.findings.len(), 1);
    }
}
