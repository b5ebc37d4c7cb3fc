//! Metacognitive check over concatenated perspective output
//!
//! Scans an output for reasoning-quality signals: binary oppositions,
//! aporias, desire-production cues, inner-authoritarianism, the pleasure
//! trap, totalitarian-risk cues, thinking modes, logical fallacies and the
//! inference chain. Everything here is a pure function over text; the
//! resulting record feeds next-cycle prompt guidance and the
//! inference-depth monitoring score.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use super::mismatch::{contains_any, count_markers, labeled_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingMode {
    Fast,
    Deliberate,
    Reflective,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkingModeAssessment {
    pub current: ThinkingMode,
    pub recommended: ThinkingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fallacy {
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceValidity {
    Valid,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceChain {
    pub premises: Vec<String>,
    pub conclusion: Option<String>,
    pub steps: usize,
    pub validity: InferenceValidity,
    pub gaps: Vec<String>,
}

/// One field per philosophical lens, plus reasoning-structure records
#[derive(Debug, Clone, Serialize)]
pub struct MetacognitiveCheck {
    pub binary_oppositions: Vec<(String, String)>,
    pub aporias: Vec<String>,
    pub desire_production: Vec<String>,
    pub inner_authoritarianism: Vec<String>,
    pub pleasure_trap: bool,
    pub totalitarian_risk: Vec<String>,
    pub metacognition_level: f64,
    pub thinking_mode: ThinkingModeAssessment,
    pub fallacies: Vec<Fallacy>,
    pub inference: InferenceChain,
    pub valid_patterns: Vec<String>,
    pub invalid_patterns: Vec<String>,
}

static OPPOSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([\w-]+)\s+(?:vs\.?|versus)\s+([\w-]+)").expect("opposition regex"));
static EITHER_OR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\beither\s+([\w\s-]{1,40}?)\s+or\s+([\w\s-]{1,40}?)[.,;]").expect("either regex"));

const APORIA_MARKERS: &[&str] = &["paradox", "contradiction", "tension between", "aporia", "dilemma", "impasse"];
const DESIRE_MARKERS: &[&str] = &["i want", "tempting", "satisfying to", "would love", "desire to", "eager to"];
const AUTHORITARIAN_MARKERS: &[&str] = &[
    "must always",
    "never allowed",
    "strictly forbidden",
    "mandatory",
    "should never",
    "no exceptions",
    "non-negotiable",
];
const TOTALITARIAN_MARKERS: &[&str] = &[
    "the only way",
    "only correct approach",
    "everything must",
    "all code must",
    "complete rewrite",
    "replace everything",
];
const PLEASURE_MARKERS: &[&str] = &["elegant", "beautiful", "satisfying", "clean solution", "delightful"];
const VERIFICATION_MARKERS: &[&str] = &["test", "verified", "measured", "benchmark", "reproduced", "checked"];
const REFLECTION_MARKERS: &[&str] = &[
    "i might be wrong",
    "assumption",
    "uncertain",
    "on reflection",
    "reconsider",
    "let me step back",
    "i could be missing",
];
const DELIBERATION_MARKERS: &[&str] = &["first", "second", "step ", "then ", "next,"];
const GAP_MARKERS: &[&str] = &["unverified", "assume", "assuming", "not yet checked", "untested"];

fn sentences_containing(output: &str, markers: &[&str]) -> Vec<String> {
    let lower_markers: Vec<String> = markers.iter().map(|m| m.to_lowercase()).collect();
    output
        .split(['.', '\n'])
        .filter(|s| {
            let lower = s.to_lowercase();
            lower_markers.iter().any(|m| lower.contains(m))
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(5)
        .collect()
}

fn detect_fallacies(output: &str) -> Vec<Fallacy> {
    let lower = output.to_lowercase();
    let mut fallacies = Vec::new();

    if lower.contains("it works now, so") || lower.contains("passed, so the fix") || lower.contains("since it works") {
        fallacies.push(Fallacy {
            kind: "affirming_the_consequent".to_string(),
            description: "treats a passing run as proof the explanation was correct".to_string(),
        });
    }
    if (lower.contains("always") || lower.contains("never")) && lower.contains("one case") {
        fallacies.push(Fallacy {
            kind: "hasty_generalization".to_string(),
            description: "generalizes from a single observed case".to_string(),
        });
    }
    if lower.contains("after i changed") && lower.contains("therefore") {
        fallacies.push(Fallacy {
            kind: "post_hoc".to_string(),
            description: "infers causation from temporal order alone".to_string(),
        });
    }
    if lower.contains("best practice says") || lower.contains("everyone does it this way") {
        fallacies.push(Fallacy {
            kind: "appeal_to_authority".to_string(),
            description: "substitutes convention for evidence".to_string(),
        });
    }

    fallacies
}

fn extract_inference(output: &str, fallacies: &[Fallacy]) -> InferenceChain {
    let mut premises: Vec<String> = output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            trimmed
                .strip_prefix("- ")
                .filter(|_| {
                    let lower = trimmed.to_lowercase();
                    lower.contains("because") || lower.contains("given") || lower.contains("since")
                })
                .map(|p| p.to_string())
        })
        .collect();
    if premises.is_empty() {
        premises = sentences_containing(output, &["because", "given that"]);
    }
    premises.truncate(5);

    let lower = output.to_lowercase();
    let conclusion = labeled_line(output, "CONCLUSION").or_else(|| {
        sentences_containing(output, &["therefore", "thus", "hence"])
            .first()
            .cloned()
    });

    let steps: usize = ["therefore", "thus", "hence", " so "]
        .iter()
        .map(|m| lower.matches(m).count())
        .sum();

    let validity = match (&conclusion, premises.is_empty(), fallacies.is_empty()) {
        (Some(_), _, false) => InferenceValidity::Invalid,
        (Some(_), false, true) => InferenceValidity::Valid,
        _ => InferenceValidity::Unknown,
    };

    InferenceChain {
        premises,
        conclusion,
        steps,
        validity,
        gaps: sentences_containing(output, GAP_MARKERS),
    }
}

pub fn run_metacognitive_check(output: &str) -> MetacognitiveCheck {
    let mut binary_oppositions: Vec<(String, String)> = OPPOSITION
        .captures_iter(output)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    binary_oppositions.extend(
        EITHER_OR
            .captures_iter(output)
            .map(|c| (c[1].trim().to_string(), c[2].trim().to_string())),
    );
    binary_oppositions.truncate(5);

    let pleasure_hits = count_markers(output, PLEASURE_MARKERS);
    let pleasure_trap = pleasure_hits >= 2 && !contains_any(output, VERIFICATION_MARKERS);

    let metacognition_level = (count_markers(output, REFLECTION_MARKERS) as f64 / 5.0).min(1.0);

    let fallacies = detect_fallacies(output);
    let inference = extract_inference(output, &fallacies);

    let current = if metacognition_level > 0.2 {
        ThinkingMode::Reflective
    } else if contains_any(output, DELIBERATION_MARKERS) {
        ThinkingMode::Deliberate
    } else {
        ThinkingMode::Fast
    };
    let recommended = if !fallacies.is_empty() || inference.validity == InferenceValidity::Invalid {
        ThinkingMode::Reflective
    } else {
        ThinkingMode::Deliberate
    };

    let mut valid_patterns = Vec::new();
    let mut invalid_patterns = Vec::new();
    if !inference.premises.is_empty() {
        valid_patterns.push("explicit premises".to_string());
    }
    if output.to_lowercase().contains("alternative") {
        valid_patterns.push("considers alternatives".to_string());
    }
    if contains_any(output, VERIFICATION_MARKERS) {
        valid_patterns.push("cites verification".to_string());
    }
    if inference.conclusion.is_some() && inference.premises.is_empty() {
        invalid_patterns.push("unsupported conclusion".to_string());
    }
    for fallacy in &fallacies {
        invalid_patterns.push(fallacy.kind.clone());
    }

    MetacognitiveCheck {
        binary_oppositions,
        aporias: sentences_containing(output, APORIA_MARKERS),
        desire_production: sentences_containing(output, DESIRE_MARKERS),
        inner_authoritarianism: sentences_containing(output, AUTHORITARIAN_MARKERS),
        pleasure_trap,
        totalitarian_risk: sentences_containing(output, TOTALITARIAN_MARKERS),
        metacognition_level,
        thinking_mode: ThinkingModeAssessment { current, recommended },
        fallacies,
        inference,
        valid_patterns,
        invalid_patterns,
    }
}

/// Aggregate the check into a single monitoring score in [0, 1]
///
/// Baseline 0.5, adjusted by bounded contributions per category. Never gates
/// termination.
pub fn inference_depth_score(check: &MetacognitiveCheck) -> f64 {
    let mut score: f64 = 0.5;

    score += 0.1 * (check.inference.premises.len().min(3) as f64 / 3.0);
    score += match check.inference.validity {
        InferenceValidity::Valid => 0.15,
        InferenceValidity::Invalid => -0.15,
        InferenceValidity::Unknown => 0.0,
    };
    if check.inference.steps >= 2 {
        score += 0.05;
    }
    score += 0.1 * check.metacognition_level;
    score -= 0.05 * check.fallacies.len().min(3) as f64;
    if check.pleasure_trap {
        score -= 0.05;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_oppositions_detected() {
        let check = run_metacognitive_check("We debated mutex vs channel, and either locking or copying, for this.");
        assert!(
            check
                .binary_oppositions
                .contains(&("mutex".to_string(), "channel".to_string()))
        );
        assert!(check.binary_oppositions.len() >= 2);
    }

    #[test]
    fn test_pleasure_trap_requires_absent_verification() {
        let trapped = run_metacognitive_check("Such an elegant, satisfying design, truly beautiful work.");
        assert!(trapped.pleasure_trap);

        let grounded = run_metacognitive_check("An elegant and satisfying design, verified by the regression test.");
        assert!(!grounded.pleasure_trap);
    }

    #[test]
    fn test_fallacy_and_invalid_inference() {
        let check = run_metacognitive_check(
            "CONCLUSION: the fix was right\nIt works now, so the original diagnosis must have been correct.",
        );
        assert!(check.fallacies.iter().any(|f| f.kind == "affirming_the_consequent"));
        assert_eq!(check.inference.validity, InferenceValidity::Invalid);
        assert_eq!(check.thinking_mode.recommended, ThinkingMode::Reflective);
    }

    #[test]
    fn test_valid_inference_with_premises() {
        let check = run_metacognitive_check(
            "- because the cursor is shared, two workers can race\n- given the lock is dropped early\nCONCLUSION: the claim step must hold the lock",
        );
        assert_eq!(check.inference.validity, InferenceValidity::Valid);
        assert!(check.valid_patterns.contains(&"explicit premises".to_string()));
    }

    #[test]
    fn test_metacognition_level_from_reflection() {
        let check = run_metacognitive_check(
            "I might be wrong here; this rests on an assumption I should reconsider. On reflection the timing is uncertain.",
        );
        assert!(check.metacognition_level >= 0.6);
        assert_eq!(check.thinking_mode.current, ThinkingMode::Reflective);
    }

    #[test]
    fn test_depth_score_bounds_and_direction() {
        let weak = run_metacognitive_check("CONCLUSION: done. It works now, so the fix was right.");
        let strong = run_metacognitive_check(
            "- because the heartbeat expired, the record is dead\n- given peers only read, deletion is safe\nTherefore cleanup can delete it. Thus the invariant holds. Verified by test. I might be wrong about clock skew, an assumption worth checking.",
        );

        let weak_score = inference_depth_score(&weak);
        let strong_score = inference_depth_score(&strong);
        assert!((0.0..=1.0).contains(&weak_score));
        assert!((0.0..=1.0).contains(&strong_score));
        assert!(strong_score > weak_score);
    }
}
