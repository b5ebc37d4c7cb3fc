//! Bias and shallow-root-cause pattern detectors
//!
//! Each detector scans an output for language patterns that indicate
//! overconfidence, one-sided evidence, or symptom-only fixes. All detectors
//! are pure functions returning `None` when the pattern is absent.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use super::mismatch::{CERTAINTY_MARKERS, HEDGING_MARKERS, contains_any, count_markers, labeled_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Overconfidence,
    MissingAlternatives,
    ConfirmationBias,
    FirstReasonStopping,
    ProximityBias,
    ConcretenessBias,
    PalliativeFix,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectedPattern {
    pub kind: PatternKind,
    pub confidence: f64,
    pub evidence: String,
}

static FILE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w./-]+\.(rs|py|ts|js|go|java|c|h|toml|json|yml|yaml|md)\b").expect("file regex"));
static LINE_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(:\d+|\bline\s+\d+)").expect("line regex"));

/// Parse the `CONFIDENCE:` line as a number in [0, 1]
pub fn parse_confidence(output: &str) -> Option<f64> {
    let raw = labeled_line(output, "CONFIDENCE")?;
    let token = raw.split_whitespace().next()?;
    let value: f64 = token.trim_end_matches('%').parse().ok()?;
    let normalized = if token.ends_with('%') || value > 1.0 { value / 100.0 } else { value };
    Some(normalized.clamp(0.0, 1.0))
}

/// Collect the `EVIDENCE:` block: the labeled line plus following indented or
/// bulleted lines up to a blank line or the next `LABEL:` section
pub fn evidence_block(output: &str) -> String {
    let mut lines = output.lines();
    let mut block = String::new();

    for line in lines.by_ref() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("EVIDENCE:") {
            block.push_str(rest.trim());
            break;
        }
    }

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        // A new LABEL: section ends the block
        if trimmed
            .split(':')
            .next()
            .is_some_and(|head| !head.is_empty() && head.chars().all(|c| c.is_ascii_uppercase() || c == '_'))
            && trimmed.contains(':')
        {
            break;
        }
        block.push('\n');
        block.push_str(trimmed);
    }

    block.trim().to_string()
}

fn evidence_is_specific(evidence: &str) -> bool {
    FILE_REF.is_match(evidence) || LINE_REF.is_match(evidence) || evidence.contains('`')
}

/// High confidence with thin, vague or one-note evidence
pub fn detect_overconfidence(output: &str) -> Option<DetectedPattern> {
    let confidence = parse_confidence(output)?;
    let evidence = evidence_block(output);

    if confidence > 0.9 && evidence.len() < 100 {
        return Some(DetectedPattern {
            kind: PatternKind::Overconfidence,
            confidence: 0.9,
            evidence: format!("confidence {:.2} with only {} chars of evidence", confidence, evidence.len()),
        });
    }

    if confidence > 0.85 {
        let high_certainty = count_markers(output, CERTAINTY_MARKERS);
        let hedged = contains_any(output, HEDGING_MARKERS);
        if high_certainty >= 2 && !hedged {
            return Some(DetectedPattern {
                kind: PatternKind::Overconfidence,
                confidence: 0.8,
                evidence: format!("{} high-certainty markers without any hedging", high_certainty),
            });
        }
        if !evidence.is_empty() && !evidence_is_specific(&evidence) {
            return Some(DetectedPattern {
                kind: PatternKind::Overconfidence,
                confidence: 0.7,
                evidence: "evidence cites no file, line number or code reference".to_string(),
            });
        }
    }

    None
}

/// A high-confidence conclusion with no alternatives or limitations discussed
pub fn detect_missing_alternatives(output: &str) -> Option<DetectedPattern> {
    let lower = output.to_lowercase();
    let has_conclusion = labeled_line(output, "CONCLUSION").is_some()
        || lower.contains("the root cause is")
        || lower.contains("therefore");
    if !has_conclusion {
        return None;
    }

    let high_confidence =
        parse_confidence(output).is_some_and(|c| c > 0.8) || contains_any(output, CERTAINTY_MARKERS);
    if !high_confidence {
        return None;
    }

    const ALTERNATIVE_MARKERS: &[&str] = &[
        "alternative",
        "other explanation",
        "counter-evidence",
        "however",
        "on the other hand",
        "limitation",
        "caveat",
        "could also be",
        "another possibility",
    ];
    if contains_any(output, ALTERNATIVE_MARKERS) {
        return None;
    }

    Some(DetectedPattern {
        kind: PatternKind::MissingAlternatives,
        confidence: 0.75,
        evidence: "confident conclusion without alternatives, counter-evidence or limitations".to_string(),
    })
}

/// Evidence that only ever confirms, with no search for disconfirmation
pub fn detect_confirmation_bias(output: &str) -> Option<DetectedPattern> {
    const POSITIVE: &[&str] = &["confirms", "consistent with", "supports", "as expected", "matches", "validates"];
    const NEGATIVE: &[&str] = &["contradicts", "inconsistent", "unexpected", "conflicts", "refutes"];
    const DISCONFIRMATION: &[&str] = &[
        "tried to disprove",
        "looked for counter",
        "checked whether",
        "ruled out",
        "falsify",
        "searched for evidence against",
    ];

    let positives = count_markers(output, POSITIVE);
    if positives >= 3 && !contains_any(output, NEGATIVE) && !contains_any(output, DISCONFIRMATION) {
        return Some(DetectedPattern {
            kind: PatternKind::ConfirmationBias,
            confidence: 0.7,
            evidence: format!("{} confirming markers, zero disconfirming or counter-search markers", positives),
        });
    }
    None
}

/// Stopping at the first plausible cause without considering others
pub fn detect_first_reason_stopping(output: &str) -> Option<DetectedPattern> {
    let lower = output.to_lowercase();
    let single_cause = lower.contains("the reason is") || lower.contains("the cause is");
    const ENUMERATION: &[&str] = &["also", "additionally", "another", "second reason", "other factor", "as well"];

    if single_cause && !contains_any(output, ENUMERATION) {
        return Some(DetectedPattern {
            kind: PatternKind::FirstReasonStopping,
            confidence: 0.6,
            evidence: "a single cause is asserted with no other factors considered".to_string(),
        });
    }
    None
}

/// Blaming only the most recent change without looking further back
pub fn detect_proximity_bias(output: &str) -> Option<DetectedPattern> {
    const RECENT: &[&str] = &["recent change", "latest change", "the diff", "just changed", "last commit"];
    const HISTORY: &[&str] = &["pre-existing", "unchanged", "already present", "older code", "history", "before this change"];

    if count_markers(output, RECENT) >= 1 && !contains_any(output, HISTORY) {
        return Some(DetectedPattern {
            kind: PatternKind::ProximityBias,
            confidence: 0.55,
            evidence: "only recent changes are considered as the cause".to_string(),
        });
    }
    None
}

/// Fixating on visible artifacts instead of the underlying design
pub fn detect_concreteness_bias(output: &str) -> Option<DetectedPattern> {
    const ABSTRACT: &[&str] = &["design", "architecture", "invariant", "contract", "protocol", "lifecycle"];
    let concrete = FILE_REF.find_iter(output).count();
    let lower = output.to_lowercase();
    let fixes = lower.contains("fix") || lower.contains("patch");

    if fixes && concrete >= 3 && !contains_any(output, ABSTRACT) {
        return Some(DetectedPattern {
            kind: PatternKind::ConcretenessBias,
            confidence: 0.5,
            evidence: format!("{} concrete file references with no structural analysis", concrete),
        });
    }
    None
}

/// Symptom-suppressing fixes rather than root-cause fixes
pub fn detect_palliative_fix(output: &str) -> Option<DetectedPattern> {
    const PALLIATIVE: &[&str] = &[
        "workaround",
        "suppress",
        "silence the error",
        "catch and ignore",
        "band-aid",
        "quick fix",
        "paper over",
        "retry until",
        "mask the",
    ];
    let hits = count_markers(output, PALLIATIVE);
    if hits >= 1 {
        return Some(DetectedPattern {
            kind: PatternKind::PalliativeFix,
            confidence: (0.5 + 0.15 * hits as f64).min(0.9),
            evidence: "fix language suggests suppressing the symptom rather than the cause".to_string(),
        });
    }
    None
}

/// Run every detector and keep patterns at or above `min_confidence`
pub fn run_detection_pass(output: &str, min_confidence: f64) -> Vec<DetectedPattern> {
    [
        detect_overconfidence(output),
        detect_missing_alternatives(output),
        detect_confirmation_bias(output),
        detect_first_reason_stopping(output),
        detect_proximity_bias(output),
        detect_concreteness_bias(output),
        detect_palliative_fix(output),
    ]
    .into_iter()
    .flatten()
    .filter(|p| p.confidence >= min_confidence)
    .collect()
}
