//! Claim/result mismatch detection
//!
//! Compares the `CLAIM:` and `RESULT:` lines of an output: diverging
//! negation or certainty polarity combined with low key-term overlap flags a
//! mismatch between what was claimed and what actually happened.

use std::collections::HashSet;

use serde::Serialize;

const NEGATION_WORDS: &[&str] = &[
    "not", "no", "never", "cannot", "can't", "didn't", "doesn't", "don't", "failed", "failing", "won't", "isn't",
    "wasn't", "unable",
];

pub(crate) const HEDGING_MARKERS: &[&str] = &[
    "might", "maybe", "perhaps", "possibly", "could", "unclear", "uncertain", "likely", "appears", "seems",
    "probably", "presumably",
];

pub(crate) const CERTAINTY_MARKERS: &[&str] = &[
    "definitely",
    "certainly",
    "clearly",
    "always",
    "must",
    "proven",
    "guaranteed",
    "absolutely",
    "confirmed",
    "undoubtedly",
];

const STOP_WORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "been", "were", "will", "would", "should", "could", "there", "their",
    "about", "which", "when", "where", "what", "then", "than", "because", "very", "just", "also", "into", "over",
    "after", "before", "does", "doing", "only",
];

#[derive(Debug, Clone, Serialize)]
pub struct MismatchReport {
    pub mismatch: bool,
    pub reasons: Vec<String>,
    pub claim: Option<String>,
    pub result: Option<String>,
    pub key_term_overlap: f64,
}

/// Extract the text after a `LABEL:` prefix on any line
pub(crate) fn labeled_line(output: &str, label: &str) -> Option<String> {
    let prefix = format!("{}:", label);
    output.lines().find_map(|line| {
        let trimmed = line.trim();
        trimmed
            .strip_prefix(&prefix)
            .or_else(|| trimmed.strip_prefix(&prefix.to_lowercase()))
            .map(|rest| rest.trim().to_string())
    })
}

pub(crate) fn contains_any(text: &str, markers: &[&str]) -> bool {
    count_markers(text, markers) > 0
}

pub(crate) fn count_markers(text: &str, markers: &[&str]) -> usize {
    let lower = text.to_lowercase();
    markers.iter().filter(|m| lower.contains(*m)).count()
}

/// Words longer than three characters, lowercased, minus stop words
pub(crate) fn key_terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

pub fn detect_claim_result_mismatch(output: &str) -> MismatchReport {
    let claim = labeled_line(output, "CLAIM");
    let result = labeled_line(output, "RESULT");

    let (Some(claim_text), Some(result_text)) = (claim.clone(), result.clone()) else {
        return MismatchReport {
            mismatch: false,
            reasons: vec![],
            claim,
            result,
            key_term_overlap: 0.0,
        };
    };

    let mut reasons = Vec::new();

    let claim_negated = contains_any(&claim_text, NEGATION_WORDS);
    let result_negated = contains_any(&result_text, NEGATION_WORDS);
    if claim_negated != result_negated {
        reasons.push("negation polarity differs between claim and result".to_string());
    }

    let claim_certain = contains_any(&claim_text, CERTAINTY_MARKERS) && !contains_any(&claim_text, HEDGING_MARKERS);
    let result_hedged = contains_any(&result_text, HEDGING_MARKERS);
    if claim_certain && result_hedged {
        reasons.push("claim is high-certainty but result is hedged".to_string());
    }

    let claim_terms = key_terms(&claim_text);
    let result_terms = key_terms(&result_text);
    let overlap = if claim_terms.is_empty() {
        1.0
    } else {
        claim_terms.intersection(&result_terms).count() as f64 / claim_terms.len() as f64
    };

    let mismatch = !reasons.is_empty() && overlap < 0.3;
    if mismatch {
        reasons.push(format!("key-term overlap is low ({:.2})", overlap));
    }

    MismatchReport {
        mismatch,
        reasons,
        claim,
        result,
        key_term_overlap: overlap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_claim_and_result() {
        let report = detect_claim_result_mismatch(
            "CLAIM: the parser handles empty input correctly\nRESULT: parser handled empty input correctly in tests",
        );
        assert!(!report.mismatch);
        assert!(report.key_term_overlap > 0.5);
    }

    #[test]
    fn test_negation_flip_with_low_overlap_is_mismatch() {
        let report = detect_claim_result_mismatch(
            "CLAIM: the migration definitely completed successfully\nRESULT: connection failed, nothing was written",
        );
        assert!(report.mismatch);
        assert!(report.reasons.iter().any(|r| r.contains("negation")));
    }

    #[test]
    fn test_certain_claim_hedged_result() {
        let report = detect_claim_result_mismatch(
            "CLAIM: caching is definitely fixed\nRESULT: latency seems lower, possibly an improvement elsewhere",
        );
        assert!(report.reasons.iter().any(|r| r.contains("hedged")));
    }

    #[test]
    fn test_missing_sections_never_flag() {
        let report = detect_claim_result_mismatch("no structured sections here");
        assert!(!report.mismatch);
        assert!(report.claim.is_none());
    }

    #[test]
    fn test_key_terms_filter_stop_words() {
        let terms = key_terms("This should have been about the parser module");
        assert!(terms.contains("parser"));
        assert!(terms.contains("module"));
        assert!(!terms.contains("this"));
        assert!(!terms.contains("the"));
    }
}
