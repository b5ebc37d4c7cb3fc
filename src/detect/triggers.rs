//! Verification triggering
//!
//! Decides whether a detailed verification pass should run for an output,
//! using a closed set of trigger modes. High-stakes detection matches task
//! text against a fixed regex catalog and fires regardless of confidence.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Closed set of verification trigger modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    PostSubagent,
    PostTeam,
    LowConfidence,
    Explicit,
    HighStakes,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerDecision {
    pub trigger: bool,
    pub reason: String,
    pub mode: Option<TriggerMode>,
}

/// Caller context for trigger evaluation
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerContext {
    pub after_subagent: bool,
    pub after_team: bool,
    pub explicit_request: bool,
}

/// Fixed catalog of high-stakes categories and their patterns
static HIGH_STAKES_CATALOG: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let patterns: &[(&str, &str)] = &[
        (
            "destructive-operation",
            r"(?i)\b(rm\s+-rf|sudo\s+rm|drop\s+table|truncate\s+table|delete\s+from\s+\w+\s*;?\s*$|force[- ]delete|wipe|purge\s+all)",
        ),
        (
            "production-release",
            r"(?i)\b(deploy(ing|ment)?\s+to\s+prod|production\s+(deploy|release|database|environment)|release\s+v?\d|hotfix\s+to\s+prod)",
        ),
        (
            "security-sensitive",
            r"(?i)\b(password|secret|api[_ -]?key|private\s+key|credential|encrypt(ion)?|decrypt|certificate|oauth)",
        ),
        (
            "database-migration",
            r"(?i)\b(migrat(e|ion)|alter\s+table|schema\s+change|add\s+column|drop\s+column)",
        ),
        (
            "api-breakage",
            r"(?i)\b(breaking\s+change|remove\s+(the\s+)?endpoint|rename\s+public|change\s+the\s+wire\s+format|bump\s+major)",
        ),
        (
            "authorization",
            r"(?i)\b(permission|authoriz(e|ation)|access\s+control|rbac|acl|grant\s+(admin|root)|privilege)",
        ),
        (
            "infrastructure",
            r"(?i)\b(terraform|kubectl|helm\s+(install|upgrade|delete)|cloudformation|dns\s+record|load\s+balancer)",
        ),
        (
            "sensitive-data",
            r"(?i)\b(pii|personally\s+identifiable|ssn|credit\s+card|gdpr|phi|health\s+record)",
        ),
        (
            "dangerous-flags",
            r"(?i)(--force\b|push\s+-f\b|--hard\b|--no-verify\b|--allow-empty\b|--skip-checks\b)",
        ),
    ];
    patterns
        .iter()
        .map(|(name, pattern)| (*name, Regex::new(pattern).expect("high-stakes pattern")))
        .collect()
});

/// First matching high-stakes category for a text, if any
pub fn detect_high_stakes(text: &str) -> Option<&'static str> {
    HIGH_STAKES_CATALOG
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(name, _)| *name)
}

/// Confidence below this triggers a verification pass
const LOW_CONFIDENCE_THRESHOLD: f64 = 0.7;

pub fn should_trigger_verification(output: &str, confidence: Option<f64>, context: &TriggerContext) -> TriggerDecision {
    if context.explicit_request {
        return TriggerDecision {
            trigger: true,
            reason: "verification explicitly requested".to_string(),
            mode: Some(TriggerMode::Explicit),
        };
    }

    if let Some(category) = detect_high_stakes(output) {
        return TriggerDecision {
            trigger: true,
            reason: format!("high-stakes category matched: {}", category),
            mode: Some(TriggerMode::HighStakes),
        };
    }

    if let Some(c) = confidence
        && c < LOW_CONFIDENCE_THRESHOLD
    {
        return TriggerDecision {
            trigger: true,
            reason: format!("confidence {:.2} below threshold {:.2}", c, LOW_CONFIDENCE_THRESHOLD),
            mode: Some(TriggerMode::LowConfidence),
        };
    }

    if context.after_subagent {
        return TriggerDecision {
            trigger: true,
            reason: "subagent output requires a verification pass".to_string(),
            mode: Some(TriggerMode::PostSubagent),
        };
    }

    if context.after_team {
        return TriggerDecision {
            trigger: true,
            reason: "team output requires a verification pass".to_string(),
            mode: Some(TriggerMode::PostTeam),
        };
    }

    TriggerDecision {
        trigger: false,
        reason: "no trigger condition met".to_string(),
        mode: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_stakes_categories() {
        assert_eq!(detect_high_stakes("please run rm -rf /tmp/build"), Some("destructive-operation"));
        assert_eq!(detect_high_stakes("deploying to prod this evening"), Some("production-release"));
        assert_eq!(detect_high_stakes("rotate the api key"), Some("security-sensitive"));
        assert_eq!(detect_high_stakes("ALTER TABLE users ADD COLUMN age"), Some("database-migration"));
        assert_eq!(detect_high_stakes("git push -f origin main"), Some("dangerous-flags"));
        assert_eq!(detect_high_stakes("rename a local variable"), None);
    }

    #[test]
    fn test_high_stakes_beats_confidence() {
        let decision =
            should_trigger_verification("drop table accounts", Some(0.99), &TriggerContext::default());
        assert!(decision.trigger);
        assert_eq!(decision.mode, Some(TriggerMode::HighStakes));
    }

    #[test]
    fn test_explicit_wins_over_everything() {
        let context = TriggerContext {
            explicit_request: true,
            ..Default::default()
        };
        let decision = should_trigger_verification("drop table accounts", Some(0.1), &context);
        assert_eq!(decision.mode, Some(TriggerMode::Explicit));
    }

    #[test]
    fn test_low_confidence_triggers() {
        let decision = should_trigger_verification("benign refactor", Some(0.5), &TriggerContext::default());
        assert_eq!(decision.mode, Some(TriggerMode::LowConfidence));
    }

    #[test]
    fn test_post_subagent_and_team() {
        let subagent = TriggerContext {
            after_subagent: true,
            ..Default::default()
        };
        assert_eq!(
            should_trigger_verification("benign", Some(0.9), &subagent).mode,
            Some(TriggerMode::PostSubagent)
        );

        let team = TriggerContext {
            after_team: true,
            ..Default::default()
        };
        assert_eq!(
            should_trigger_verification("benign", Some(0.9), &team).mode,
            Some(TriggerMode::PostTeam)
        );
    }

    #[test]
    fn test_no_trigger() {
        let decision = should_trigger_verification("benign refactor", Some(0.9), &TriggerContext::default());
        assert!(!decision.trigger);
        assert!(decision.mode.is_none());
    }
}
