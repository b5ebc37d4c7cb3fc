//! Parsers for perspective output and UL phase responses
//!
//! All parsers are total: malformed input yields defaults (empty sections,
//! score 0.5) so the loop can always continue.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use super::run_state::Phase;

/// Parsed structured perspective output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerspectiveResult {
    pub findings: Vec<String>,
    pub questions: Vec<String>,
    pub improvements: Vec<String>,
    /// Normalized to [0, 1]; defaults to 0.5 when missing or malformed
    pub score: f64,
    pub summary: String,
    pub next_focus: Option<String>,
}

impl Default for PerspectiveResult {
    fn default() -> Self {
        Self {
            findings: Vec::new(),
            questions: Vec::new(),
            improvements: Vec::new(),
            score: 0.5,
            summary: String::new(),
            next_focus: None,
        }
    }
}

const SECTION_HEADERS: &[&str] = &[
    "FINDINGS",
    "QUESTIONS",
    "IMPROVEMENTS",
    "SCORE",
    "SUMMARY",
    "NEXT_FOCUS",
    "PERSPECTIVE_SCORES",
    "LOOP_STATUS",
];

fn is_section_header(line: &str) -> Option<(&'static str, &str)> {
    let trimmed = line.trim();
    SECTION_HEADERS.iter().find_map(|header| {
        trimmed
            .strip_prefix(header)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(|rest| (*header, rest.trim()))
    })
}

fn push_bullet(items: &mut Vec<String>, line: &str) {
    let trimmed = line.trim();
    let content = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
        .or_else(|| {
            // Numbered bullets: "1. item"
            trimmed
                .split_once(". ")
                .filter(|(n, _)| n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty())
                .map(|(_, rest)| rest)
        })
        .unwrap_or(trimmed);
    if !content.is_empty() {
        items.push(content.to_string());
    }
}

/// Clamp an extracted 0..100 score and normalize to [0, 1]
pub fn normalize_score(value: f64) -> f64 {
    value.clamp(0.0, 100.0) / 100.0
}

fn parse_score_token(raw: &str) -> Option<f64> {
    let token = raw.split_whitespace().next()?;
    let token = token.trim_end_matches(['%', '.', ',']);
    let token = token.split('/').next()?;
    token.parse::<f64>().ok().map(normalize_score)
}

/// Parse structured `FINDINGS/QUESTIONS/IMPROVEMENTS/SCORE/SUMMARY` output
pub fn parse_perspective_output(output: &str) -> PerspectiveResult {
    let mut result = PerspectiveResult::default();
    let mut current: Option<&str> = None;
    let mut score_seen = false;
    let mut summary_lines: Vec<String> = Vec::new();

    for line in output.lines() {
        if let Some((header, inline)) = is_section_header(line) {
            current = Some(header);
            match header {
                "SCORE" => {
                    if let Some(score) = parse_score_token(inline) {
                        result.score = score;
                        score_seen = true;
                    }
                    current = None;
                }
                "SUMMARY" => {
                    if !inline.is_empty() {
                        summary_lines.push(inline.to_string());
                    }
                }
                "NEXT_FOCUS" => {
                    if !inline.is_empty() {
                        result.next_focus = Some(inline.to_string());
                    }
                    current = None;
                }
                "FINDINGS" if !inline.is_empty() => push_bullet(&mut result.findings, inline),
                "QUESTIONS" if !inline.is_empty() => push_bullet(&mut result.questions, inline),
                "IMPROVEMENTS" if !inline.is_empty() => push_bullet(&mut result.improvements, inline),
                _ => {}
            }
            continue;
        }

        match current {
            Some("FINDINGS") => push_bullet(&mut result.findings, line),
            Some("QUESTIONS") => push_bullet(&mut result.questions, line),
            Some("IMPROVEMENTS") => push_bullet(&mut result.improvements, line),
            Some("SUMMARY") => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    summary_lines.push(trimmed.to_string());
                }
            }
            _ => {}
        }
    }

    result.summary = summary_lines.join(" ");
    if !score_seen {
        result.score = 0.5;
    }
    result
}

/// Reserialize a parsed result into the canonical section shape
pub fn serialize_perspective_result(result: &PerspectiveResult) -> String {
    let mut out = String::new();
    out.push_str("FINDINGS:\n");
    for item in &result.findings {
        out.push_str(&format!("- {}\n", item));
    }
    out.push_str("QUESTIONS:\n");
    for item in &result.questions {
        out.push_str(&format!("- {}\n", item));
    }
    out.push_str("IMPROVEMENTS:\n");
    for item in &result.improvements {
        out.push_str(&format!("- {}\n", item));
    }
    out.push_str(&format!("SCORE: {:.0}\n", result.score * 100.0));
    out.push_str(&format!("SUMMARY: {}\n", result.summary));
    out
}

/// Parse `PERSPECTIVE_SCORES: 80, 75, 90, ...` (each clamped to 0..100)
pub fn parse_perspective_scores(output: &str) -> Option<Vec<f64>> {
    let line = output.lines().find_map(|l| l.trim().strip_prefix("PERSPECTIVE_SCORES:"))?;
    let scores: Vec<f64> = line
        .split([',', ' '])
        .filter(|t| !t.trim().is_empty())
        .filter_map(|t| t.trim().trim_end_matches('%').parse::<f64>().ok())
        .map(normalize_score)
        .collect();
    if scores.is_empty() { None } else { Some(scores) }
}

/// `LOOP_STATUS: continue|done`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDirective {
    Continue,
    Done,
}

pub fn parse_loop_status(output: &str) -> Option<LoopDirective> {
    let line = output.lines().find_map(|l| l.trim().strip_prefix("LOOP_STATUS:"))?;
    match line.trim().to_lowercase().as_str() {
        "continue" => Some(LoopDirective::Continue),
        "done" => Some(LoopDirective::Done),
        _ => None,
    }
}

static PHASE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[UL_PHASE:([^:\]]+):(research|plan|implement):CYCLE:(\d+)\]\]").expect("phase marker regex")
});

/// Build the opaque in-prompt phase marker
pub fn phase_marker(run_id: &str, phase: Phase, cycle: u32) -> String {
    format!("[[UL_PHASE:{}:{}:CYCLE:{}]]", run_id, phase, cycle)
}

/// Find a phase marker anywhere in an output
pub fn find_phase_marker(output: &str) -> Option<(String, Phase, u32)> {
    let captures = PHASE_MARKER.captures(output)?;
    let run_id = captures[1].to_string();
    let phase = captures[2].parse::<Phase>().ok()?;
    let cycle = captures[3].parse::<u32>().ok()?;
    Some((run_id, phase, cycle))
}
