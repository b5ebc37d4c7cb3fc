//! Prompt construction for perspectives and UL phases

use std::collections::HashMap;

use crate::detect::MetacognitiveCheck;

use super::parser::phase_marker;
use super::perspectives::PerspectiveSpec;
use super::run_state::{CycleSummary, Phase, SuccessfulPattern};
use super::trajectory::RecommendedAction;

/// Everything a perspective prompt is built from
pub struct PerspectivePromptInputs<'a> {
    pub task: &'a str,
    pub perspective: &'a PerspectiveSpec,
    pub cycle: u32,
    pub recent_summaries: &'a [CycleSummary],
    pub strategy_hint: &'a str,
    pub recommended_action: RecommendedAction,
    pub quality_guidance: Option<&'a str>,
    pub improvements: &'a [String],
    pub patterns: &'a [SuccessfulPattern],
}

/// Trend-derived strategy hint for the prompt
pub fn strategy_hint(recent_means: &[f64]) -> String {
    if recent_means.len() < 2 {
        return "First cycles: explore broadly before narrowing.".to_string();
    }
    let last = recent_means[recent_means.len() - 1];
    let prev = recent_means[recent_means.len() - 2];
    if last >= 0.9 {
        "Scores are high: focus on remaining sharp edges only.".to_string()
    } else if last > prev + 0.05 {
        "Scores are improving: keep pushing the current direction.".to_string()
    } else if last + 0.05 < prev {
        "Scores are dropping: question the current direction before continuing.".to_string()
    } else {
        "Scores are flat: look for a fundamentally different angle.".to_string()
    }
}

/// Guidance derived from the previous cycle's metacognitive check
pub fn quality_guidance(check: &MetacognitiveCheck) -> Option<String> {
    let mut notes = Vec::new();
    if !check.fallacies.is_empty() {
        let kinds: Vec<&str> = check.fallacies.iter().map(|f| f.kind.as_str()).collect();
        notes.push(format!("avoid the reasoning patterns seen last cycle ({})", kinds.join(", ")));
    }
    if check.pleasure_trap {
        notes.push("back aesthetic judgments with verification".to_string());
    }
    if check.metacognition_level < 0.2 {
        notes.push("state assumptions explicitly and note what could prove you wrong".to_string());
    }
    if !check.invalid_patterns.is_empty() {
        notes.push("support every conclusion with explicit premises".to_string());
    }
    if notes.is_empty() {
        None
    } else {
        Some(format!("Quality guidance: {}.", notes.join("; ")))
    }
}

pub fn build_perspective_prompt(inputs: &PerspectivePromptInputs<'_>) -> String {
    let mut prompt = format!(
        "You are analyzing ongoing work through the **{name}** perspective.\n\
         {description}\n\
         \n\
         Task: {task}\n\
         Cycle: {cycle}\n",
        name = inputs.perspective.name,
        description = inputs.perspective.description,
        task = inputs.task,
        cycle = inputs.cycle,
    );

    if !inputs.recent_summaries.is_empty() {
        prompt.push_str("\nRecent cycles:\n");
        for summary in inputs.recent_summaries {
            prompt.push_str(&format!(
                "- cycle {} ({:.0}%): {}\n",
                summary.cycle,
                summary.mean_score * 100.0,
                summary.summary
            ));
        }
    }

    prompt.push_str(&format!(
        "\nStrategy: {} Recommended action: {}.\n",
        inputs.strategy_hint, inputs.recommended_action
    ));

    if let Some(guidance) = inputs.quality_guidance {
        prompt.push('\n');
        prompt.push_str(guidance);
        prompt.push('\n');
    }

    if !inputs.improvements.is_empty() {
        prompt.push_str("\nOutstanding improvement actions:\n");
        for action in inputs.improvements {
            prompt.push_str(&format!("- {}\n", action));
        }
    }

    if !inputs.patterns.is_empty() {
        prompt.push_str("\nApproaches that worked before:\n");
        for pattern in inputs.patterns {
            prompt.push_str(&format!(
                "- cycle {} ({:.0}%): {}\n",
                pattern.cycle,
                pattern.avg_score * 100.0,
                pattern.action_summary
            ));
        }
    }

    prompt.push_str(
        "\nRespond in exactly this format:\n\
         FINDINGS:\n- <finding>\n\
         QUESTIONS:\n- <open question>\n\
         IMPROVEMENTS:\n- <concrete action>\n\
         SCORE: <0-100>\n\
         SUMMARY: <one line>\n\
         NEXT_FOCUS: <what the next cycle should do>\n",
    );

    prompt
}

/// Prompt for one UL phase, carrying the opaque phase marker
pub fn build_phase_prompt(
    run_id: &str,
    phase: Phase,
    cycle: u32,
    task: &str,
    phase_context: &HashMap<String, String>,
) -> String {
    let marker = phase_marker(run_id, phase, cycle);
    let mut prompt = match phase {
        Phase::Research => format!(
            "Cycle {cycle} research phase.\n\
             Task: {task}\n\
             \n\
             Investigate the current state of the work: read the relevant code, \
             list what is done, what is missing and what is risky. Do not change anything yet.\n"
        ),
        Phase::Plan => format!(
            "Cycle {cycle} planning phase.\n\
             Task: {task}\n\
             \n\
             Using the research below, produce a concrete, ordered plan for this cycle. \
             Each step names files and the change to make.\n"
        ),
        Phase::Implement => format!(
            "Cycle {cycle} implementation phase.\n\
             Task: {task}\n\
             \n\
             Execute the plan below. After implementing, self-assess through the seven \
             perspectives and finish your response with:\n\
             PERSPECTIVE_SCORES: <seven 0-100 values, comma separated>\n\
             LOOP_STATUS: continue|done\n"
        ),
        Phase::Completed => String::new(),
    };

    let carry_from = match phase {
        Phase::Plan => Some("research"),
        Phase::Implement => Some("plan"),
        _ => None,
    };
    if let Some(key) = carry_from
        && let Some(previous) = phase_context.get(key)
    {
        prompt.push_str(&format!("\nPrevious phase output:\n{}\n", previous));
    }

    prompt.push_str(&format!("\nInclude this marker verbatim in your response: {}\n", marker));
    prompt
}
