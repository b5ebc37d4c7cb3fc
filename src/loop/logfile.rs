//! Markdown run log
//!
//! One file per run under `<project>/.pi/self-improvement-loop/`: a header,
//! one entry per cycle, and a footer that is written no matter how the run
//! ends.

use std::path::{Path, PathBuf};

use chrono::Utc;
use eyre::Result;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::run_state::LoopRunState;

/// Data for one cycle's log entry
#[derive(Debug, Clone, Default)]
pub struct CycleLogEntry {
    pub cycle: u32,
    pub mean_score: f64,
    pub scores: Vec<f64>,
    pub summary: String,
    pub commit_hash: Option<String>,
    pub detections: Vec<String>,
    pub is_stuck: bool,
}

/// Append-only writer for a run's Markdown timeline
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn for_project(project_dir: &Path, run_id: &str) -> Self {
        Self {
            path: project_dir
                .join(".pi")
                .join("self-improvement-loop")
                .join(format!("run-{}.md", run_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn write_header(&self, state: &LoopRunState) -> Result<()> {
        debug!(path = %self.path.display(), "writing run log header");
        self.append(&format!(
            "# Self-improvement run {run_id}\n\n\
             - Task: {task}\n\
             - Started: {started}\n\
             - Mode: {mode}\n\
             - Max cycles: {max_cycles}\n\
             - Auto-commit: {auto_commit}\n\n",
            run_id = state.run_id,
            task = state.task,
            started = state.started_at.to_rfc3339(),
            mode = if state.ul_mode { "research/plan/implement" } else { "perspective cycles" },
            max_cycles = state.max_cycles,
            auto_commit = state.auto_commit,
        ))
        .await
    }

    pub async fn append_cycle(&self, entry: &CycleLogEntry) -> Result<()> {
        let scores = entry
            .scores
            .iter()
            .map(|s| format!("{:.0}", s * 100.0))
            .collect::<Vec<_>>()
            .join(" / ");

        let mut text = format!(
            "## Cycle {cycle} — {mean:.0}%\n\n- Scores: {scores}\n",
            cycle = entry.cycle,
            mean = entry.mean_score * 100.0,
            scores = if scores.is_empty() { "n/a".to_string() } else { scores },
        );
        if !entry.summary.is_empty() {
            text.push_str(&format!("- Summary: {}\n", entry.summary));
        }
        if let Some(hash) = &entry.commit_hash {
            text.push_str(&format!("- Commit: `{}`\n", hash));
        }
        for detection in &entry.detections {
            text.push_str(&format!("- Detected: {}\n", detection));
        }
        if entry.is_stuck {
            text.push_str("- Trajectory: repeating itself\n");
        }
        text.push('\n');

        self.append(&text).await
    }

    pub async fn write_footer(&self, state: &LoopRunState) -> Result<()> {
        let reason = state
            .stop_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.append(&format!(
            "---\n\nRun ended at {ended} after {cycles} cycle(s): {reason}\n",
            ended = Utc::now().to_rfc3339(),
            cycles = state.cycle,
            reason = reason,
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r#loop::run_state::{RunOptions, StopReason};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_header_cycles_footer() {
        let temp = tempdir().unwrap();
        let mut state = LoopRunState::new(RunOptions {
            task: "tighten the pool".to_string(),
            ..Default::default()
        });
        let log = RunLog::for_project(temp.path(), state.run_id.as_str());

        log.write_header(&state).await.unwrap();
        log.append_cycle(&CycleLogEntry {
            cycle: 1,
            mean_score: 0.72,
            scores: vec![0.7, 0.74],
            summary: "lock handling improved".to_string(),
            commit_hash: Some("abc1234".to_string()),
            detections: vec!["overconfidence".to_string()],
            is_stuck: false,
        })
        .await
        .unwrap();

        state.cycle = 1;
        state.stop_reason = Some(StopReason::Completed);
        log.write_footer(&state).await.unwrap();

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert!(content.contains("# Self-improvement run"));
        assert!(content.contains("tighten the pool"));
        assert!(content.contains("## Cycle 1 — 72%"));
        assert!(content.contains("`abc1234`"));
        assert!(content.contains("Detected: overconfidence"));
        assert!(content.contains("completed"));
    }
}
