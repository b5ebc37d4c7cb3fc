//! Cycle commit flow
//!
//! Commits only the changes a cycle actually produced: the changed set is
//! diffed against the snapshot taken at cycle start, filtered through an
//! exclusion policy, and staged file by file. The commit message comes from
//! the model, validated against a conventional-commit allow-list with a
//! deterministic fallback. Excluded paths accrue `.gitignore` patterns which
//! are flushed at most once per cycle as a separate chore commit.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use eyre::Result;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{ModelClient, ModelRequest};

use super::git::{DiffStats, Vcs};

/// Conventional-commit types accepted from the model
pub const COMMIT_TYPES: &[&str] = &[
    "feat", "fix", "refactor", "perf", "docs", "test", "chore", "style", "build", "ci",
];

static COMMIT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(feat|fix|refactor|perf|docs|test|chore|style|build|ci)(\([a-z0-9_./-]+\))?!?: \S.*")
        .expect("commit line regex")
});

/// Filename globs excluded from commits, paired with the `.gitignore`
/// pattern each one contributes
static EXCLUDED_NAME_GLOBS: LazyLock<Vec<(glob::Pattern, &'static str)>> = LazyLock::new(|| {
    [
        (".env*", ".env*"),
        ("*.env", "*.env"),
        ("*.pem", "*.pem"),
        ("*.key", "*.key"),
        ("*.log", "*.log"),
    ]
    .into_iter()
    .map(|(pattern, ignore)| (glob::Pattern::new(pattern).expect("static glob"), ignore))
    .collect()
});

/// Directory components excluded as caches or build outputs
const EXCLUDED_DIRS: &[&str] = &["node_modules", "target", "dist", "build", "__pycache__", ".cache", ".venv", "logs"];

/// Lockfiles churn on their own; the loop never commits them
const EXCLUDED_LOCKFILES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "uv.lock",
];

/// Map a path to the `.gitignore` pattern that excludes it, if the exclusion
/// policy applies
pub fn exclusion_pattern_for(path: &str) -> Option<String> {
    let file_name = Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or(path);
    let components: Vec<&str> = path.split('/').collect();

    for (pattern, ignore) in EXCLUDED_NAME_GLOBS.iter() {
        if pattern.matches(file_name) {
            return Some((*ignore).to_string());
        }
    }

    // Credentials by name
    let lower = file_name.to_lowercase();
    if lower.contains("credential") || lower.contains("secret") || lower == "id_rsa" {
        return Some(file_name.to_string());
    }

    for dir in EXCLUDED_DIRS {
        if components.iter().any(|c| c == dir) {
            return Some(format!("{}/", dir));
        }
    }

    if EXCLUDED_LOCKFILES.contains(&file_name) {
        return Some(file_name.to_string());
    }

    None
}

/// Strip any thinking-style preamble and validate the conventional-commit
/// first line; `None` when no valid line exists
pub fn sanitize_commit_message(raw: &str) -> Option<String> {
    let mut lines = raw.lines().skip_while(|line| !COMMIT_LINE.is_match(line.trim()));
    let first = lines.next()?.trim().to_string();

    let mut message = first;
    let rest: Vec<&str> = lines.collect();
    let body = rest.join("\n");
    let body = body.trim();
    if !body.is_empty() {
        message.push_str("\n\n");
        message.push_str(body);
    }
    Some(message)
}

/// Deterministic message used when the model's output fails validation
pub fn fallback_commit_message(cycle: u32, stats: &DiffStats, mean_score: f64) -> String {
    format!(
        "chore(loop): cycle {} improvements ({} files, +{}/-{}, score {:.0}%)",
        cycle,
        stats.files_changed,
        stats.insertions,
        stats.deletions,
        mean_score * 100.0
    )
}

/// Commit-style prompt carrying diff statistics, scores and a rubric
pub fn build_commit_prompt(task: &str, cycle: u32, stats: &DiffStats, scores: &[f64]) -> String {
    let score_line = scores
        .iter()
        .map(|s| format!("{:.0}%", s * 100.0))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Write a git commit message for the changes below.\n\
         \n\
         Task: {task}\n\
         Cycle: {cycle}\n\
         Diff: {files} files changed, {ins} insertions, {del} deletions\n\
         Perspective scores: {score_line}\n\
         \n\
         Rules:\n\
         - First line: `type(scope): summary` where type is one of {types}\n\
         - Summary under 72 characters, imperative mood\n\
         - Optional body: what changed and the observable effect, wrapped at 72\n\
         - No attribution lines, no markdown fences\n\
         \n\
         Output only the commit message.",
        task = task,
        cycle = cycle,
        files = stats.files_changed,
        ins = stats.insertions,
        del = stats.deletions,
        score_line = score_line,
        types = COMMIT_TYPES.join("|"),
    )
}

/// Inputs for one cycle's commit attempt
pub struct CommitContext<'a> {
    pub task: &'a str,
    pub cycle: u32,
    pub files_changed_before_cycle: &'a HashSet<String>,
    pub mean_score: f64,
    pub scores: &'a [f64],
    pub provider: &'a str,
    pub model_id: &'a str,
    pub cancel: CancellationToken,
}

/// What the commit flow did for a cycle
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    pub committed: bool,
    pub commit_hash: Option<String>,
    pub message: Option<String>,
    pub staged: Vec<String>,
    pub excluded: Vec<String>,
    pub gitignore_patterns: BTreeSet<String>,
}

/// Stage and commit the changes a cycle produced
pub async fn commit_cycle_changes(
    vcs: &dyn Vcs,
    model: &dyn ModelClient,
    ctx: CommitContext<'_>,
) -> Result<CommitOutcome> {
    let mut outcome = CommitOutcome::default();

    // Only changes that appeared during this cycle
    let changed = vcs.changed_files().await?;
    let new_changes: Vec<String> = changed
        .into_iter()
        .map(|c| c.path)
        .filter(|p| !ctx.files_changed_before_cycle.contains(p))
        .collect();

    if new_changes.is_empty() {
        debug!(cycle = ctx.cycle, "no new changes to commit");
        return Ok(outcome);
    }

    for path in new_changes {
        match exclusion_pattern_for(&path) {
            Some(pattern) => {
                outcome.gitignore_patterns.insert(pattern);
                outcome.excluded.push(path);
            }
            None => {
                vcs.stage_file(&path).await?;
                outcome.staged.push(path);
            }
        }
    }

    let staged = vcs.staged_files().await?;
    if staged.is_empty() {
        debug!(cycle = ctx.cycle, excluded = outcome.excluded.len(), "nothing staged, skipping commit");
        return Ok(outcome);
    }

    let stats = vcs.staged_stats().await?;
    let prompt = build_commit_prompt(ctx.task, ctx.cycle, &stats, ctx.scores);
    let request = ModelRequest::new(ctx.provider, ctx.model_id, prompt)
        .with_cancel(ctx.cancel.clone())
        .with_label(format!("commit-message cycle {}", ctx.cycle));

    let message = match model.call_model(request).await {
        Ok(raw) => sanitize_commit_message(&raw).unwrap_or_else(|| {
            warn!(cycle = ctx.cycle, "model commit message failed validation, using fallback");
            fallback_commit_message(ctx.cycle, &stats, ctx.mean_score)
        }),
        Err(e) => {
            warn!(cycle = ctx.cycle, error = %e, "commit message generation failed, using fallback");
            fallback_commit_message(ctx.cycle, &stats, ctx.mean_score)
        }
    };

    vcs.commit(&message).await?;
    let hash = vcs.head_short_hash().await?;
    info!(cycle = ctx.cycle, %hash, files = stats.files_changed, "cycle changes committed");

    outcome.committed = true;
    outcome.commit_hash = Some(hash);
    outcome.message = Some(message);
    Ok(outcome)
}

/// Append only novel patterns to `.gitignore` and make a small chore commit;
/// returns the chore commit hash when one was made
pub async fn append_gitignore_patterns(
    repo_root: &Path,
    patterns: &BTreeSet<String>,
    vcs: &dyn Vcs,
) -> Result<Option<String>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let gitignore = repo_root.join(".gitignore");
    let existing = tokio::fs::read_to_string(&gitignore).await.unwrap_or_default();
    let known: HashSet<&str> = existing.lines().map(|l| l.trim()).collect();

    let novel: Vec<&String> = patterns.iter().filter(|p| !known.contains(p.as_str())).collect();
    if novel.is_empty() {
        return Ok(None);
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for pattern in &novel {
        content.push_str(pattern);
        content.push('\n');
    }
    tokio::fs::write(&gitignore, content).await?;

    vcs.stage_file(".gitignore").await?;
    vcs.commit("chore(gitignore): ignore loop artifacts").await?;
    let hash = vcs.head_short_hash().await?;
    info!(%hash, added = novel.len(), "gitignore patterns committed");
    Ok(Some(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockModelClient, ModelError};
    use crate::vcs::git::mock::MockVcs;

    #[test]
    fn test_exclusion_policy() {
        assert_eq!(exclusion_pattern_for(".env"), Some(".env*".to_string()));
        assert_eq!(exclusion_pattern_for("config/.env.production"), Some(".env*".to_string()));
        assert_eq!(exclusion_pattern_for("certs/server.pem"), Some("*.pem".to_string()));
        assert_eq!(exclusion_pattern_for("aws_credentials.json"), Some("aws_credentials.json".to_string()));
        assert_eq!(exclusion_pattern_for("target/debug/foo"), Some("target/".to_string()));
        assert_eq!(exclusion_pattern_for("app/logs/today.txt"), Some("logs/".to_string()));
        assert_eq!(exclusion_pattern_for("debug.log"), Some("*.log".to_string()));
        assert_eq!(exclusion_pattern_for("Cargo.lock"), Some("Cargo.lock".to_string()));
        assert_eq!(exclusion_pattern_for("src/lib.rs"), None);
    }

    #[test]
    fn test_sanitize_strips_preamble() {
        let raw = "Okay, looking at the diff, here is a message:\n\nfix(pool): claim items under the cursor lock\n\nPrevents double execution.";
        let message = sanitize_commit_message(raw).unwrap();
        assert!(message.starts_with("fix(pool): claim items"));
        assert!(message.contains("Prevents double execution."));
    }

    #[test]
    fn test_sanitize_rejects_nonconforming() {
        assert!(sanitize_commit_message("Updated some files").is_none());
        assert!(sanitize_commit_message("wip: things").is_none());
        assert!(sanitize_commit_message("feat improve stuff").is_none());
    }

    #[test]
    fn test_fallback_message_conforms() {
        let message = fallback_commit_message(
            3,
            &DiffStats {
                files_changed: 2,
                insertions: 40,
                deletions: 7,
            },
            0.8,
        );
        assert!(COMMIT_LINE.is_match(&message));
        assert!(message.contains("cycle 3"));
    }

    fn ctx<'a>(before: &'a HashSet<String>, cancel: &CancellationToken) -> CommitContext<'a> {
        CommitContext {
            task: "improve the scheduler",
            cycle: 2,
            files_changed_before_cycle: before,
            mean_score: 0.8,
            scores: &[0.8, 0.8],
            provider: "anthropic",
            model_id: "claude-sonnet-4",
            cancel: cancel.clone(),
        }
    }

    #[tokio::test]
    async fn test_commit_flow_stages_only_new_included_files() {
        let vcs = MockVcs::with_changes(&["src/lib.rs", "old.rs", ".env", "notes.md"]);
        let model = MockModelClient::always("feat(scheduler): tighten slot accounting");

        let before: HashSet<String> = [String::from("old.rs")].into();
        let cancel = CancellationToken::new();
        let outcome = commit_cycle_changes(&vcs, &model, ctx(&before, &cancel)).await.unwrap();

        assert!(outcome.committed);
        assert_eq!(outcome.staged, vec!["src/lib.rs", "notes.md"]);
        assert_eq!(outcome.excluded, vec![".env"]);
        assert!(outcome.gitignore_patterns.contains(".env*"));
        assert_eq!(vcs.commit_messages(), vec!["feat(scheduler): tighten slot accounting"]);
        assert!(outcome.commit_hash.is_some());
    }

    #[tokio::test]
    async fn test_commit_flow_skips_when_nothing_new() {
        let vcs = MockVcs::with_changes(&["old.rs"]);
        let model = MockModelClient::always("feat(x): y");

        let before: HashSet<String> = [String::from("old.rs")].into();
        let cancel = CancellationToken::new();
        let outcome = commit_cycle_changes(&vcs, &model, ctx(&before, &cancel)).await.unwrap();

        assert!(!outcome.committed);
        assert!(vcs.commit_messages().is_empty());
    }

    #[tokio::test]
    async fn test_commit_flow_falls_back_on_model_failure() {
        let vcs = MockVcs::with_changes(&["src/lib.rs"]);
        let model = MockModelClient::new(vec![Err(ModelError::Api {
            status: 500,
            message: "down".into(),
        })]);

        let before = HashSet::new();
        let cancel = CancellationToken::new();
        let outcome = commit_cycle_changes(&vcs, &model, ctx(&before, &cancel)).await.unwrap();

        assert!(outcome.committed);
        let messages = vcs.commit_messages();
        assert!(messages[0].starts_with("chore(loop): cycle 2"));
    }

    #[tokio::test]
    async fn test_gitignore_appends_only_novel_lines() {
        let temp = tempfile::tempdir().unwrap();
        tokio::fs::write(temp.path().join(".gitignore"), "target/\n").await.unwrap();
        let vcs = MockVcs::default();

        let patterns: BTreeSet<String> = ["target/".to_string(), "*.log".to_string()].into();
        let hash = append_gitignore_patterns(temp.path(), &patterns, &vcs).await.unwrap();
        assert!(hash.is_some());

        let content = tokio::fs::read_to_string(temp.path().join(".gitignore")).await.unwrap();
        assert_eq!(content, "target/\n*.log\n");
        assert_eq!(vcs.commit_messages(), vec!["chore(gitignore): ignore loop artifacts"]);

        // Second flush with no novel patterns is a no-op
        let again = append_gitignore_patterns(temp.path(), &patterns, &vcs).await.unwrap();
        assert!(again.is_none());
        assert_eq!(vcs.commit_messages().len(), 1);
    }
}
