//! Git capability over subprocesses
//!
//! Thin wrapper around the `git` binary. Exit codes are surfaced faithfully:
//! any non-zero status becomes a `VcsError::CommandFailed` carrying the code
//! and stderr.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git {command} failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("io error running git: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry of `git status --porcelain`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    /// Two-character porcelain status (e.g. ` M`, `??`, `A `)
    pub status: String,
    pub path: String,
}

/// Aggregated staged diff statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

/// The minimal VCS surface the commit flow needs
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn changed_files(&self) -> Result<Vec<ChangedFile>, VcsError>;

    /// Stage exactly one path (the flow never stages wholesale)
    async fn stage_file(&self, path: &str) -> Result<(), VcsError>;

    async fn staged_files(&self) -> Result<Vec<String>, VcsError>;

    async fn staged_stats(&self) -> Result<DiffStats, VcsError>;

    async fn commit(&self, message: &str) -> Result<(), VcsError>;

    async fn head_short_hash(&self) -> Result<String, VcsError>;
}

/// Real implementation over the `git` binary
pub struct GitVcs {
    repo_root: PathBuf,
}

impl GitVcs {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn run(&self, args: &[&str]) -> Result<String, VcsError> {
        debug!(?args, root = %self.repo_root.display(), "running git");
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await?;

        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn changed_files(&self) -> Result<Vec<ChangedFile>, VcsError> {
        let stdout = self.run(&["status", "--porcelain"]).await?;
        Ok(stdout
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| ChangedFile {
                status: line[..2].to_string(),
                path: line[3..].trim().to_string(),
            })
            .collect())
    }

    async fn stage_file(&self, path: &str) -> Result<(), VcsError> {
        self.run(&["add", "--", path]).await?;
        Ok(())
    }

    async fn staged_files(&self) -> Result<Vec<String>, VcsError> {
        let stdout = self.run(&["diff", "--cached", "--name-only"]).await?;
        Ok(stdout.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn staged_stats(&self) -> Result<DiffStats, VcsError> {
        let stdout = self.run(&["diff", "--cached", "--numstat"]).await?;
        let mut stats = DiffStats::default();
        for line in stdout.lines() {
            let mut parts = line.split_whitespace();
            let insertions = parts.next().and_then(|p| p.parse::<usize>().ok()).unwrap_or(0);
            let deletions = parts.next().and_then(|p| p.parse::<usize>().ok()).unwrap_or(0);
            stats.files_changed += 1;
            stats.insertions += insertions;
            stats.deletions += deletions;
        }
        Ok(stats)
    }

    async fn commit(&self, message: &str) -> Result<(), VcsError> {
        self.run(&["commit", "-m", message]).await?;
        Ok(())
    }

    async fn head_short_hash(&self) -> Result<String, VcsError> {
        let stdout = self.run(&["rev-parse", "--short", "HEAD"]).await?;
        Ok(stdout.trim().to_string())
    }
}

/// In-memory implementation for tests
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockVcs {
        pub changed: Mutex<Vec<ChangedFile>>,
        pub staged: Mutex<Vec<String>>,
        pub commits: Mutex<Vec<String>>,
        pub fail_commits: Mutex<bool>,
        /// `changed_files` reports empty for this many leading calls,
        /// modelling changes that appear mid-cycle
        reveal_after_polls: usize,
        polls: AtomicUsize,
    }

    impl MockVcs {
        pub fn with_changes(paths: &[&str]) -> Self {
            let vcs = Self::default();
            *vcs.changed.lock().expect("mock changed lock") = paths
                .iter()
                .map(|p| ChangedFile {
                    status: " M".to_string(),
                    path: p.to_string(),
                })
                .collect();
            vcs
        }

        /// Changes become visible only after the first status poll
        pub fn appearing(paths: &[&str]) -> Self {
            let mut vcs = Self::with_changes(paths);
            vcs.reveal_after_polls = 1;
            vcs
        }

        pub fn commit_messages(&self) -> Vec<String> {
            self.commits.lock().expect("mock commits lock").clone()
        }
    }

    #[async_trait]
    impl Vcs for MockVcs {
        async fn changed_files(&self) -> Result<Vec<ChangedFile>, VcsError> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst);
            if poll < self.reveal_after_polls {
                return Ok(Vec::new());
            }
            Ok(self.changed.lock().expect("mock changed lock").clone())
        }

        async fn stage_file(&self, path: &str) -> Result<(), VcsError> {
            self.staged.lock().expect("mock staged lock").push(path.to_string());
            Ok(())
        }

        async fn staged_files(&self) -> Result<Vec<String>, VcsError> {
            Ok(self.staged.lock().expect("mock staged lock").clone())
        }

        async fn staged_stats(&self) -> Result<DiffStats, VcsError> {
            let staged = self.staged.lock().expect("mock staged lock");
            Ok(DiffStats {
                files_changed: staged.len(),
                insertions: staged.len() * 10,
                deletions: staged.len() * 2,
            })
        }

        async fn commit(&self, message: &str) -> Result<(), VcsError> {
            if *self.fail_commits.lock().expect("mock fail lock") {
                return Err(VcsError::CommandFailed {
                    command: "commit".to_string(),
                    code: 1,
                    stderr: "simulated failure".to_string(),
                });
            }
            self.commits.lock().expect("mock commits lock").push(message.to_string());
            self.staged.lock().expect("mock staged lock").clear();
            Ok(())
        }

        async fn head_short_hash(&self) -> Result<String, VcsError> {
            let n = self.commits.lock().expect("mock commits lock").len();
            Ok(format!("abc{:04}", n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            tokio::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_status_stage_commit_hash() {
        let temp = tempfile::tempdir().unwrap();
        init_repo(temp.path()).await;
        let vcs = GitVcs::new(temp.path());

        tokio::fs::write(temp.path().join("a.txt"), "hello\n").await.unwrap();

        let changed = vcs.changed_files().await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].path, "a.txt");
        assert_eq!(changed[0].status, "??");

        vcs.stage_file("a.txt").await.unwrap();
        assert_eq!(vcs.staged_files().await.unwrap(), vec!["a.txt".to_string()]);

        let stats = vcs.staged_stats().await.unwrap();
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.insertions, 1);

        vcs.commit("test(repo): initial file").await.unwrap();
        let hash = vcs.head_short_hash().await.unwrap();
        assert!(!hash.is_empty());

        assert!(vcs.changed_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_code_surfaced() {
        let temp = tempfile::tempdir().unwrap();
        // Not a git repo: rev-parse fails with a non-zero code
        let vcs = GitVcs::new(temp.path());
        let err = vcs.head_short_hash().await.unwrap_err();
        match err {
            VcsError::CommandFailed { code, .. } => assert_ne!(code, 0),
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }
}
