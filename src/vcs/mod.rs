//! Version-control capability and the cycle commit flow

pub mod commit;
pub mod git;

pub use commit::{
    COMMIT_TYPES, CommitContext, CommitOutcome, append_gitignore_patterns, build_commit_prompt, commit_cycle_changes,
    exclusion_pattern_for, fallback_commit_message, sanitize_commit_message,
};
pub use git::{ChangedFile, DiffStats, GitVcs, Vcs, VcsError};
