//! Stop-signal file
//!
//! Any actor may create the file; the loop polls it at every cycle and
//! perspective boundary. The file wins over the in-memory stop flag: a
//! well-formed file means stop even if the flag was never set, since the
//! file is the only channel external actors have.

use std::path::{Path, PathBuf};

use eyre::Result;
use tracing::debug;

/// Handle to a project's stop-signal file
#[derive(Debug, Clone)]
pub struct StopSignal {
    path: PathBuf,
}

impl StopSignal {
    /// Conventional location under the project directory
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            path: project_dir.join(".pi").join("self-improvement-loop").join("stop-signal"),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the signal ("STOP")
    pub async fn request_stop(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, "STOP").await?;
        debug!(path = %self.path.display(), "stop signal written");
        Ok(())
    }

    /// True iff the file exists with content "STOP" or "stop"
    pub async fn is_requested(&self) -> bool {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let trimmed = content.trim();
                trimmed == "STOP" || trimmed == "stop"
            }
            Err(_) => false,
        }
    }

    /// Remove the file (idempotent)
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_request_check_clear() {
        let temp = tempdir().unwrap();
        let signal = StopSignal::for_project(temp.path());

        assert!(!signal.is_requested().await);
        signal.request_stop().await.unwrap();
        assert!(signal.is_requested().await);

        signal.clear().await.unwrap();
        assert!(!signal.is_requested().await);
        // Clearing twice is fine
        signal.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_stop_content_counts() {
        let temp = tempdir().unwrap();
        let signal = StopSignal::at(temp.path().join("stop-signal"));

        tokio::fs::write(signal.path(), "stop\n").await.unwrap();
        assert!(signal.is_requested().await);

        tokio::fs::write(signal.path(), "halt please").await.unwrap();
        assert!(!signal.is_requested().await);
    }
}
