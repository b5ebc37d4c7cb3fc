//! Tolerant shared-file I/O for the runtime directory
//!
//! Every file under the runtime root is shared mutable state between
//! processes. Writes go through a temp file in the same directory followed by
//! a rename, so readers never observe partial records. Readers treat missing
//! and corrupt files as absent.

use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Atomically replace `path` with the JSON serialization of `value`
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("path has no parent: {}", path.display()))?
        .to_path_buf();
    tokio::fs::create_dir_all(&parent)
        .await
        .wrap_err_with(|| format!("creating {}", parent.display()))?;

    let json = serde_json::to_vec_pretty(value)?;
    let target = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&json)?;
        tmp.persist(&target)
            .wrap_err_with(|| format!("renaming into {}", target.display()))?;
        Ok(())
    })
    .await??;

    Ok(())
}

/// Read and parse a JSON file, returning `None` when it is missing, partial
/// or corrupt
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "ignoring unparseable file");
            None
        }
    }
}

/// Remove a file, tolerating its absence
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).wrap_err_with(|| format!("removing {}", path.display())),
    }
}

/// List regular files directly under `dir` (empty when the dir is missing)
pub async fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    out.sort();
    out
}
