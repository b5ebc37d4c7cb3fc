//! Filesystem-backed distributed locks
//!
//! One file per resource under the locks directory. Expiry is absolute wall
//! time so it is meaningful across processes. Only the holder (matching
//! `lock_id`) may remove the file; anyone may clean up expired or corrupt
//! lock files.

use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::LockId;

use super::fsio;
use super::paths::RuntimePaths;

/// On-disk lock record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedLock {
    pub lock_id: LockId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resource: String,
}

impl DistributedLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Manages lock files under the runtime root
#[derive(Debug, Clone)]
pub struct LockManager {
    paths: RuntimePaths,
}

impl LockManager {
    pub fn new(paths: RuntimePaths) -> Self {
        Self { paths }
    }

    /// Try to acquire `resource` for `ttl`
    ///
    /// Returns `None` when another holder's unexpired lock exists, or when a
    /// concurrent acquirer won the write race.
    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<DistributedLock>> {
        let path = self.paths.lock_file(resource);
        let now = Utc::now();

        if let Some(existing) = fsio::read_json::<DistributedLock>(&path).await
            && !existing.is_expired(now)
        {
            debug!(resource, holder = %existing.lock_id, "lock held");
            return Ok(None);
        }

        let lock = DistributedLock {
            lock_id: LockId::new(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl)?,
            resource: resource.to_string(),
        };
        fsio::write_json_atomic(&path, &lock).await?;

        // Read back to detect a lost race with a concurrent acquirer: the
        // rename that landed last owns the file.
        match fsio::read_json::<DistributedLock>(&path).await {
            Some(on_disk) if on_disk.lock_id == lock.lock_id => {
                debug!(resource, lock_id = %lock.lock_id, "lock acquired");
                Ok(Some(lock))
            }
            _ => {
                debug!(resource, "lost acquisition race");
                Ok(None)
            }
        }
    }

    /// Release a held lock; a no-op unless the on-disk `lock_id` matches
    pub async fn release(&self, lock: &DistributedLock) -> Result<bool> {
        let path = self.paths.lock_file(&lock.resource);

        match fsio::read_json::<DistributedLock>(&path).await {
            Some(on_disk) if on_disk.lock_id == lock.lock_id => {
                fsio::remove_if_exists(&path).await?;
                debug!(resource = %lock.resource, "lock released");
                Ok(true)
            }
            Some(_) => {
                warn!(resource = %lock.resource, "release skipped: not the holder");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Remove expired and corrupt lock files; returns the number removed
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for path in fsio::list_files(&self.paths.locks_dir()).await {
            match fsio::read_json::<DistributedLock>(&path).await {
                Some(lock) if lock.is_expired(now) => {
                    if fsio::remove_if_exists(&path).await? {
                        debug!(resource = %lock.resource, "removed expired lock");
                        removed += 1;
                    }
                }
                Some(_) => {}
                None => {
                    if fsio::remove_if_exists(&path).await? {
                        warn!(path = %path.display(), "removed corrupt lock file");
                        removed += 1;
                    }
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(temp: &tempfile::TempDir) -> LockManager {
        LockManager::new(RuntimePaths::new(temp.path()))
    }

    #[tokio::test]
    async fn test_acquire_then_conflict() {
        let temp = tempdir().unwrap();
        let locks = manager(&temp);

        let held = locks
            .try_acquire("steal:inst-x", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("first acquire succeeds");

        // Second caller sees the unexpired lock
        let second = locks.try_acquire("steal:inst-x", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_none());

        assert!(locks.release(&held).await.unwrap());

        // Released: acquirable again
        let third = locks.try_acquire("steal:inst-x", Duration::from_secs(30)).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reacquirable() {
        let temp = tempdir().unwrap();
        let locks = manager(&temp);

        let held = locks
            .try_acquire("steal:inst-x", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let retaken = locks
            .try_acquire("steal:inst-x", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(retaken.is_some());
        assert_ne!(retaken.unwrap().lock_id, held.lock_id);
    }

    #[tokio::test]
    async fn test_release_from_non_owner_is_noop() {
        let temp = tempdir().unwrap();
        let locks = manager(&temp);

        let held = locks
            .try_acquire("res", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let imposter = DistributedLock {
            lock_id: LockId::new(),
            ..held.clone()
        };
        assert!(!locks.release(&imposter).await.unwrap());

        // Real holder still owns the file
        let conflict = locks.try_acquire("res", Duration::from_secs(30)).await.unwrap();
        assert!(conflict.is_none());
    }

    #[tokio::test]
    async fn test_lock_file_roundtrip_is_exact() {
        let temp = tempdir().unwrap();
        let locks = manager(&temp);
        let paths = RuntimePaths::new(temp.path());

        let held = locks
            .try_acquire("steal:inst-y", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let on_disk: DistributedLock = fsio::read_json(&paths.lock_file("steal:inst-y")).await.unwrap();
        assert_eq!(on_disk, held);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_and_corrupt() {
        let temp = tempdir().unwrap();
        let locks = manager(&temp);
        let paths = RuntimePaths::new(temp.path());

        locks
            .try_acquire("short", Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        locks
            .try_acquire("long", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        tokio::fs::write(paths.locks_dir().join("garbage.lock"), "not json")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = locks.cleanup_expired().await.unwrap();
        assert_eq!(removed, 2);

        // The live lock survived
        let conflict = locks.try_acquire("long", Duration::from_secs(30)).await.unwrap();
        assert!(conflict.is_none());
    }
}
