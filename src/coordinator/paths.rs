//! Stable filesystem layout under the runtime root
//!
//! Layout (stable across releases):
//! - `<home>/.pi/runtime/instances/<instance_id>.lock` — instance records
//! - `<home>/.pi/runtime/queue-states/<instance_id>.json` — queue broadcasts
//! - `<home>/.pi/runtime/locks/<escaped_resource>.lock` — distributed locks
//! - `<home>/.pi/runtime/coordinator.json` — optional config overrides

use std::path::{Path, PathBuf};

use crate::domain::InstanceId;

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    root: PathBuf,
}

impl RuntimePaths {
    /// The well-known per-user runtime root
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pi")
            .join("runtime")
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    pub fn queue_states_dir(&self) -> PathBuf {
        self.root.join("queue-states")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("coordinator.json")
    }

    pub fn instance_file(&self, id: &InstanceId) -> PathBuf {
        self.instances_dir().join(format!("{}.lock", id))
    }

    pub fn queue_state_file(&self, id: &InstanceId) -> PathBuf {
        self.queue_states_dir().join(format!("{}.json", id))
    }

    pub fn lock_file(&self, resource: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", escape_resource(resource)))
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

/// Escape a resource name into a collision-free filename component
///
/// Alphanumerics, `.`, `_` and `-` pass through; every other byte becomes
/// `%XX`, so distinct resources always map to distinct filenames.
pub fn escape_resource(resource: &str) -> String {
    let mut out = String::with_capacity(resource.len());
    for b in resource.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{:02x}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let paths = RuntimePaths::new("/tmp/rt");
        let id = InstanceId::from_string("inst-abc");

        assert_eq!(paths.instance_file(&id), PathBuf::from("/tmp/rt/instances/inst-abc.lock"));
        assert_eq!(
            paths.queue_state_file(&id),
            PathBuf::from("/tmp/rt/queue-states/inst-abc.json")
        );
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/rt/coordinator.json"));
    }

    #[test]
    fn test_escape_resource_is_injective_for_common_cases() {
        assert_eq!(escape_resource("steal:inst-a"), "steal%3ainst-a");
        assert_ne!(escape_resource("steal:a"), escape_resource("steal_a"));
        assert_eq!(escape_resource("plain-name_1.2"), "plain-name_1.2");
    }

    #[test]
    fn test_lock_file_uses_escaped_name() {
        let paths = RuntimePaths::new("/tmp/rt");
        assert_eq!(
            paths.lock_file("steal:inst-a"),
            PathBuf::from("/tmp/rt/locks/steal%3ainst-a.lock")
        );
    }
}
