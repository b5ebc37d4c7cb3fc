//! Identifier generation for instances, runs and locks
//!
//! All IDs use the format `{prefix}-{uuidv7}` so they sort by creation time
//! and are safe to embed in filenames.

use serde::{Deserialize, Serialize};

/// Generate a prefixed, time-ordered id
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::now_v7())
}

macro_rules! typed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh id
            pub fn new() -> Self {
                Self(generate_id($prefix))
            }

            /// Wrap an existing id string (e.g. read back from disk)
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from_string(s)
            }
        }
    };
}

typed_id!(InstanceId, "inst");
typed_id!(RunId, "run");
typed_id!(LockId, "lock");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("inst-"));
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let first = RunId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RunId::new();
        assert!(first.as_str() < second.as_str());
    }

    #[test]
    fn test_id_serde_is_transparent() {
        let id = LockId::from_string("lock-0192-test");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"lock-0192-test\"");

        let back: LockId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
