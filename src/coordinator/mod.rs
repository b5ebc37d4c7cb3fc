//! Cross-instance coordinator
//!
//! Peer agent processes on one host discover each other through lock files
//! under `~/.pi/runtime/`, divide a shared LLM parallelism budget, and
//! opportunistically redistribute surplus work.

pub mod config;
pub mod fsio;
pub mod lock;
pub mod paths;
pub mod queue_state;
pub mod registry;
pub mod stealing;

pub use config::{CoordinatorConfig, CoordinatorOverrides};
pub use lock::{DistributedLock, LockManager};
pub use paths::{RuntimePaths, escape_resource};
pub use queue_state::QueueStateUpdate;
pub use registry::{InstanceCoordinator, model_matches};
pub use stealing::{StealingStats, StealingStatsSnapshot};
