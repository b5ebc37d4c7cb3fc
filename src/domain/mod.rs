//! Domain types shared across the coordinator, pool and loop

pub mod id;
pub mod instance;
pub mod priority;
pub mod queue;

pub use id::{InstanceId, LockId, RunId, generate_id};
pub use instance::{ActiveModel, InstanceRecord};
pub use priority::StealPriority;
pub use queue::{MAX_STEALABLE_ENTRIES, QueueStateBroadcast, StealableEntry};
