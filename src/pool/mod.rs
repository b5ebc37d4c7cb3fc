//! Concurrency-limited worker pool with abort-aware cancellation

pub mod options;
pub mod runner;

pub use options::{ItemIdFn, PoolError, PoolOptions, Settled};
pub use runner::{run_all_settled, run_with_limit};
