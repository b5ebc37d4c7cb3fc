//! piloop - multi-instance self-improvement loop coordinator for the pi
//! coding agent
//!
//! Cooperating agent processes on one host share an LLM parallelism budget
//! through filesystem state, pace their calls with an adaptive rate
//! controller, and drive autonomous self-analysis runs against a host agent.
//!
//! # Core Concepts
//!
//! - **Bounded fan-out**: every batch of model calls goes through a worker
//!   pool with a hard in-flight cap and child-token cancellation
//! - **Filesystem coordination**: instances discover each other via
//!   heartbeat records under `~/.pi/runtime/` and split the shared budget
//! - **Adaptive pacing**: rate-limit rejections shrink per-model capacity,
//!   sustained success recovers it
//! - **State in files**: every run leaves a Markdown log; stop requests go
//!   through a stop-signal file any actor can write
//!
//! # Modules
//!
//! - [`pool`] - concurrency-limited worker pool
//! - [`coordinator`] - cross-instance registry, locks and work stealing
//! - [`rate`] - adaptive rate controller and retry policy
//! - [`r#loop`] - the loop state machine (cycle and UL modes)
//! - [`detect`] - pure-function verification and bias detectors
//! - [`vcs`] - git capability and the cycle commit flow
//! - [`llm`] / [`host`] - capabilities consumed from the host agent
//! - [`config`] - layered configuration

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod domain;
pub mod host;
pub mod llm;
pub mod pool;
pub mod rate;
pub mod vcs;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use config::{Config, JitterMode, LoopSettings, RateControlSettings, RetrySettings};
pub use coordinator::{
    CoordinatorConfig, CoordinatorOverrides, DistributedLock, InstanceCoordinator, LockManager, QueueStateUpdate,
    RuntimePaths, StealingStatsSnapshot, model_matches,
};
pub use detect::{
    DetectedPattern, MetacognitiveCheck, MismatchReport, TriggerContext, TriggerDecision, TriggerMode,
    detect_claim_result_mismatch, inference_depth_score, run_detection_pass, run_metacognitive_check,
    should_trigger_verification,
};
pub use domain::{
    ActiveModel, InstanceId, InstanceRecord, LockId, QueueStateBroadcast, RunId, StealPriority, StealableEntry,
};
pub use host::{DeliverAs, HostAgent, HostEvent, StartRunArgs, ToolDescriptor, ToolOutput, parse_slash_args};
pub use llm::{MockModelClient, ModelClient, ModelError, ModelRequest, ThinkingLevel, model_timeout};
pub use pool::{PoolError, PoolOptions, Settled, run_all_settled, run_with_limit};
pub use r#loop::{
    CycleEngine, EngineDeps, LoopManager, LoopManagerDeps, LoopRunState, PERSPECTIVES, PerspectiveResult, Phase,
    RunOptions, RunProgress, RunStartInfo, StatusReport, StopReason, StopSignal, TrajectoryTracker, UlDriver,
    UlDriverDeps, UlMachine, UlTransition,
};
pub use rate::{RateController, RateSummary, adaptive_cycle_delay, call_with_retry, sleep_with_cancel};
pub use vcs::{GitVcs, Vcs, VcsError, commit_cycle_changes, sanitize_commit_message};
