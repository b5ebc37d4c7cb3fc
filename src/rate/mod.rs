//! Adaptive rate control and retry policy for model calls

pub mod controller;
pub mod retry;

pub use controller::{PredictiveAnalysis, RateController, RateSummary, RateTrend, adaptive_cycle_delay};
pub use retry::{apply_jitter, call_with_retry, sleep_with_cancel};
