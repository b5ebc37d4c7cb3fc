//! Work-stealing statistics

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Samples kept for the running mean latency
const LATENCY_WINDOW: usize = 100;

/// Internal counters, updated by the coordinator's steal path
#[derive(Debug, Default)]
pub struct StealingStats {
    attempts: u64,
    successes: u64,
    failures: u64,
    latency_samples: VecDeque<f64>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Read-only snapshot for status reporting
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StealingStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub mean_latency_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl StealingStats {
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_success(&mut self, latency_ms: f64) {
        self.successes += 1;
        self.last_success_at = Some(Utc::now());
        if self.latency_samples.len() == LATENCY_WINDOW {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn mean_latency_ms(&self) -> f64 {
        if self.latency_samples.is_empty() {
            return 0.0;
        }
        self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64
    }

    pub fn snapshot(&self) -> StealingStatsSnapshot {
        StealingStatsSnapshot {
            attempts: self.attempts,
            successes: self.successes,
            failures: self.failures,
            mean_latency_ms: self.mean_latency_ms(),
            last_success_at: self.last_success_at,
        }
    }
}
