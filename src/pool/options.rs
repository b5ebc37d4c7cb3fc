//! Worker pool options and result types

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error raised by the pool itself (as opposed to a worker error)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The caller's cancellation token fired before all items completed
    #[error("pool cancelled")]
    Cancelled,

    /// A worker task died without recording a result
    #[error("pool worker panicked")]
    WorkerPanicked,
}

/// Per-input outcome in all-settled mode
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Settled<R> {
    Fulfilled { index: usize, value: R },
    Rejected { index: usize, reason: String },
}

impl<R> Settled<R> {
    pub fn index(&self) -> usize {
        match self {
            Self::Fulfilled { index, .. } | Self::Rejected { index, .. } => *index,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled { .. })
    }
}

/// Extracts a stable id from an item for weight lookup
pub type ItemIdFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Options controlling a pool run
pub struct PoolOptions<T> {
    /// Caller-owned cancellation handle; the pool links a child token to it
    pub cancel: Option<CancellationToken>,

    /// Stop pulling new items after the first worker error
    pub abort_on_error: bool,

    /// Dispatch items in descending weight order instead of insertion order
    pub use_priority: bool,

    /// Weight per item id; missing ids weigh 0
    pub item_weights: HashMap<String, f64>,

    /// Id extractor; priority ordering requires both this and `item_weights`
    pub get_item_id: Option<ItemIdFn<T>>,
}

impl<T> Default for PoolOptions<T> {
    fn default() -> Self {
        Self {
            cancel: None,
            abort_on_error: true,
            use_priority: false,
            item_weights: HashMap::new(),
            get_item_id: None,
        }
    }
}

impl<T> PoolOptions<T> {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    pub fn with_priority(
        mut self,
        weights: HashMap<String, f64>,
        get_item_id: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Self {
        self.use_priority = true;
        self.item_weights = weights;
        self.get_item_id = Some(Arc::new(get_item_id));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts: PoolOptions<u32> = PoolOptions::default();
        assert!(opts.abort_on_error);
        assert!(!opts.use_priority);
        assert!(opts.cancel.is_none());
    }

    #[test]
    fn test_settled_accessors() {
        let ok: Settled<u32> = Settled::Fulfilled { index: 2, value: 7 };
        let bad: Settled<u32> = Settled::Rejected {
            index: 0,
            reason: "boom".to_string(),
        };
        assert!(ok.is_fulfilled());
        assert_eq!(ok.index(), 2);
        assert!(!bad.is_fulfilled());
        assert_eq!(bad.index(), 0);
    }

    #[test]
    fn test_settled_serializes_with_status_tag() {
        let ok: Settled<u32> = Settled::Fulfilled { index: 1, value: 9 };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "fulfilled");
        assert_eq!(json["value"], 9);
    }
}
