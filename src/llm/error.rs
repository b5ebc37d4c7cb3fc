//! Model call error taxonomy

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the host's `call_model` capability
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The cancellation handle fired; never retried, never mutates state
    #[error("cancelled")]
    Cancelled,

    /// 429-equivalent; recorded by the rate controller and retried
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider error with an HTTP-like status
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Per-attempt timeout elapsed
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// The provider returned something unparseable
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Transient errors worth another attempt (rate limits are handled by a
    /// separate, more patient budget)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Timeout(_) => true,
            Self::Network(_) => true,
            Self::Cancelled => false,
            Self::InvalidResponse(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_classification() {
        let err = ModelError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(err.is_rate_limit());
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ModelError::Api { status: 503, message: "overloaded".into() }.is_retryable());
        assert!(!ModelError::Api { status: 400, message: "bad request".into() }.is_retryable());
        assert!(ModelError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(ModelError::Network("reset".into()).is_retryable());
        assert!(!ModelError::InvalidResponse("garbage".into()).is_retryable());
    }

    #[test]
    fn test_cancelled_is_never_retryable() {
        let err = ModelError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
    }
}
