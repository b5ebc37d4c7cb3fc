//! Retry wrapper for model calls
//!
//! Exponential backoff with configurable jitter. Rate-limited attempts have
//! a separate, more patient budget (count and total-wait caps) and feed the
//! adaptive rate controller; other transient failures retry up to
//! `max_retries`. Cancellation always wins: a cancelled wait or call
//! surfaces `ModelError::Cancelled`, never the underlying error.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{JitterMode, RetrySettings};
use crate::llm::{ModelClient, ModelError, ModelRequest};

use super::controller::RateController;

/// Sleep that aborts with `ModelError::Cancelled` when the token fires
pub async fn sleep_with_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), ModelError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ModelError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Apply the configured jitter to a computed backoff delay
pub fn apply_jitter(base: Duration, mode: JitterMode) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::rng();
    let jittered_ms = match mode {
        JitterMode::Full => rng.random_range(0..=base_ms),
        JitterMode::Partial => base_ms / 2 + rng.random_range(0..=base_ms / 2),
        JitterMode::None => base_ms,
    };
    Duration::from_millis(jittered_ms)
}

fn next_delay(current: Duration, settings: &RetrySettings) -> Duration {
    let scaled = current.as_secs_f64() * settings.backoff_multiplier;
    Duration::from_secs_f64(scaled).min(settings.max_delay())
}

/// Call the model with retries, recording rate events in the controller
pub async fn call_with_retry(
    client: &dyn ModelClient,
    request: ModelRequest,
    settings: &RetrySettings,
    rate: &RateController,
) -> Result<String, ModelError> {
    let mut transient_attempts = 0u32;
    let mut rate_limit_attempts = 0u32;
    let mut rate_limit_waited = Duration::ZERO;
    let mut delay = settings.initial_delay();

    loop {
        if request.cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }

        match client.call_model(request.clone()).await {
            Ok(text) => {
                rate.record_success(&request.provider, &request.model_id);
                return Ok(text);
            }
            Err(ModelError::Cancelled) => return Err(ModelError::Cancelled),
            Err(e) if rate.is_rate_limit_error(&e) => {
                rate.record_rejection(&request.provider, &request.model_id, &e.to_string());
                rate_limit_attempts += 1;
                if rate_limit_attempts > settings.max_rate_limit_retries {
                    warn!(label = %request.label, attempts = rate_limit_attempts, "rate-limit retry budget exhausted");
                    return Err(e);
                }

                let wait = e.retry_after().unwrap_or_else(|| apply_jitter(delay, settings.jitter));
                if rate_limit_waited + wait > settings.max_rate_limit_wait() {
                    warn!(label = %request.label, waited = ?rate_limit_waited, "rate-limit wait budget exhausted");
                    return Err(e);
                }
                rate_limit_waited += wait;

                debug!(label = %request.label, attempt = rate_limit_attempts, ?wait, "rate limited, backing off");
                sleep_with_cancel(wait, &request.cancel).await?;
                delay = next_delay(delay, settings);
            }
            Err(e) if e.is_retryable() => {
                transient_attempts += 1;
                if transient_attempts > settings.max_retries {
                    warn!(label = %request.label, attempts = transient_attempts, error = %e, "transient retry budget exhausted");
                    return Err(e);
                }

                let wait = apply_jitter(delay, settings.jitter);
                debug!(label = %request.label, attempt = transient_attempts, ?wait, error = %e, "transient failure, backing off");
                sleep_with_cancel(wait, &request.cancel).await?;
                delay = next_delay(delay, settings);
            }
            Err(e) => return Err(e),
        }
    }
}
