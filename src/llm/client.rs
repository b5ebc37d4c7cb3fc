//! ModelClient trait definition
//!
//! The LLM wire protocol is owned by the host agent; this crate only sees an
//! opaque `call_model` capability. Each call is independent and carries its
//! own timeout and cancellation handle.

use async_trait::async_trait;

use super::{ModelError, ModelRequest};

/// Opaque model-call capability provided by the host
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Execute a single prompt and return the raw text output
    ///
    /// Implementations must honor `request.timeout` per attempt and surface
    /// `ModelError::Cancelled` when `request.cancel` fires.
    async fn call_model(&self, request: ModelRequest) -> Result<String, ModelError>;
}

/// Scripted client for tests and offline runs
pub mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Returns scripted outcomes in order; repeats the final outcome once the
    /// script is exhausted
    pub struct MockModelClient {
        script: Vec<Result<String, ModelError>>,
        call_count: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl MockModelClient {
        pub fn new(script: Vec<Result<String, ModelError>>) -> Self {
            Self {
                script,
                call_count: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        /// A client that always returns the same output
        pub fn always(output: impl Into<String>) -> Self {
            Self::new(vec![Ok(output.into())])
        }

        /// Simulate per-call latency (makes cancellation observable)
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Prompts received so far, in call order
        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().expect("mock prompts lock").clone()
        }
    }

    #[async_trait]
    impl ModelClient for MockModelClient {
        async fn call_model(&self, request: ModelRequest) -> Result<String, ModelError> {
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = request.cancel.cancelled() => return Err(ModelError::Cancelled),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            } else if request.cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }

            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().expect("mock prompts lock").push(request.prompt);

            match self.script.get(idx).or_else(|| self.script.last()) {
                Some(outcome) => outcome.clone(),
                None => Err(ModelError::InvalidResponse("mock script empty".to_string())),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tokio_util::sync::CancellationToken;

        #[tokio::test]
        async fn test_script_plays_in_order_then_repeats_last() {
            let client = MockModelClient::new(vec![
                Ok("first".to_string()),
                Err(ModelError::RateLimited { retry_after: None }),
                Ok("third".to_string()),
            ]);

            let req = ModelRequest::new("anthropic", "claude-sonnet-4", "p");
            assert_eq!(client.call_model(req.clone()).await.unwrap(), "first");
            assert!(client.call_model(req.clone()).await.unwrap_err().is_rate_limit());
            assert_eq!(client.call_model(req.clone()).await.unwrap(), "third");
            // Exhausted: repeats the final outcome
            assert_eq!(client.call_model(req.clone()).await.unwrap(), "third");
            assert_eq!(client.call_count(), 4);
        }

        #[tokio::test]
        async fn test_cancellation_with_delay() {
            let client = MockModelClient::always("never").with_delay(Duration::from_secs(5));
            let cancel = CancellationToken::new();
            cancel.cancel();

            let req = ModelRequest::new("anthropic", "claude-sonnet-4", "p").with_cancel(cancel);
            let err = client.call_model(req).await.unwrap_err();
            assert!(err.is_cancelled());
        }

        #[tokio::test]
        async fn test_prompts_are_recorded() {
            let client = MockModelClient::always("ok");
            let req = ModelRequest::new("anthropic", "claude-sonnet-4", "hello there");
            client.call_model(req).await.unwrap();
            assert_eq!(client.prompts(), vec!["hello there".to_string()]);
        }
    }
}
