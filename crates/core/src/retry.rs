use crate::cancel::CancellationToken;
use crate::config::RetryConfig;
use crate::error::{ProviderError, ProviderErrorKind, RagError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// One backoff policy shared by every provider call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(RetryConfig::default())
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(value: RetryConfig) -> Self {
        Self {
            max_attempts: value.max_attempts.max(1),
            base_delay: value.base_delay(),
            max_delay: value.max_delay(),
            attempt_timeout: value.attempt_timeout(),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, failed_attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let computed = self.base_delay.saturating_mul(1u32 << exponent);
        let wanted = match hint {
            Some(hint) if hint > computed => hint,
            _ => computed,
        };
        wanted.min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails permanently, exhausts the attempts or is cancelled.
    /// `call` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        provider: &str,
        cancel: Option<&CancellationToken>,
        mut call: F,
    ) -> Result<T, RagError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(RagError::Cancelled);
            }

            let outcome = with_cancel(cancel, tokio::time::timeout(self.attempt_timeout, call(attempt))).await;
            let error = match outcome {
                None => return Err(RagError::Cancelled),
                Some(Ok(Ok(value))) => return Ok(value),
                Some(Ok(Err(error))) => error,
                Some(Err(_elapsed)) => ProviderError::new(
                    ProviderErrorKind::Timeout,
                    provider,
                    format!("{operation} exceeded {}s", self.attempt_timeout.as_secs_f32()),
                ),
            };

            if !error.is_transient() {
                debug!(operation, provider, kind = %error.kind, "permanent provider failure");
                return Err(error.into());
            }
            if attempt >= self.max_attempts {
                warn!(operation, provider, attempt, kind = %error.kind, "retries exhausted");
                return Err(error.into());
            }

            let delay = self.backoff(attempt, error.retry_after);
            warn!(
                operation,
                provider,
                attempt,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                "transient provider failure, retrying"
            );
            if with_cancel(cancel, tokio::time::sleep(delay)).await.is_none() {
                return Err(RagError::Cancelled);
            }
        }
    }
}

/// Resolves to `None` if the token fires before `future` completes.
pub async fn with_cancel<F: Future>(cancel: Option<&CancellationToken>, future: F) -> Option<F::Output> {
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = future => Some(output),
            }
        }
        None => Some(future.await),
    }
}
