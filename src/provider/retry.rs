//! Exponential-backoff retry wrapper shared by every provider operation.
//!
//! Retryable kinds (network, timeout, 5xx, 429) back off `retry_delay · 2^n`;
//! everything else surfaces on the first failure.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ProviderError, ProviderResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Base delay in seconds, doubled per attempt.
    pub retry_delay: u64,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.retry_delay.saturating_mul(1 << attempt.min(16)))
    }
}

/// Run `op` up to `max_retries + 1` times. `op` receives the attempt index.
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    provider: &str,
    op_name: &str,
    cancel: &CancellationToken,
    op: F,
) -> ProviderResult<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::cancelled(provider));
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind.is_retryable() && attempt < policy.max_retries => {
                let wait = policy.backoff(attempt);
                tracing::warn!(
                    provider,
                    op = op_name,
                    kind = %err.kind,
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    wait_s = wait.as_secs(),
                    "transient failure, backing off: {}",
                    err.message
                );
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = cancel.cancelled() => {
                        return Err(ProviderError::cancelled(provider));
                    }
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
