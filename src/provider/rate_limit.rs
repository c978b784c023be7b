//! Per-provider token bucket.
//!
//! `max_calls` tokens over a sliding `window`. `acquire` either waits for the
//! oldest call to age out (at most one full window) or fails with
//! `rate_limited`, depending on the provider's `wait_on_limit` setting.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ErrorKind, ProviderError, ProviderResult};

pub struct RateLimiter {
    provider: String,
    max_calls: u32,
    window: Duration,
    wait_on_limit: bool,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(provider: &str, max_calls: u32, window_secs: u64, wait_on_limit: bool) -> Self {
        Self {
            provider: provider.to_string(),
            max_calls: max_calls.max(1),
            window: Duration::from_secs(window_secs.max(1)),
            wait_on_limit,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Take one token, waiting for a slot when permitted. Honours
    /// cancellation while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> ProviderResult<()> {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while let Some(front) = calls.front() {
                    if now.duration_since(*front) >= self.window {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }
                if (calls.len() as u32) < self.max_calls {
                    calls.push_back(now);
                    return Ok(());
                }
                // Oldest in-window call determines when the next slot opens.
                let oldest = *calls.front().expect("non-empty at capacity");
                self.window.saturating_sub(now.duration_since(oldest))
            };

            if !self.wait_on_limit {
                return Err(ProviderError::new(
                    &self.provider,
                    ErrorKind::RateLimited,
                    format!(
                        "rate limit of {} calls per {:?} exhausted",
                        self.max_calls, self.window
                    ),
                ));
            }

            tracing::debug!(
                provider = %self.provider,
                wait_ms = wait.as_millis() as u64,
                "rate limiter waiting for a slot"
            );

            tokio::select! {
                () = tokio::time::sleep(wait.min(self.window)) => {}
                () = cancel.cancelled() => {
                    return Err(ProviderError::cancelled(&self.provider));
                }
            }
        }
    }

    /// Calls currently counted against the window.
    pub async fn in_flight(&self) -> usize {
        let mut calls = self.calls.lock().await;
        let now = Instant::now();
        while let Some(front) = calls.front() {
            if now.duration_since(*front) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
        calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_up_to_max_calls_immediately() {
        let limiter = RateLimiter::new("test", 3, 60, false);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert_eq!(limiter.in_flight().await, 3);
    }

    #[tokio::test]
    async fn fails_fast_when_waiting_disabled() {
        let limiter = RateLimiter::new("test", 1, 60, false);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn waits_for_slot_when_permitted() {
        tokio::time::pause();
        let limiter = RateLimiter::new("test", 1, 1, true);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        // Second acquire must wait ~1s for the first token to age out; with
        // paused time, sleep auto-advances the clock.
        limiter.acquire(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let limiter = RateLimiter::new("test", 1, 600, true);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
