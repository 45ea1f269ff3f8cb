//! Exponential backoff with jitter for transient failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::error::FetchError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: `base * 2^(attempt-1)` capped at
    /// `max_delay`, plus up to 50% random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1 << exp).min(self.max_delay);
        let jitter_ms = (backoff.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        backoff + jitter
    }

    /// Decide what happens after attempt `attempt` failed with `err`.
    ///
    /// Returns `Ok(())` once the backoff wait has elapsed and another attempt
    /// should run. Permanent errors come back unchanged, running out of
    /// attempts wraps the error in [`FetchError::RetriesExhausted`], and
    /// cancellation during the wait yields [`FetchError::Cancelled`].
    pub async fn backoff(
        &self,
        label: &str,
        attempt: u32,
        err: FetchError,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        if !err.is_transient() {
            return Err(err);
        }
        if attempt >= self.max_attempts.max(1) {
            return Err(FetchError::RetriesExhausted {
                file: label.to_string(),
                attempts: attempt,
                source: Box::new(err),
            });
        }
        let delay = self.delay_for(attempt);
        tracing::warn!(
            file = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        crate::telemetry::record_retry();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => self.backoff(label, attempt, e, cancel).await?,
            }
            attempt += 1;
        }
    }
}
