use std::{future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{KasumiError, KasumiResult};

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random delay, never exceeding `max_delay`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt + 1`, `attempt` being zero based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        let room_ms = self.max_delay.saturating_sub(capped).as_millis() as u64;
        let limit = jitter_ms.min(room_ms);
        if limit == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..limit))
    }
}

/// Runs `operation` until it succeeds, fails permanently or runs out of retries.
///
/// Only errors reporting [`KasumiError::is_transient`] are retried. The wait between attempts
/// is interrupted by `token`, which makes the call return [`KasumiError::Cancelled`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> KasumiResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = KasumiResult<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(KasumiError::Cancelled);
        }

        let result = tokio::select! {
            _ = token.cancelled() => return Err(KasumiError::Cancelled),
            result = operation(attempt) => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                tracing::warn!(
                    "Attempt {attempt}/{} failed, retrying in {}ms. {e}",
                    policy.max_retries,
                    delay.as_millis()
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(KasumiError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
