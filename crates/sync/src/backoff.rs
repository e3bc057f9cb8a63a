//! Exponential backoff with full jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry policy for a single delivery.
///
/// Attempt `n` (0-based) that fails is followed by a sleep drawn uniformly
/// from `[0, min(max_delay, min_delay * 2^n)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt (0 = no retries).
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl BackoffPolicy {
    /// A single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            min_delay,
            max_delay,
        }
    }

    /// Upper bound of the sleep that follows failed attempt `attempt`.
    pub fn delay_cap(&self, attempt: u32) -> Duration {
        if self.min_delay.is_zero() {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt)
            .and_then(|factor| self.min_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Full-jitter delay for failed attempt `attempt`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let cap_ms = u64::try_from(self.delay_cap(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=cap_ms))
    }

    /// Run `attempt_fn` until it succeeds or the attempts are exhausted.
    ///
    /// `attempt_fn` receives the 0-based attempt number and is called at most
    /// `max_attempts + 1` times. The error of the last attempt is returned.
    pub async fn retry<T, E, F, Fut>(&self, mut attempt_fn: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts => {
                    if self.max_attempts > 0 {
                        tracing::warn!(attempt, "giving up after {} attempts: {err}", attempt + 1);
                    }
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.jittered_delay(attempt, &mut rand::thread_rng());
                    tracing::debug!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "attempt failed, backing off: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
