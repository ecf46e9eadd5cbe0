//! Exponential backoff policy and a generic sequential retry combinator.
//!
//! ```text
//! Attempt    Delay before it (base = 1s)
//! ──────────────────────────────────────
//!    1        none
//!    2        2s
//!    3        4s
//!    n        base × 2^(n−1), capped at max_delay
//! ```

use std::future::Future;
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RegistrationConfig;

/// Maps an attempt number to the wait before it.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]`; each delay is scaled by a random factor in
    /// `1 ± jitter_factor`. Zero means fully deterministic delays.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RegistrationConfig::default())
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    pub fn from_config(config: &RegistrationConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay before `attempt` (1-indexed). Attempt 1 runs
    /// immediately.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before `attempt`, with jitter applied when configured.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter_factor == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        delay.mul_f64(1.0 + spread).min(self.max_delay)
    }
}

/// Why [`retry`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The error was classified as not worth retrying.
    NonRetryable { error: E, attempts: u32 },
    /// Every attempt in the range failed with a retryable error.
    Exhausted { error: E, attempts: u32 },
    /// The attempt range was empty; nothing was tried.
    NoAttemptsLeft,
}

impl<E> RetryError<E> {
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::NonRetryable { error, .. } | Self::Exhausted { error, .. } => Some(error),
            Self::NoAttemptsLeft => None,
        }
    }
}

/// Run `op` for each attempt number in `attempts` until it succeeds, fails
/// with a non-retryable error, or the range runs out.
///
/// Attempts are strictly sequential. The first attempt in the range runs
/// immediately; each later attempt `n` first waits `policy.delay_for(n)`.
pub async fn retry<T, E, F, Fut, P>(
    attempts: RangeInclusive<u32>,
    policy: &BackoffPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let (first, last) = (*attempts.start(), *attempts.end());
    if first > last {
        return Err(RetryError::NoAttemptsLeft);
    }

    let mut attempt = first;
    loop {
        if attempt > first {
            let delay = policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !is_retryable(&error) => {
                warn!(attempt, "Non-retryable failure: {}", error);
                return Err(RetryError::NonRetryable {
                    error,
                    attempts: attempt,
                });
            }
            Err(error) if attempt >= last => {
                warn!(attempt, "Retry budget exhausted: {}", error);
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt,
                });
            }
            Err(error) => {
                warn!(attempt, "Retryable failure: {}", error);
                attempt += 1;
            }
        }
    }
}
