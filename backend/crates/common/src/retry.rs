//! Bounded retry with exponential backoff.
//!
//! Every call site that talks to an external collaborator (tracking API,
//! sensors API, Redis) goes through [`with_retry`] with its own
//! [`RetryPolicy`], so attempt counting, backoff and logging look the same
//! everywhere.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to every backoff.
    pub jitter: Duration,
    /// Give up once the next sleep would push total elapsed time past this.
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            jitter: Duration::ZERO,
            max_elapsed: None,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, delay)
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    /// Watermark store: 5 attempts, 1s doubling up to 30s, up to 3s jitter.
    pub fn store() -> Self {
        Self::exponential(5, Duration::from_secs(1), Duration::from_secs(30))
            .with_jitter(Duration::from_secs(3))
    }

    /// Downstream delivery: 3 attempts, fixed 10s apart.
    pub fn delivery() -> Self {
        Self::fixed(3, Duration::from_secs(10))
    }

    /// Tracking API: exponential from 1s, bounded by a total time budget.
    pub fn upstream(budget: Duration) -> Self {
        Self::exponential(u32::MAX, Duration::from_secs(1), budget).with_max_elapsed(budget)
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter.is_zero() {
            return base;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Permanent(_) => 1,
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or `policy` runs out of attempts or time.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_retryable(&err) {
            return Err(RetryError::Permanent(err));
        }

        if attempt >= policy.max_attempts {
            tracing::warn!(operation = label, attempt, error = %err, "retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.jittered(policy.delay_for(attempt));
        if let Some(budget) = policy.max_elapsed {
            if started.elapsed() + delay > budget {
                tracing::warn!(
                    operation = label,
                    attempt,
                    budget_secs = budget.as_secs(),
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
        }

        tracing::warn!(
            operation = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after backoff"
        );
        tokio::time::sleep(delay).await;
    }
}
