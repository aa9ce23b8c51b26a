/// Retry policy with exponential backoff, jitter and error classification
use crate::class::ErrorClass;
use crate::shutdown::wait_for_shutdown;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_interval: Duration,
    /// Upper bound for any single delay (before jitter)
    pub max_interval: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Fraction of the delay added as uniform random jitter (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Pre-jitter delay for the zero-based attempt `n`:
    /// `min(initial_interval * multiplier^n, max_interval)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_interval.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Delay with jitter applied: `delay + uniform[0, delay * jitter)`.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let spread = base.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..spread);
        base + Duration::from_secs_f64(extra)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
    #[error("Permanent failure after {attempts} attempt(s): {last_error}")]
    Permanent {
        attempts: u32,
        class: ErrorClass,
        last_error: E,
    },
    #[error("Retry cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, last_error: Option<E> },
}

impl<E> RetryError<E> {
    /// Number of attempts that were actually made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Permanent { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last_error, .. } | RetryError::Permanent { last_error, .. } => {
                Some(last_error)
            }
            RetryError::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }
}

/// Runs fallible operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `op` until it succeeds, the classifier reports a non-retryable
    /// error, `max_attempts` is reached, or `shutdown` fires during a backoff.
    pub async fn execute<F, Fut, T, E, C>(
        &self,
        mut op: F,
        classify: C,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let err = match op().await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };
            attempt += 1;

            let class = classify(&err);
            if !class.is_retryable() {
                warn!(
                    attempt = attempt,
                    class = %class,
                    error = %err,
                    "Non-retryable error, giving up"
                );
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    class,
                    last_error: err,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    attempts = attempt,
                    error = %err,
                    "Max attempts ({}) reached",
                    max_attempts
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }

            let delay = self.policy.jittered_delay_for(attempt - 1);
            warn!(
                "Retry attempt {}/{} failed ({}), waiting {:?}",
                attempt, max_attempts, err, delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(shutdown) => {
                    debug!(attempts = attempt, "Backoff interrupted by shutdown");
                    return Err(RetryError::Cancelled {
                        attempts: attempt,
                        last_error: Some(err),
                    });
                }
            }
        }
    }
}
