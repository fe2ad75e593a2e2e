//! Deadline-bound retry driver with exponential jitter backoff.
//!
//! Drives one logical query through up to `max_retry_attempts + 1`
//! attempts. Each attempt is raced against the remaining deadline so
//! no single attempt can outrun the caller's budget; between attempts
//! the driver sleeps `jitter · min(base · 2^n, cap)` where `n` is the
//! attempt count so far. Crossing the deadline at any checkpoint
//! surfaces a timeout carrying the accumulated request context.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::classify::{AttemptFailure, RequestBehaviour};
use super::context::{SharedContext, decorate};
use crate::error::{Error, Result};

/// Absolute point in time the whole logical query must finish by.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: tokio::time::Instant,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: tokio::time::Instant::now() + budget,
        }
    }

    pub fn instant(&self) -> tokio::time::Instant {
        self.at
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .checked_duration_since(tokio::time::Instant::now())
            .filter(|left| !left.is_zero())
    }

    /// Whether sleeping `delay` would cross the deadline.
    pub fn would_cross(&self, delay: Duration) -> bool {
        tokio::time::Instant::now() + delay > self.at
    }
}

/// Backoff knobs. The defaults implement the service's retry contract;
/// tests disable jitter to assert the raw schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retry_attempts: u32,
    /// Backoff base, doubled per attempt.
    pub base_delay: Duration,
    /// Cap on the computed backoff window.
    pub max_delay: Duration,
    /// Scale each window by a uniform random factor in `[0, 1)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 7,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retry_attempts: u32) -> Self {
        Self {
            max_retry_attempts,
            ..Default::default()
        }
    }

    /// Backoff before the next attempt, given the number of attempts
    /// made so far.
    fn backoff_delay(&self, attempts_so_far: u32) -> Duration {
        let window = self.base_delay.as_secs_f64() * 2f64.powi(attempts_so_far.min(31) as i32);
        let capped = window.min(self.max_delay.as_secs_f64());
        if self.jitter {
            Duration::from_secs_f64(capped * rand::random::<f64>())
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Run `attempt` until it succeeds, a failure classifies as
/// non-retriable, retries are exhausted, or the deadline is crossed.
///
/// The classifier is injected so the driver stays a pure control loop;
/// production callers pass [`super::classify::classify`].
pub async fn run_with_retry<T, F, Fut, C>(
    config: &RetryConfig,
    deadline: Deadline,
    ctx: &SharedContext,
    mut classify_fn: C,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptFailure>>,
    C: FnMut(AttemptFailure, &mut super::context::RequestContext) -> RequestBehaviour,
{
    let mut last_error: Option<Error> = None;

    for round in 0..=config.max_retry_attempts {
        let Some(remaining) = deadline.remaining() else {
            return Err(deadline_timeout(ctx, last_error));
        };

        ctx.lock().unwrap().increment_attempt();

        match tokio::time::timeout(remaining, attempt()).await {
            // The attempt outran the caller's budget.
            Err(_elapsed) => return Err(deadline_timeout(ctx, last_error)),
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(failure)) => {
                let behaviour = {
                    let mut guard = ctx.lock().unwrap();
                    classify_fn(failure, &mut guard)
                };
                if !behaviour.retry {
                    let guard = ctx.lock().unwrap();
                    return Err(decorate(behaviour.error, &guard));
                }
                // Keep the classifier's error verbatim; it only
                // surfaces if this turns out to be the final attempt.
                ctx.lock().unwrap().previous_attempt_errors = Some(behaviour.error.clone());
                last_error = Some(behaviour.error);
            }
        }

        if round == config.max_retry_attempts {
            break;
        }

        let attempts_so_far = ctx.lock().unwrap().num_attempts;
        let delay = config.backoff_delay(attempts_so_far);
        if deadline.would_cross(delay) {
            // Not enough budget for another attempt: run out the
            // remaining deadline, then time out.
            if let Some(left) = deadline.remaining() {
                tokio::time::sleep(left).await;
            }
            return Err(deadline_timeout(ctx, last_error));
        }
        warn!(
            attempt = attempts_so_far,
            backoff_ms = delay.as_millis() as u64,
            "analytics attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }

    let error = last_error.unwrap_or_else(|| Error::Analytics("retries exhausted".into()));
    let guard = ctx.lock().unwrap();
    Err(decorate(error, &guard))
}

/// Record the last attempt's error on the context and build the
/// decorated timeout that surfaces to the caller.
fn deadline_timeout(ctx: &SharedContext, last_error: Option<Error>) -> Error {
    let mut guard = ctx.lock().unwrap();
    if let Some(error) = last_error {
        guard.previous_attempt_errors = Some(error);
    }
    decorate(Error::Timeout("analytics query timed out".into()), &guard)
}
