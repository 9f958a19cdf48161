// =============================================================================
// Retry Executor — explicit, bounded retry policy for exchange calls
// =============================================================================
//
// Retry behaviour is a value, not control flow: a `RetryPolicy` (attempt
// budget + backoff) is handed to `run` together with a predicate classifying
// errors as retryable or fatal. Fatal errors short-circuit immediately;
// retryable ones are retried until the budget is spent, at which point the
// caller receives a distinct `Exhausted` outcome.
//
// No call through this executor blocks indefinitely.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Bounded retry budget with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first (2 means up to 3 calls total).
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per retry.
    pub base_backoff: Duration,
    /// Ceiling on any single backoff sleep.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff to sleep before retry number `retry` (1-based).
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << (retry - 1).min(16);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Terminal outcome of a retried operation that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The error was classified non-retryable; no further attempts made.
    #[error("fatal: {0}")]
    Fatal(E),
    /// The retry budget was spent without success.
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Run `op` under `policy`, retrying while `is_retryable` approves.
pub async fn run<T, E, Fut, Op>(
    policy: &RetryPolicy,
    op_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = op_name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                warn!(op = op_name, attempt, error = %e, "non-retryable error — aborting");
                return Err(RetryError::Fatal(e));
            }
            Err(e) if attempt > policy.max_retries => {
                warn!(
                    op = op_name,
                    attempts = attempt,
                    error = %e,
                    "retry budget exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let backoff = policy.backoff(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient error — backing off before retry"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
