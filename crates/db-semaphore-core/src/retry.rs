//! Retryable critical sections.
//!
//! Every primitive that locks a master row runs its check-then-act sequence
//! through [`RetryPolicy::run`]. Transient store contention (deadlock victim,
//! lock-wait timeout) restarts the whole sequence after a short randomized
//! backoff; once the attempts are used up the caller sees "nothing acquired"
//! rather than an error.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Bounds for retrying a critical section on transient contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Lower bound of the randomized backoff between attempts.
    pub min_backoff: Duration,
    /// Upper bound of the randomized backoff between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const NO_RETRY: Self = Self {
        max_attempts: 1,
        min_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are exhausted.
    ///
    /// Returns `Ok(Some(value))` on success and `Ok(None)` when every attempt
    /// hit transient contention. Non-transient errors propagate immediately.
    pub async fn run<T, E, F, Fut>(
        &self,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if is_transient(&e) => {
                    if attempt == attempts {
                        warn!(attempts, error = %e, "giving up after transient contention");
                        break;
                    }
                    let backoff = self.backoff();
                    debug!(attempt, ?backoff, error = %e, "transient contention, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn backoff(&self) -> Duration {
        let min = self.min_backoff.min(self.max_backoff);
        let max = self.max_backoff.max(self.min_backoff);
        if min == max {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}
