//! Bounded-wait "run under the lock" wrapper for reader-writer semaphores.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::error::{LockError, LockResult};
use crate::lease::{MIN_LEASE, validate_lease};
use crate::runner::settle;
use crate::traits::ReaderWriterSemaphore;

/// Reader-writer runner configuration.
#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    /// Lease of the locks taken on the task's behalf. Kept alive while the
    /// task runs.
    pub lease: Duration,
    /// Delay between acquisition attempts while waiting.
    pub poll_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Runs tasks under a shared or exclusive lock, waiting up to a timeout to
/// get it.
///
/// The lock is always released when the task completes. While the task
/// runs, a background keepalive refreshes the lock every half lease.
#[derive(Debug)]
pub struct ReaderWriterRunner<S> {
    semaphore: Arc<S>,
    options: RunnerOptions,
}

impl<S> Clone for ReaderWriterRunner<S> {
    fn clone(&self) -> Self {
        Self {
            semaphore: Arc::clone(&self.semaphore),
            options: self.options,
        }
    }
}

impl<S> ReaderWriterRunner<S>
where
    S: ReaderWriterSemaphore + 'static,
{
    /// Creates a runner with default options.
    pub fn new(semaphore: Arc<S>) -> Self {
        Self {
            semaphore,
            options: RunnerOptions::default(),
        }
    }

    /// Creates a runner with `options`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the lease is below [`MIN_LEASE`] or the
    /// poll interval is zero.
    pub fn with_options(semaphore: Arc<S>, options: RunnerOptions) -> LockResult<Self> {
        validate_lease(options.lease, MIN_LEASE)?;
        if options.poll_interval.is_zero() {
            return Err(LockError::InvalidConfig(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(Self { semaphore, options })
    }

    /// The runner's options.
    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Runs `task` under the exclusive lock for `key`.
    ///
    /// Declares writer intent first, which turns new readers away, then
    /// polls until the readers already admitted have drained.
    ///
    /// # Errors
    ///
    /// * `LockUnavailable` if another writer holds intent or the lock, or if
    ///   readers have not drained within `timeout`. Writer intent is
    ///   withdrawn before returning.
    /// * `LockReleaseFailed` if the task succeeded but the lock could not
    ///   be released.
    /// * The task's own error, after the lock is released.
    #[instrument(skip(self, task), fields(mode = "exclusive"))]
    pub async fn run_with_exclusive_lock<T, E, F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let precursor = self.semaphore.acquire_exclusive_precursor(key).await?;
        let token = match self.wait_for_exclusive(key, &precursor, timeout).await {
            Ok(token) => token,
            Err(e) => {
                self.abandon_precursor(key, &precursor).await;
                return Err(e.into());
            }
        };

        let keepalive = self.spawn_keepalive(key, &token, LockMode::Exclusive);
        let outcome = AssertUnwindSafe(async move { task().await })
            .catch_unwind()
            .await;
        drop(keepalive);
        let released = self.semaphore.release_exclusive(key, &token).await;

        settle(key, outcome, released)
    }

    /// Runs `task` under a shared lock for `key`.
    ///
    /// # Errors
    ///
    /// * `LockUnavailable` if a writer still holds intent or the lock when
    ///   `timeout` elapses.
    /// * `LockReleaseFailed` if the task succeeded but the lock could not
    ///   be released.
    /// * The task's own error, after the lock is released.
    #[instrument(skip(self, task), fields(mode = "shared"))]
    pub async fn run_with_shared_lock<T, E, F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let token = self.wait_for_shared(key, timeout).await?;

        let keepalive = self.spawn_keepalive(key, &token, LockMode::Shared);
        let outcome = AssertUnwindSafe(async move { task().await })
            .catch_unwind()
            .await;
        drop(keepalive);
        let released = self.semaphore.release_shared(key, &token).await;

        settle(key, outcome, released)
    }

    async fn wait_for_exclusive(
        &self,
        key: &str,
        precursor: &str,
        timeout: Duration,
    ) -> LockResult<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = self
                .semaphore
                .acquire_exclusive(key, precursor, self.options.lease)
                .await?
            {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(LockError::LockUnavailable(format!(
                    "readers of '{key}' did not drain within {timeout:?}"
                )));
            }
            debug!("readers still active, waiting");
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn wait_for_shared(&self, key: &str, timeout: Duration) -> LockResult<String> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.semaphore.acquire_shared(key, self.options.lease).await {
                Ok(token) => return Ok(token),
                Err(e) if e.is_unavailable() && Instant::now() < deadline => {
                    debug!(error = %e, "writer active, waiting");
                    tokio::time::sleep(self.options.poll_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn abandon_precursor(&self, key: &str, precursor: &str) {
        if let Err(e) = self
            .semaphore
            .release_exclusive_precursor(key, precursor)
            .await
        {
            warn!(key, error = %e, "failed to withdraw writer intent");
        }
    }

    fn spawn_keepalive(&self, key: &str, token: &str, mode: LockMode) -> Keepalive {
        let semaphore = Arc::clone(&self.semaphore);
        let key = key.to_string();
        let token = token.to_string();
        let lease = self.options.lease;

        Keepalive(tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease / 2);
            // The first tick completes immediately; the lock was just granted.
            interval.tick().await;
            loop {
                interval.tick().await;
                let refreshed = match mode {
                    LockMode::Shared => semaphore.refresh_shared_lease(&key, &token, lease).await,
                    LockMode::Exclusive => {
                        semaphore.refresh_exclusive_lease(&key, &token, lease).await
                    }
                };
                if let Err(e) = refreshed {
                    warn!(key = %key, ?mode, error = %e, "lock keepalive failed");
                    break;
                }
            }
        }))
    }
}

/// Lease refresher for a held lock. Stops when dropped, including when the
/// runner's future is dropped before the task finishes.
struct Keepalive(JoinHandle<()>);

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.0.abort();
    }
}
