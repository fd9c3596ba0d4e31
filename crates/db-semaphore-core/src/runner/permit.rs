//! Runs work while holding one permit of a multi-permit semaphore.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, instrument};

use crate::error::LockError;
use crate::runner::progress::PermitLeaseProgress;
use crate::runner::settle;
use crate::traits::MultiPermitSemaphore;

/// Wraps work in a multi-permit acquisition.
///
/// # Example
///
/// ```rust,ignore
/// let runner = PermitRunner::new(Arc::new(provider.multi_permit_semaphore()));
/// let ran = runner
///     .run_with_permit("doi-sync", Duration::from_secs(60), 3, |progress| async move {
///         for batch in batches {
///             sync(batch).await?;
///             progress.progress_made().await?;
///         }
///         Ok::<_, MyError>(())
///     })
///     .await?;
/// if ran.is_none() {
///     // every permit was taken
/// }
/// ```
#[derive(Debug)]
pub struct PermitRunner<S> {
    semaphore: Arc<S>,
}

impl<S> Clone for PermitRunner<S> {
    fn clone(&self) -> Self {
        Self {
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

impl<S: MultiPermitSemaphore> PermitRunner<S> {
    /// Creates a runner over `semaphore`.
    pub fn new(semaphore: Arc<S>) -> Self {
        Self { semaphore }
    }

    /// Runs `task` if one of `max_permits` permits for `key` is free.
    ///
    /// Returns `Ok(None)` without running the task when none is. The task
    /// receives a progress reporter that renews the permit at its
    /// half-life. The permit is released after the task finishes, fails or
    /// panics.
    #[instrument(skip(self, task))]
    pub async fn run_with_permit<T, E, F, Fut>(
        &self,
        key: &str,
        lease: Duration,
        max_permits: u32,
        task: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(PermitLeaseProgress<S>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let Some(token) = self.semaphore.acquire(key, lease, max_permits).await? else {
            debug!("no permit available");
            return Ok(None);
        };

        let progress = PermitLeaseProgress::new(Arc::clone(&self.semaphore), key, &token, lease);
        let outcome = AssertUnwindSafe(async move { task(progress).await })
            .catch_unwind()
            .await;
        let released = self.semaphore.release(key, &token).await;

        settle(key, outcome, released).map(Some)
    }
}
