//! Gated runner: caps how many machines run a named task at once.
//!
//! Every machine schedules [`GatedRunner::attempt_to_run`] on its own timer.
//! An attempt runs the task only if a permit of the runner's counting
//! semaphore is free; otherwise it returns immediately and the next tick
//! tries again.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use futures::FutureExt;
use tracing::{debug, error, instrument, warn};

use crate::error::{LockError, LockResult};
use crate::key::compose_key;
use crate::lease::{MIN_GATED_LEASE, validate_lease};
use crate::registry::{KeyRegistration, SemaphoreKeyRegistry};
use crate::runner::TaskResult;
use crate::runner::progress::CountingLeaseProgress;
use crate::traits::{CountingSemaphore, ProgressReporter};

/// Work run under a gated runner's permit.
///
/// Long-running work should call
/// [`progress_made`](ProgressReporter::progress_made) periodically so the
/// permit outlives its initial lease.
pub trait GatedTask: Send + Sync {
    /// Runs the work once.
    fn run<P: ProgressReporter>(&self, progress: &P) -> impl Future<Output = TaskResult> + Send;
}

/// Adapts a closure that does not report progress into a [`GatedTask`].
#[derive(Debug, Clone)]
pub struct FnTask<F>(F);

/// Wraps `f` as a [`GatedTask`].
pub fn from_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send,
{
    FnTask(f)
}

impl<F, Fut> GatedTask for FnTask<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send,
{
    fn run<P: ProgressReporter>(&self, _progress: &P) -> impl Future<Output = TaskResult> + Send {
        (self.0)()
    }
}

/// Gated runner configuration.
#[derive(Debug, Clone)]
pub struct GatedRunnerOptions {
    /// Qualifies the semaphore key so each shard has its own permit pool.
    pub shard: Option<String>,
    /// Machines allowed to run concurrently. Below one disables the runner.
    pub max_runners: i32,
}

impl Default for GatedRunnerOptions {
    fn default() -> Self {
        Self {
            shard: None,
            max_runners: 1,
        }
    }
}

/// Runs a task on at most `max_runners` machines at once.
pub struct GatedRunner<S, T> {
    semaphore: Arc<S>,
    task: T,
    shard: Option<String>,
    max_runners: AtomicI32,
    registration: KeyRegistration,
}

impl<S, T> GatedRunner<S, T>
where
    S: CountingSemaphore,
    T: GatedTask,
{
    /// Creates a runner, claiming the semaphore's key in `registry`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the key is already claimed, the
    /// shard-qualified key is too long, or the semaphore's lease is shorter
    /// than [`MIN_GATED_LEASE`].
    pub fn new(
        semaphore: Arc<S>,
        registry: &SemaphoreKeyRegistry,
        options: GatedRunnerOptions,
        task: T,
    ) -> LockResult<Self> {
        validate_lease(semaphore.lease(), MIN_GATED_LEASE)?;
        compose_key(semaphore.key(), options.shard.as_deref())?;
        let registration = registry.register(semaphore.key())?;

        Ok(Self {
            semaphore,
            task,
            shard: options.shard,
            max_runners: AtomicI32::new(options.max_runners),
            registration,
        })
    }

    /// The semaphore key this runner claimed.
    pub fn key(&self) -> &str {
        self.registration.key()
    }

    /// Current runner cap.
    pub fn max_runners(&self) -> i32 {
        self.max_runners.load(Ordering::Acquire)
    }

    /// Changes the runner cap. Takes effect on the next attempt.
    pub fn set_max_runners(&self, max_runners: i32) {
        self.max_runners.store(max_runners, Ordering::Release);
    }

    /// Whether attempts may run the task at all.
    pub fn is_enabled(&self) -> bool {
        self.max_runners() >= 1
    }

    /// Runs the task if a permit is free.
    ///
    /// Never fails: task and store failures are logged. A panic in the task
    /// is resumed after the permit is released.
    #[instrument(skip(self), fields(key = %self.registration.key(), shard = ?self.shard))]
    pub async fn attempt_to_run(&self) {
        let max_runners = self.max_runners();
        if max_runners < 1 {
            debug!(max_runners, "runner disabled");
            return;
        }

        let max_count = max_runners.unsigned_abs();
        if self.semaphore.max_count() != max_count
            && let Err(e) = self.semaphore.set_max_count(max_count)
        {
            error!(error = %e, "failed to apply runner cap");
            return;
        }

        let extra_key = self.shard.as_deref();
        let token = match self.semaphore.acquire(extra_key).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("no permit available");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to acquire permit");
                return;
            }
        };

        let progress = CountingLeaseProgress::new(&*self.semaphore, &token, extra_key);
        let outcome = AssertUnwindSafe(self.task.run(&progress))
            .catch_unwind()
            .await;

        match self.semaphore.release(&token, extra_key).await {
            Ok(()) => {}
            Err(e @ LockError::LockReleaseFailed { .. }) => {
                warn!(error = %e, "permit expired before release");
            }
            Err(e) => error!(error = %e, "failed to release permit"),
        }

        match outcome {
            Ok(Ok(())) => debug!("task completed"),
            Ok(Err(e)) => error!(error = %e, "gated task failed"),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl<S, T> std::fmt::Debug for GatedRunner<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatedRunner")
            .field("key", &self.registration.key())
            .field("shard", &self.shard)
            .field("max_runners", &self.max_runners.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
