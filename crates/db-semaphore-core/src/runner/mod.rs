//! Runners that wrap work in a semaphore acquisition.
//!
//! Each runner guarantees that whatever it acquired is released after the
//! work completes, including when the work fails or panics.

pub mod gated;
pub mod permit;
pub mod progress;
pub mod reader_writer;

use tracing::warn;

use crate::error::{LockError, LockResult};

pub use gated::{FnTask, GatedRunner, GatedRunnerOptions, GatedTask, from_fn};
pub use permit::PermitRunner;
pub use progress::{CountingLeaseProgress, PermitLeaseProgress};
pub use reader_writer::{ReaderWriterRunner, RunnerOptions};

/// Error type returned by gated work.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by gated work.
pub type TaskResult = Result<(), TaskError>;

type TaskOutcome<T, E> = Result<Result<T, E>, Box<dyn std::any::Any + Send>>;

/// Combines a task's outcome with the result of releasing its lock.
///
/// A panic is resumed once the release has been attempted. A release
/// failure replaces a successful result; after a failed task it is only
/// logged, so the task's own error reaches the caller.
pub(crate) fn settle<T, E>(
    key: &str,
    outcome: TaskOutcome<T, E>,
    released: LockResult<()>,
) -> Result<T, E>
where
    E: From<LockError>,
{
    match outcome {
        Ok(Ok(value)) => {
            released?;
            Ok(value)
        }
        Ok(Err(e)) => {
            if let Err(release_error) = released {
                warn!(key, error = %release_error, "release after failed task also failed");
            }
            Err(e)
        }
        Err(panic) => {
            if let Err(release_error) = released {
                warn!(key, error = %release_error, "release after panicked task failed");
            }
            std::panic::resume_unwind(panic)
        }
    }
}
