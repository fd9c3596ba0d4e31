//! Convenience prelude for semaphore types.

pub use crate::error::{LockError, LockResult};
pub use crate::lease::{HalfLifeRenewal, MAX_LEASE, MIN_GATED_LEASE, MIN_LEASE};
pub use crate::registry::{KeyRegistration, SemaphoreKeyRegistry};
pub use crate::retry::RetryPolicy;
pub use crate::runner::{
    GatedRunner, GatedRunnerOptions, GatedTask, PermitRunner, ReaderWriterRunner, RunnerOptions,
    TaskError, TaskResult,
};
pub use crate::traits::{
    CountingSemaphore, MultiPermitSemaphore, ProgressReporter, ReaderWriterSemaphore,
    SimpleMutex,
};
