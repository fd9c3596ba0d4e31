//! Error types for semaphore operations.

use thiserror::Error;

/// Errors that can occur during semaphore operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// The request cannot be satisfied right now (e.g. a shared lock was
    /// requested while a writer's precursor is outstanding). Retry later.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// Release was attempted with a token the store no longer recognizes.
    ///
    /// The holder kept the resource past its lease and the row was reaped, or
    /// the token never existed.
    #[error("failed to release lock '{key}': token is not held")]
    LockReleaseFailed {
        /// Key the release was attempted against.
        key: String,
    },

    /// A lease refresh named a stale token.
    #[error("lease not found: {0}")]
    NotFound(String),

    /// Bad key, permit count, lease or duplicate semaphore key.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend connection failed.
    #[error("connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Backend-specific error.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LockError {
    /// Returns true for [`LockError::LockReleaseFailed`].
    pub fn is_release_failed(&self) -> bool {
        matches!(self, Self::LockReleaseFailed { .. })
    }

    /// Returns true for [`LockError::LockUnavailable`].
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::LockUnavailable(_))
    }
}

/// Result type for semaphore operations.
pub type LockResult<T> = Result<T, LockError>;
