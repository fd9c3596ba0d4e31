//! Core traits for database-backed semaphores.
//!
//! Every acquisition here is non-blocking: it either grants immediately or
//! reports that nothing was granted. Waiting belongs to the runners in
//! [`crate::runner`].

use std::future::Future;
use std::time::Duration;

use crate::error::LockResult;

// ============================================================================
// Counting Semaphore
// ============================================================================

/// A fixed-capacity, lease-based semaphore bound to one key.
///
/// Up to [`max_count`](Self::max_count) permits may be live for the key at
/// once. A permit that is not released expires after
/// [`lease`](Self::lease) and is reclaimed by the next acquisition attempt.
///
/// # Example
///
/// ```rust,ignore
/// if let Some(token) = semaphore.acquire(None).await? {
///     do_bounded_work().await;
///     semaphore.release(&token, None).await?;
/// }
/// ```
pub trait CountingSemaphore: Send + Sync {
    /// The key this semaphore guards.
    fn key(&self) -> &str;

    /// Current capacity.
    fn max_count(&self) -> u32;

    /// Reconfigures the capacity. Rejects zero.
    fn set_max_count(&self, max_count: u32) -> LockResult<()>;

    /// Lease granted to each permit.
    fn lease(&self) -> Duration;

    /// Attempts to take a permit for the key, optionally qualified by
    /// `extra_key`.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(token))` - Permit granted
    /// * `Ok(None)` - At capacity, or contention outlasted the retry budget
    /// * `Err(...)` - Store failure
    fn acquire(
        &self,
        extra_key: Option<&str>,
    ) -> impl Future<Output = LockResult<Option<String>>> + Send;

    /// Releases a permit.
    ///
    /// Fails with [`LockError::LockReleaseFailed`](crate::LockError::LockReleaseFailed)
    /// when the token is no longer held.
    fn release(
        &self,
        token: &str,
        extra_key: Option<&str>,
    ) -> impl Future<Output = LockResult<()>> + Send;

    /// Restarts a held permit's lease.
    ///
    /// Fails with [`LockError::NotFound`](crate::LockError::NotFound) when
    /// the token has expired or was released.
    fn extend_lease(
        &self,
        token: &str,
        extra_key: Option<&str>,
    ) -> impl Future<Output = LockResult<()>> + Send;
}

// ============================================================================
// Simple Mutex
// ============================================================================

/// A single-holder, lease-based lock per key.
pub trait SimpleMutex: Send + Sync {
    /// Attempts to take the lock for `key`. `Ok(None)` when it is held or a
    /// concurrent caller won the race to create it.
    fn acquire(
        &self,
        key: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<Option<String>>> + Send;

    /// Releases the lock if `token` still holds it. Returns whether it did.
    fn release(&self, key: &str, token: &str) -> impl Future<Output = LockResult<bool>> + Send;

    /// Clears every lock. Administrative reset.
    fn force_release_all(&self) -> impl Future<Output = LockResult<()>> + Send;
}

// ============================================================================
// Multi-Permit Semaphore
// ============================================================================

/// A semaphore whose key, capacity and lease are chosen per call.
///
/// Each operation runs in its own transaction and commits before returning,
/// so competitors see its effect immediately.
pub trait MultiPermitSemaphore: Send + Sync {
    /// Attempts to take one of `max_permits` permits for `key`.
    fn acquire(
        &self,
        key: &str,
        lease: Duration,
        max_permits: u32,
    ) -> impl Future<Output = LockResult<Option<String>>> + Send {
        self.acquire_with_context(key, lease, max_permits, None)
    }

    /// Like [`acquire`](Self::acquire), recording a description of the
    /// holder alongside the permit.
    fn acquire_with_context(
        &self,
        key: &str,
        lease: Duration,
        max_permits: u32,
        context: Option<&str>,
    ) -> impl Future<Output = LockResult<Option<String>>> + Send;

    /// Releases a permit. Fails with `LockReleaseFailed` if it is gone.
    fn release(&self, key: &str, token: &str) -> impl Future<Output = LockResult<()>> + Send;

    /// Restarts a held permit's lease with `lease`. Fails with `NotFound`
    /// if the permit is gone.
    fn refresh_lease(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<()>> + Send;
}

// ============================================================================
// Reader-Writer Semaphore
// ============================================================================

/// Shared (reader) locks plus an exclusive (writer) lock per key.
///
/// A writer first declares intent with a precursor token. From that moment
/// new readers are turned away while admitted readers drain; once none
/// remain the writer may take the exclusive lock.
///
/// ```rust,ignore
/// let precursor = rw.acquire_exclusive_precursor("table-7").await?;
/// let token = loop {
///     if let Some(token) = rw.acquire_exclusive("table-7", &precursor, lease).await? {
///         break token;
///     }
///     tokio::time::sleep(poll).await;
/// };
/// rebuild_table().await;
/// rw.release_exclusive("table-7", &token).await?;
/// ```
pub trait ReaderWriterSemaphore: Send + Sync {
    /// Takes a shared lock. Fails with `LockUnavailable` while a precursor
    /// or exclusive lock is outstanding.
    fn acquire_shared(
        &self,
        key: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<String>> + Send;

    /// Releases a shared lock.
    fn release_shared(&self, key: &str, token: &str)
    -> impl Future<Output = LockResult<()>> + Send;

    /// Restarts a shared lock's lease.
    fn refresh_shared_lease(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<()>> + Send;

    /// Declares writer intent. Fails with `LockUnavailable` while another
    /// precursor or an exclusive lock is outstanding.
    fn acquire_exclusive_precursor(
        &self,
        key: &str,
    ) -> impl Future<Output = LockResult<String>> + Send;

    /// Withdraws writer intent without ever taking the exclusive lock.
    fn release_exclusive_precursor(
        &self,
        key: &str,
        precursor_token: &str,
    ) -> impl Future<Output = LockResult<()>> + Send;

    /// Takes the exclusive lock under `precursor_token`.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(token))` - Exclusive lock granted
    /// * `Ok(None)` - Readers are still draining
    /// * `Err(LockUnavailable)` - The precursor is not held (expired or never
    ///   granted)
    fn acquire_exclusive(
        &self,
        key: &str,
        precursor_token: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<Option<String>>> + Send;

    /// Restarts the exclusive lock's lease.
    fn refresh_exclusive_lease(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> impl Future<Output = LockResult<()>> + Send;

    /// Releases the exclusive lock and the precursor it was granted under.
    fn release_exclusive(
        &self,
        key: &str,
        token: &str,
    ) -> impl Future<Output = LockResult<()>> + Send;
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Lets long-running work signal that it is still alive.
///
/// Implementations renew the lease backing the work when enough of it has
/// elapsed.
pub trait ProgressReporter: Send + Sync {
    /// Reports progress.
    fn progress_made(&self) -> impl Future<Output = LockResult<()>> + Send;
}
