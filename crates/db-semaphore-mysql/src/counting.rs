//! MySQL counting semaphore.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::instrument;

use db_semaphore_core::error::{LockError, LockResult};
use db_semaphore_core::key::{compose_key, validate_key};
use db_semaphore_core::lease::{MIN_LEASE, validate_lease};
use db_semaphore_core::traits::CountingSemaphore;

use crate::store::LockStore;

/// A counting semaphore bound to one key.
///
/// Permits live in `SEMAPHORE_PERMIT` under the key, or under
/// `key:extra_key` when an extra key is given, so each extra key has its own
/// pool of `max_count` permits.
#[derive(Debug)]
pub struct MySqlCountingSemaphore {
    store: LockStore,
    key: String,
    lease: Duration,
    max_count: AtomicU32,
}

impl MySqlCountingSemaphore {
    pub(crate) fn new(
        store: LockStore,
        key: impl Into<String>,
        max_count: u32,
        lease: Duration,
    ) -> LockResult<Self> {
        let key = key.into();
        validate_key(&key)?;
        validate_max_count(max_count)?;
        validate_lease(lease, MIN_LEASE)?;
        Ok(Self {
            store,
            key,
            lease,
            max_count: AtomicU32::new(max_count),
        })
    }

    /// Deletes every permit of this semaphore's key. Does not touch permits
    /// held under extra keys.
    #[instrument(skip(self), fields(key = %self.key, backend = "mysql"))]
    pub async fn release_all(&self) -> LockResult<()> {
        self.store.delete_permits(Some(&self.key)).await?;
        Ok(())
    }
}

impl CountingSemaphore for MySqlCountingSemaphore {
    fn key(&self) -> &str {
        &self.key
    }

    fn max_count(&self) -> u32 {
        self.max_count.load(Ordering::Acquire)
    }

    fn set_max_count(&self, max_count: u32) -> LockResult<()> {
        validate_max_count(max_count)?;
        self.max_count.store(max_count, Ordering::Release);
        Ok(())
    }

    fn lease(&self) -> Duration {
        self.lease
    }

    #[instrument(skip(self), fields(key = %self.key, backend = "mysql"))]
    async fn acquire(&self, extra_key: Option<&str>) -> LockResult<Option<String>> {
        let key = compose_key(&self.key, extra_key)?;
        self.store
            .acquire_permit(&key, self.lease, self.max_count(), None)
            .await
    }

    #[instrument(skip(self, token), fields(key = %self.key, backend = "mysql"))]
    async fn release(&self, token: &str, extra_key: Option<&str>) -> LockResult<()> {
        let key = compose_key(&self.key, extra_key)?;
        self.store.release_permit(&key, token).await
    }

    #[instrument(skip(self, token), fields(key = %self.key, backend = "mysql"))]
    async fn extend_lease(&self, token: &str, extra_key: Option<&str>) -> LockResult<()> {
        let key = compose_key(&self.key, extra_key)?;
        self.store.refresh_permit(&key, token, self.lease).await
    }
}

fn validate_max_count(max_count: u32) -> LockResult<()> {
    if max_count == 0 {
        return Err(LockError::InvalidConfig(
            "max count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use db_semaphore_core::retry::RetryPolicy;
    use sqlx::mysql::MySqlPoolOptions;

    fn lazy_store() -> LockStore {
        let pool = MySqlPoolOptions::new()
            .connect_lazy("mysql://root@localhost/locks")
            .unwrap();
        LockStore::new(pool, RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_rejects_zero_max_count() {
        let err = MySqlCountingSemaphore::new(lazy_store(), "jobs", 0, Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_rejects_short_lease() {
        let err = MySqlCountingSemaphore::new(lazy_store(), "jobs", 2, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_rejects_unbounded_lease() {
        let err = MySqlCountingSemaphore::new(lazy_store(), "jobs", 2, Duration::MAX).unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_rejects_blank_key() {
        assert!(MySqlCountingSemaphore::new(lazy_store(), " ", 2, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_set_max_count() {
        let semaphore =
            MySqlCountingSemaphore::new(lazy_store(), "jobs", 2, Duration::from_secs(10)).unwrap();
        semaphore.set_max_count(5).unwrap();
        assert_eq!(semaphore.max_count(), 5);
        assert!(semaphore.set_max_count(0).is_err());
        assert_eq!(semaphore.max_count(), 5);
    }

    #[tokio::test]
    async fn test_overlong_extra_key_fails_before_store() {
        let key = "k".repeat(95);
        let semaphore =
            MySqlCountingSemaphore::new(lazy_store(), key, 1, Duration::from_secs(10)).unwrap();
        let err = semaphore.acquire(Some("stack-42")).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig(_)));
    }
}
