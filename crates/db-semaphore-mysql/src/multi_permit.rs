//! MySQL multi-permit semaphore.

use std::time::Duration;

use tracing::{info, instrument};

use db_semaphore_core::error::{LockError, LockResult};
use db_semaphore_core::key::{validate_context, validate_key};
use db_semaphore_core::lease::{MIN_LEASE, validate_lease};
use db_semaphore_core::traits::MultiPermitSemaphore;

use crate::store::LockStore;

/// A semaphore whose key, capacity and lease are chosen per call.
///
/// Shares `SEMAPHORE_PERMIT` with [`MySqlCountingSemaphore`]; the key is
/// the only namespace. Every operation runs in a transaction of its own on
/// a pooled connection and commits before returning.
///
/// [`MySqlCountingSemaphore`]: crate::MySqlCountingSemaphore
#[derive(Debug, Clone)]
pub struct MySqlMultiPermitSemaphore {
    store: LockStore,
}

impl MySqlMultiPermitSemaphore {
    pub(crate) fn new(store: LockStore) -> Self {
        Self { store }
    }

    /// Context recorded with the live permit for `key` that expires first.
    pub async fn first_unexpired_context(&self, key: &str) -> LockResult<Option<String>> {
        validate_key(key)?;
        self.store.first_unexpired_context(key).await
    }

    /// Deletes expired permits of every key. Returns how many were deleted.
    #[instrument(skip(self), fields(backend = "mysql"))]
    pub async fn run_garbage_collection(&self) -> LockResult<u64> {
        let deleted = self.store.delete_expired_permits().await?;
        if deleted > 0 {
            info!(deleted, "expired permits collected");
        }
        Ok(deleted)
    }

    /// Number of permit rows, expired or not.
    pub async fn permit_row_count(&self) -> LockResult<u64> {
        self.store.permit_row_count().await
    }

    /// Deletes every permit of every key.
    #[instrument(skip(self), fields(backend = "mysql"))]
    pub async fn release_all(&self) -> LockResult<()> {
        self.store.delete_permits(None).await?;
        Ok(())
    }
}

impl MultiPermitSemaphore for MySqlMultiPermitSemaphore {
    #[instrument(skip(self, context), fields(backend = "mysql"))]
    async fn acquire_with_context(
        &self,
        key: &str,
        lease: Duration,
        max_permits: u32,
        context: Option<&str>,
    ) -> LockResult<Option<String>> {
        validate_request(key, lease)?;
        if max_permits == 0 {
            return Err(LockError::InvalidConfig(
                "max permits must be at least 1".to_string(),
            ));
        }
        if let Some(context) = context {
            validate_context(context)?;
        }
        self.store
            .acquire_permit(key, lease, max_permits, context)
            .await
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<()> {
        validate_key(key)?;
        self.store.release_permit(key, token).await
    }

    async fn refresh_lease(&self, key: &str, token: &str, lease: Duration) -> LockResult<()> {
        validate_request(key, lease)?;
        self.store.refresh_permit(key, token, lease).await
    }
}

fn validate_request(key: &str, lease: Duration) -> LockResult<()> {
    validate_key(key)?;
    validate_lease(lease, MIN_LEASE)
}
