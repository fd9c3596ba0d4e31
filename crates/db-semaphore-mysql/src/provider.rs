//! MySQL semaphore provider.

use std::time::Duration;

use db_semaphore_core::error::{LockError, LockResult};
use db_semaphore_core::lease::{MIN_LEASE, validate_lease};
use db_semaphore_core::retry::RetryPolicy;

use crate::connection::MySqlConnection;
use crate::counting::MySqlCountingSemaphore;
use crate::multi_permit::MySqlMultiPermitSemaphore;
use crate::mutex::MySqlSimpleMutex;
use crate::rw_semaphore::{DEFAULT_PRECURSOR_LEASE, MySqlReaderWriterSemaphore};
use crate::store::LockStore;

/// Default size of a pool created from a connection string.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Builder for MySQL semaphore provider configuration.
#[derive(Debug)]
pub struct MySqlSemaphoreProviderBuilder {
    connection: Option<MySqlConnection>,
    retry_policy: RetryPolicy,
    precursor_lease: Duration,
    max_connections: u32,
    create_schema: bool,
}

impl MySqlSemaphoreProviderBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self {
            connection: None,
            retry_policy: RetryPolicy::default(),
            precursor_lease: DEFAULT_PRECURSOR_LEASE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            create_schema: true,
        }
    }

    /// Sets the MySQL connection string.
    pub fn connection_string(mut self, conn_str: impl Into<String>) -> Self {
        self.connection = Some(MySqlConnection::ConnectionString(conn_str.into()));
        self
    }

    /// Sets an existing connection pool.
    ///
    /// The pool's sessions should run at `READ COMMITTED`; pools built from
    /// a connection string are configured that way automatically.
    pub fn pool(mut self, pool: sqlx::MySqlPool) -> Self {
        self.connection = Some(MySqlConnection::Pool(pool));
        self
    }

    /// Sets how critical sections retry deadlocks and lock-wait timeouts.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the lease of a writer's precursor, which bounds how long a
    /// writer that never completes can keep readers out.
    pub fn precursor_lease(mut self, lease: Duration) -> Self {
        self.precursor_lease = lease;
        self
    }

    /// Sets the size of a pool created from a connection string.
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Whether `build` creates missing tables. Defaults to true.
    pub fn create_schema(mut self, create_schema: bool) -> Self {
        self.create_schema = create_schema;
        self
    }

    /// Builds the provider.
    pub async fn build(self) -> LockResult<MySqlSemaphoreProvider> {
        let connection = self
            .connection
            .ok_or_else(|| LockError::InvalidConfig("connection not specified".to_string()))?;
        validate_lease(self.precursor_lease, MIN_LEASE)?;
        if self.max_connections == 0 {
            return Err(LockError::InvalidConfig(
                "max connections must be at least 1".to_string(),
            ));
        }

        let pool = connection
            .get_pool(self.max_connections)
            .await
            .map_err(|e| LockError::Connection(Box::new(e)))?;

        let store = LockStore::new(pool, self.retry_policy);
        if self.create_schema {
            store.ensure_schema().await?;
        }

        Ok(MySqlSemaphoreProvider {
            store,
            precursor_lease: self.precursor_lease,
        })
    }
}

impl Default for MySqlSemaphoreProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider for MySQL-backed semaphores.
///
/// Every primitive it creates shares the provider's pool.
#[derive(Debug, Clone)]
pub struct MySqlSemaphoreProvider {
    store: LockStore,
    precursor_lease: Duration,
}

impl MySqlSemaphoreProvider {
    /// Returns a new builder for configuring the provider.
    pub fn builder() -> MySqlSemaphoreProviderBuilder {
        MySqlSemaphoreProviderBuilder::new()
    }

    /// Creates a provider using the specified connection string.
    pub async fn new(connection_string: impl Into<String>) -> LockResult<Self> {
        Self::builder()
            .connection_string(connection_string)
            .build()
            .await
    }

    /// The store behind every primitive.
    pub fn store(&self) -> &LockStore {
        &self.store
    }

    /// Creates a counting semaphore for `key`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a blank or overlong key, a zero
    /// `max_count`, or a lease below [`MIN_LEASE`].
    pub fn counting_semaphore(
        &self,
        key: impl Into<String>,
        max_count: u32,
        lease: Duration,
    ) -> LockResult<MySqlCountingSemaphore> {
        MySqlCountingSemaphore::new(self.store.clone(), key, max_count, lease)
    }

    /// Creates a simple mutex.
    pub fn simple_mutex(&self) -> MySqlSimpleMutex {
        MySqlSimpleMutex::new(self.store.clone())
    }

    /// Creates a multi-permit semaphore.
    pub fn multi_permit_semaphore(&self) -> MySqlMultiPermitSemaphore {
        MySqlMultiPermitSemaphore::new(self.store.clone())
    }

    /// Creates a reader-writer semaphore.
    pub fn reader_writer_semaphore(&self) -> MySqlReaderWriterSemaphore {
        MySqlReaderWriterSemaphore::new(self.store.clone(), self.precursor_lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db_semaphore_core::traits::CountingSemaphore;
    use sqlx::mysql::MySqlPoolOptions;

    fn lazy_pool() -> sqlx::MySqlPool {
        MySqlPoolOptions::new()
            .connect_lazy("mysql://root@localhost/locks")
            .unwrap()
    }

    async fn lazy_provider() -> MySqlSemaphoreProvider {
        MySqlSemaphoreProvider::builder()
            .pool(lazy_pool())
            .create_schema(false)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_requires_connection() {
        let err = MySqlSemaphoreProvider::builder().build().await.unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_short_precursor_lease() {
        let err = MySqlSemaphoreProvider::builder()
            .pool(lazy_pool())
            .create_schema(false)
            .precursor_lease(Duration::from_millis(10))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_precursor_lease_reaches_semaphore() {
        let provider = MySqlSemaphoreProvider::builder()
            .pool(lazy_pool())
            .create_schema(false)
            .precursor_lease(Duration::from_secs(5))
            .build()
            .await
            .unwrap();
        assert_eq!(
            provider.reader_writer_semaphore().precursor_lease(),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_counting_semaphore_validation() {
        let provider = lazy_provider().await;
        let semaphore = provider
            .counting_semaphore("nightly-backup", 3, Duration::from_secs(30))
            .unwrap();
        assert_eq!(semaphore.key(), "nightly-backup");
        assert_eq!(semaphore.max_count(), 3);

        assert!(
            provider
                .counting_semaphore("k".repeat(101), 3, Duration::from_secs(30))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_retry_policy_reaches_store() {
        let provider = MySqlSemaphoreProvider::builder()
            .pool(lazy_pool())
            .create_schema(false)
            .retry_policy(RetryPolicy::NO_RETRY)
            .build()
            .await
            .unwrap();
        assert_eq!(*provider.store().retry_policy(), RetryPolicy::NO_RETRY);
    }
}
