//! MySQL reader-writer semaphore.
//!
//! Shared locks live in `RW_SHARED_LOCK`, writer intent in
//! `RW_WRITE_PRECURSOR` and the exclusive lock in `RW_EXCLUSIVE_LOCK`. All
//! admission decisions for a key are taken under its master row lock.
//!
//! A writer's precursor turns new readers away. Readers admitted before it
//! keep their locks until they release or expire; only then may the writer
//! take the exclusive lock. The precursor has its own lease, which bounds
//! how long an absent writer can starve readers.

use std::time::Duration;

use sqlx::{MySql, Transaction};
use tracing::{debug, instrument};

use db_semaphore_core::error::{LockError, LockResult};
use db_semaphore_core::key::validate_key;
use db_semaphore_core::lease::{MIN_LEASE, lease_micros, validate_lease};
use db_semaphore_core::traits::ReaderWriterSemaphore;

use crate::error::from_sqlx;
use crate::store::{LockStore, new_token};

/// Default lease of a writer's precursor.
pub const DEFAULT_PRECURSOR_LEASE: Duration = Duration::from_secs(30);

/// Reader-writer semaphore over the store.
#[derive(Debug, Clone)]
pub struct MySqlReaderWriterSemaphore {
    store: LockStore,
    precursor_lease: Duration,
}

impl MySqlReaderWriterSemaphore {
    pub(crate) fn new(store: LockStore, precursor_lease: Duration) -> Self {
        Self {
            store,
            precursor_lease,
        }
    }

    /// Lease granted to each precursor.
    pub fn precursor_lease(&self) -> Duration {
        self.precursor_lease
    }

    /// Deletes every shared lock, precursor and exclusive lock of every key.
    #[instrument(skip(self), fields(backend = "mysql"))]
    pub async fn release_all(&self) -> LockResult<()> {
        let mut tx = self.store.pool().begin().await.map_err(from_sqlx)?;
        for statement in [
            "DELETE FROM RW_SHARED_LOCK",
            "DELETE FROM RW_EXCLUSIVE_LOCK",
            "DELETE FROM RW_WRITE_PRECURSOR",
        ] {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(from_sqlx)?;
        }
        tx.commit().await.map_err(from_sqlx)?;
        Ok(())
    }

    async fn try_acquire_shared(&self, key: &str, lease: Duration) -> LockResult<String> {
        let mut tx = self.store.begin_locked(key).await?;

        sqlx::query("DELETE FROM RW_SHARED_LOCK WHERE LOCK_KEY = ? AND EXPIRES_ON <= NOW(6)")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;

        if writer_present(&mut tx, key).await? {
            tx.rollback().await.map_err(from_sqlx)?;
            return Err(LockError::LockUnavailable(format!(
                "a writer holds or awaits '{key}'"
            )));
        }

        let token = new_token();
        sqlx::query(
            "INSERT INTO RW_SHARED_LOCK (LOCK_KEY, TOKEN, EXPIRES_ON) \
             VALUES (?, ?, TIMESTAMPADD(MICROSECOND, ?, NOW(6)))",
        )
        .bind(key)
        .bind(&token)
        .bind(lease_micros(lease))
        .execute(&mut *tx)
        .await
        .map_err(from_sqlx)?;

        tx.commit().await.map_err(from_sqlx)?;
        Ok(token)
    }

    async fn try_acquire_precursor(&self, key: &str) -> LockResult<String> {
        let mut tx = self.store.begin_locked(key).await?;

        for statement in [
            "DELETE FROM RW_WRITE_PRECURSOR WHERE LOCK_KEY = ? AND EXPIRES_ON <= NOW(6)",
            "DELETE FROM RW_EXCLUSIVE_LOCK WHERE LOCK_KEY = ? AND EXPIRES_ON <= NOW(6)",
        ] {
            sqlx::query(statement)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(from_sqlx)?;
        }

        if writer_present(&mut tx, key).await? {
            tx.rollback().await.map_err(from_sqlx)?;
            return Err(LockError::LockUnavailable(format!(
                "another writer holds or awaits '{key}'"
            )));
        }

        let token = new_token();
        sqlx::query(
            "INSERT INTO RW_WRITE_PRECURSOR (LOCK_KEY, TOKEN, EXPIRES_ON) \
             VALUES (?, ?, TIMESTAMPADD(MICROSECOND, ?, NOW(6)))",
        )
        .bind(key)
        .bind(&token)
        .bind(lease_micros(self.precursor_lease))
        .execute(&mut *tx)
        .await
        .map_err(from_sqlx)?;

        tx.commit().await.map_err(from_sqlx)?;
        Ok(token)
    }

    async fn try_acquire_exclusive(
        &self,
        key: &str,
        precursor_token: &str,
        lease: Duration,
    ) -> LockResult<Option<String>> {
        let mut tx = self.store.begin_locked(key).await?;

        let precursor_held = count(
            &mut tx,
            "SELECT COUNT(*) FROM RW_WRITE_PRECURSOR \
             WHERE LOCK_KEY = ? AND TOKEN = ? AND EXPIRES_ON > NOW(6)",
            key,
            Some(precursor_token),
        )
        .await?;
        if precursor_held == 0 {
            tx.rollback().await.map_err(from_sqlx)?;
            return Err(LockError::LockUnavailable(format!(
                "writer intent on '{key}' is not held"
            )));
        }

        sqlx::query("DELETE FROM RW_SHARED_LOCK WHERE LOCK_KEY = ? AND EXPIRES_ON <= NOW(6)")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        let readers = count(
            &mut tx,
            "SELECT COUNT(*) FROM RW_SHARED_LOCK WHERE LOCK_KEY = ? AND EXPIRES_ON > NOW(6)",
            key,
            None,
        )
        .await?;
        if readers > 0 {
            tx.rollback().await.map_err(from_sqlx)?;
            debug!(readers, "readers still draining");
            return Ok(None);
        }

        sqlx::query("DELETE FROM RW_EXCLUSIVE_LOCK WHERE LOCK_KEY = ? AND EXPIRES_ON <= NOW(6)")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        let writers = count(
            &mut tx,
            "SELECT COUNT(*) FROM RW_EXCLUSIVE_LOCK WHERE LOCK_KEY = ?",
            key,
            None,
        )
        .await?;
        if writers > 0 {
            tx.rollback().await.map_err(from_sqlx)?;
            return Err(LockError::LockUnavailable(format!(
                "exclusive lock on '{key}' is already held"
            )));
        }

        let token = new_token();
        sqlx::query(
            "INSERT INTO RW_EXCLUSIVE_LOCK (LOCK_KEY, TOKEN, PRECURSOR_TOKEN, EXPIRES_ON) \
             VALUES (?, ?, ?, TIMESTAMPADD(MICROSECOND, ?, NOW(6)))",
        )
        .bind(key)
        .bind(&token)
        .bind(precursor_token)
        .bind(lease_micros(lease))
        .execute(&mut *tx)
        .await
        .map_err(from_sqlx)?;

        tx.commit().await.map_err(from_sqlx)?;
        Ok(Some(token))
    }

    async fn refresh(
        &self,
        table: RwTable,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> LockResult<()> {
        validate_key(key)?;
        validate_lease(lease, MIN_LEASE)?;
        let statement = match table {
            RwTable::Shared => {
                "UPDATE RW_SHARED_LOCK SET EXPIRES_ON = TIMESTAMPADD(MICROSECOND, ?, NOW(6)) \
                 WHERE LOCK_KEY = ? AND TOKEN = ? AND EXPIRES_ON > NOW(6)"
            }
            RwTable::Exclusive => {
                "UPDATE RW_EXCLUSIVE_LOCK SET EXPIRES_ON = TIMESTAMPADD(MICROSECOND, ?, NOW(6)) \
                 WHERE LOCK_KEY = ? AND TOKEN = ? AND EXPIRES_ON > NOW(6)"
            }
        };
        let result = sqlx::query(statement)
            .bind(lease_micros(lease))
            .bind(key)
            .bind(token)
            .execute(self.store.pool())
            .await
            .map_err(from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(LockError::NotFound(format!(
                "no live {table} lock on '{key}' with the given token"
            )));
        }
        Ok(())
    }

    async fn delete_by_token(&self, statement: &str, key: &str, token: &str) -> LockResult<()> {
        validate_key(key)?;
        let result = sqlx::query(statement)
            .bind(key)
            .bind(token)
            .execute(self.store.pool())
            .await
            .map_err(from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(LockError::LockReleaseFailed {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum RwTable {
    Shared,
    Exclusive,
}

impl std::fmt::Display for RwTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RwTable::Shared => f.write_str("shared"),
            RwTable::Exclusive => f.write_str("exclusive"),
        }
    }
}

impl ReaderWriterSemaphore for MySqlReaderWriterSemaphore {
    #[instrument(skip(self), fields(backend = "mysql"))]
    async fn acquire_shared(&self, key: &str, lease: Duration) -> LockResult<String> {
        validate_key(key)?;
        validate_lease(lease, MIN_LEASE)?;
        self.store
            .with_retry(|| self.try_acquire_shared(key, lease))
            .await?
            .ok_or_else(|| contention(key))
    }

    #[instrument(skip(self, token), fields(backend = "mysql"))]
    async fn release_shared(&self, key: &str, token: &str) -> LockResult<()> {
        self.delete_by_token(
            "DELETE FROM RW_SHARED_LOCK WHERE LOCK_KEY = ? AND TOKEN = ?",
            key,
            token,
        )
        .await
    }

    async fn refresh_shared_lease(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> LockResult<()> {
        self.refresh(RwTable::Shared, key, token, lease).await
    }

    #[instrument(skip(self), fields(backend = "mysql"))]
    async fn acquire_exclusive_precursor(&self, key: &str) -> LockResult<String> {
        validate_key(key)?;
        self.store
            .with_retry(|| self.try_acquire_precursor(key))
            .await?
            .ok_or_else(|| contention(key))
    }

    #[instrument(skip(self, precursor_token), fields(backend = "mysql"))]
    async fn release_exclusive_precursor(
        &self,
        key: &str,
        precursor_token: &str,
    ) -> LockResult<()> {
        self.delete_by_token(
            "DELETE FROM RW_WRITE_PRECURSOR WHERE LOCK_KEY = ? AND TOKEN = ?",
            key,
            precursor_token,
        )
        .await
    }

    #[instrument(skip(self, precursor_token), fields(backend = "mysql"))]
    async fn acquire_exclusive(
        &self,
        key: &str,
        precursor_token: &str,
        lease: Duration,
    ) -> LockResult<Option<String>> {
        validate_key(key)?;
        validate_lease(lease, MIN_LEASE)?;
        Ok(self
            .store
            .with_retry(|| self.try_acquire_exclusive(key, precursor_token, lease))
            .await?
            .flatten())
    }

    async fn refresh_exclusive_lease(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> LockResult<()> {
        self.refresh(RwTable::Exclusive, key, token, lease).await
    }

    #[instrument(skip(self, token), fields(backend = "mysql"))]
    async fn release_exclusive(&self, key: &str, token: &str) -> LockResult<()> {
        validate_key(key)?;
        let mut tx = self.store.pool().begin().await.map_err(from_sqlx)?;

        let precursor: Option<String> = sqlx::query_scalar(
            "SELECT PRECURSOR_TOKEN FROM RW_EXCLUSIVE_LOCK \
             WHERE LOCK_KEY = ? AND TOKEN = ? FOR UPDATE",
        )
        .bind(key)
        .bind(token)
        .fetch_optional(&mut *tx)
        .await
        .map_err(from_sqlx)?;
        let Some(precursor) = precursor else {
            tx.rollback().await.map_err(from_sqlx)?;
            return Err(LockError::LockReleaseFailed {
                key: key.to_string(),
            });
        };

        sqlx::query("DELETE FROM RW_EXCLUSIVE_LOCK WHERE LOCK_KEY = ? AND TOKEN = ?")
            .bind(key)
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        sqlx::query("DELETE FROM RW_WRITE_PRECURSOR WHERE LOCK_KEY = ? AND TOKEN = ?")
            .bind(key)
            .bind(&precursor)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;

        tx.commit().await.map_err(from_sqlx)?;
        Ok(())
    }
}

/// Whether a live precursor or live exclusive lock exists for `key`.
async fn writer_present(tx: &mut Transaction<'static, MySql>, key: &str) -> LockResult<bool> {
    let precursors = count(
        tx,
        "SELECT COUNT(*) FROM RW_WRITE_PRECURSOR WHERE LOCK_KEY = ? AND EXPIRES_ON > NOW(6)",
        key,
        None,
    )
    .await?;
    if precursors > 0 {
        return Ok(true);
    }
    let writers = count(
        tx,
        "SELECT COUNT(*) FROM RW_EXCLUSIVE_LOCK WHERE LOCK_KEY = ? AND EXPIRES_ON > NOW(6)",
        key,
        None,
    )
    .await?;
    Ok(writers > 0)
}

async fn count(
    tx: &mut Transaction<'static, MySql>,
    statement: &str,
    key: &str,
    token: Option<&str>,
) -> LockResult<i64> {
    let mut query = sqlx::query_scalar(statement).bind(key);
    if let Some(token) = token {
        query = query.bind(token);
    }
    query.fetch_one(&mut **tx).await.map_err(from_sqlx)
}

fn contention(key: &str) -> LockError {
    LockError::LockUnavailable(format!("gave up on '{key}' after repeated contention"))
}
