//! The coordination substrate shared by every primitive.
//!
//! A key's master row in `SEMAPHORE_MASTER` exists only to be locked with
//! `SELECT ... FOR UPDATE`. Every check-then-act sequence on a key's
//! permit rows runs while that lock is held, which serializes competitors
//! for the key across all processes. Master rows are created on first use
//! and never deleted.

use std::future::Future;
use std::time::Duration;

use sqlx::{MySql, MySqlPool, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use db_semaphore_core::error::{LockError, LockResult};
use db_semaphore_core::lease::lease_micros;
use db_semaphore_core::retry::RetryPolicy;

use crate::error::{from_sqlx, is_transient};
use crate::schema;

/// Handle to the semaphore tables behind one pool.
#[derive(Debug, Clone)]
pub struct LockStore {
    pool: MySqlPool,
    retry_policy: RetryPolicy,
}

impl LockStore {
    /// Creates a store over `pool`.
    pub fn new(pool: MySqlPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Retry bounds for critical sections.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Creates any missing table.
    pub async fn ensure_schema(&self) -> LockResult<()> {
        schema::create_tables(&self.pool).await
    }

    /// Runs `op` under the store's retry policy.
    ///
    /// `Ok(None)` means every attempt hit transient contention.
    pub(crate) async fn with_retry<T, F, Fut>(&self, op: F) -> LockResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LockResult<T>>,
    {
        self.retry_policy.run(is_transient, op).await
    }

    /// Begins a transaction holding the row lock on `key`'s master row.
    ///
    /// Creates the master row if it does not exist yet.
    pub(crate) async fn begin_locked(&self, key: &str) -> LockResult<Transaction<'static, MySql>> {
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;
        if lock_master_row(&mut tx, key).await? {
            return Ok(tx);
        }
        tx.rollback().await.map_err(from_sqlx)?;

        debug!(key, "creating master row");
        sqlx::query("INSERT IGNORE INTO SEMAPHORE_MASTER (LOCK_KEY) VALUES (?)")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;

        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;
        if lock_master_row(&mut tx, key).await? {
            return Ok(tx);
        }
        tx.rollback().await.map_err(from_sqlx)?;
        Err(LockError::Backend(
            format!("master row for '{key}' vanished after creation").into(),
        ))
    }

    // ------------------------------------------------------------------------
    // Permit rows
    // ------------------------------------------------------------------------

    /// Takes one of `max_permits` permits for `key`, retrying transient
    /// contention. `Ok(None)` when the key is at capacity or the retries
    /// ran out.
    #[instrument(skip(self), fields(backend = "mysql"))]
    pub(crate) async fn acquire_permit(
        &self,
        key: &str,
        lease: Duration,
        max_permits: u32,
        context: Option<&str>,
    ) -> LockResult<Option<String>> {
        let granted = self
            .with_retry(|| self.try_acquire_permit(key, lease, max_permits, context))
            .await?
            .flatten();
        if granted.is_none() {
            debug!("no permit granted");
        }
        Ok(granted)
    }

    async fn try_acquire_permit(
        &self,
        key: &str,
        lease: Duration,
        max_permits: u32,
        context: Option<&str>,
    ) -> LockResult<Option<String>> {
        let mut tx = self.begin_locked(key).await?;

        sqlx::query("DELETE FROM SEMAPHORE_PERMIT WHERE LOCK_KEY = ? AND EXPIRES_ON <= NOW(6)")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;

        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM SEMAPHORE_PERMIT WHERE LOCK_KEY = ? AND EXPIRES_ON > NOW(6)",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await
        .map_err(from_sqlx)?;

        if live >= i64::from(max_permits) {
            tx.rollback().await.map_err(from_sqlx)?;
            return Ok(None);
        }

        let token = new_token();
        sqlx::query(
            "INSERT INTO SEMAPHORE_PERMIT (LOCK_KEY, TOKEN, EXPIRES_ON, CONTEXT) \
             VALUES (?, ?, TIMESTAMPADD(MICROSECOND, ?, NOW(6)), ?)",
        )
        .bind(key)
        .bind(&token)
        .bind(lease_micros(lease))
        .bind(context)
        .execute(&mut *tx)
        .await
        .map_err(from_sqlx)?;

        tx.commit().await.map_err(from_sqlx)?;
        Ok(Some(token))
    }

    /// Deletes a permit row. `LockReleaseFailed` if it is gone.
    #[instrument(skip(self, token), fields(backend = "mysql"))]
    pub(crate) async fn release_permit(&self, key: &str, token: &str) -> LockResult<()> {
        let result = sqlx::query("DELETE FROM SEMAPHORE_PERMIT WHERE LOCK_KEY = ? AND TOKEN = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(LockError::LockReleaseFailed {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Restarts a live permit's lease. `NotFound` if it expired or is gone.
    #[instrument(skip(self, token), fields(backend = "mysql"))]
    pub(crate) async fn refresh_permit(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> LockResult<()> {
        let result = sqlx::query(
            "UPDATE SEMAPHORE_PERMIT SET EXPIRES_ON = TIMESTAMPADD(MICROSECOND, ?, NOW(6)) \
             WHERE LOCK_KEY = ? AND TOKEN = ? AND EXPIRES_ON > NOW(6)",
        )
        .bind(lease_micros(lease))
        .bind(key)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(LockError::NotFound(format!(
                "no live permit for key '{key}' with the given token"
            )));
        }
        Ok(())
    }

    /// Context of the live permit for `key` that expires first.
    pub(crate) async fn first_unexpired_context(&self, key: &str) -> LockResult<Option<String>> {
        sqlx::query_scalar(
            "SELECT CONTEXT FROM SEMAPHORE_PERMIT \
             WHERE LOCK_KEY = ? AND EXPIRES_ON > NOW(6) AND CONTEXT IS NOT NULL \
             ORDER BY EXPIRES_ON LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)
    }

    /// Deletes expired permit rows of every key. Returns how many.
    pub(crate) async fn delete_expired_permits(&self) -> LockResult<u64> {
        let result = sqlx::query("DELETE FROM SEMAPHORE_PERMIT WHERE EXPIRES_ON <= NOW(6)")
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(result.rows_affected())
    }

    /// Number of permit rows, live or expired, across all keys.
    pub(crate) async fn permit_row_count(&self) -> LockResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM SEMAPHORE_PERMIT")
            .fetch_one(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(count.unsigned_abs())
    }

    /// Deletes the permit rows of `key`, or of every key.
    pub(crate) async fn delete_permits(&self, key: Option<&str>) -> LockResult<u64> {
        let result = match key {
            Some(key) => {
                sqlx::query("DELETE FROM SEMAPHORE_PERMIT WHERE LOCK_KEY = ?")
                    .bind(key)
                    .execute(&self.pool)
                    .await
            }
            None => {
                sqlx::query("DELETE FROM SEMAPHORE_PERMIT")
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(from_sqlx)?;
        Ok(result.rows_affected())
    }
}

/// Locks `key`'s master row. Returns false if the row does not exist.
async fn lock_master_row(tx: &mut Transaction<'static, MySql>, key: &str) -> LockResult<bool> {
    let row: Option<String> =
        sqlx::query_scalar("SELECT LOCK_KEY FROM SEMAPHORE_MASTER WHERE LOCK_KEY = ? FOR UPDATE")
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(from_sqlx)?;
    Ok(row.is_some())
}

/// A fresh random token.
pub(crate) fn new_token() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = new_token();
        let b = new_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
