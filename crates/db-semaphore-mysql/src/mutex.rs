//! MySQL simple mutex.

use std::time::Duration;

use tracing::{debug, instrument};

use db_semaphore_core::error::LockResult;
use db_semaphore_core::key::validate_key;
use db_semaphore_core::lease::{MIN_LEASE, lease_micros, validate_lease};
use db_semaphore_core::traits::SimpleMutex;

use crate::error::{from_sqlx, is_duplicate_key};
use crate::store::{LockStore, new_token};

/// A single-holder lock per key.
///
/// Each key has one row in `SEMAPHORE_SINGLE_LOCK`. Acquiring swaps a new
/// token and expiration into the row; releasing clears them. The row
/// itself is the lock target, so no master row is involved.
#[derive(Debug, Clone)]
pub struct MySqlSimpleMutex {
    store: LockStore,
}

impl MySqlSimpleMutex {
    pub(crate) fn new(store: LockStore) -> Self {
        Self { store }
    }

    async fn try_acquire(&self, key: &str, lease: Duration) -> LockResult<Option<String>> {
        let mut tx = self.store.pool().begin().await.map_err(from_sqlx)?;

        let held: Option<i64> = sqlx::query_scalar(
            "SELECT TOKEN IS NOT NULL AND EXPIRES_ON IS NOT NULL AND EXPIRES_ON > NOW(6) \
             FROM SEMAPHORE_SINGLE_LOCK WHERE LOCK_KEY = ? FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(from_sqlx)?;

        let token = new_token();
        match held {
            None => {
                let inserted = sqlx::query(
                    "INSERT INTO SEMAPHORE_SINGLE_LOCK (LOCK_KEY, TOKEN, EXPIRES_ON) \
                     VALUES (?, ?, TIMESTAMPADD(MICROSECOND, ?, NOW(6)))",
                )
                .bind(key)
                .bind(&token)
                .bind(lease_micros(lease))
                .execute(&mut *tx)
                .await;
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_duplicate_key(&e) => {
                        debug!("lost the race to create the lock row");
                        tx.rollback().await.map_err(from_sqlx)?;
                        return Ok(None);
                    }
                    Err(e) => return Err(from_sqlx(e)),
                }
            }
            Some(1) => {
                tx.rollback().await.map_err(from_sqlx)?;
                return Ok(None);
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE SEMAPHORE_SINGLE_LOCK \
                     SET TOKEN = ?, EXPIRES_ON = TIMESTAMPADD(MICROSECOND, ?, NOW(6)) \
                     WHERE LOCK_KEY = ?",
                )
                .bind(&token)
                .bind(lease_micros(lease))
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(from_sqlx)?;
            }
        }

        tx.commit().await.map_err(from_sqlx)?;
        Ok(Some(token))
    }
}

impl SimpleMutex for MySqlSimpleMutex {
    #[instrument(skip(self), fields(backend = "mysql"))]
    async fn acquire(&self, key: &str, lease: Duration) -> LockResult<Option<String>> {
        validate_key(key)?;
        validate_lease(lease, MIN_LEASE)?;
        let granted = self
            .store
            .with_retry(|| self.try_acquire(key, lease))
            .await?
            .flatten();
        if granted.is_none() {
            debug!("mutex held elsewhere");
        }
        Ok(granted)
    }

    #[instrument(skip(self, token), fields(backend = "mysql"))]
    async fn release(&self, key: &str, token: &str) -> LockResult<bool> {
        let result = sqlx::query(
            "UPDATE SEMAPHORE_SINGLE_LOCK SET TOKEN = NULL, EXPIRES_ON = NULL \
             WHERE LOCK_KEY = ? AND TOKEN = ?",
        )
        .bind(key)
        .bind(token)
        .execute(self.store.pool())
        .await
        .map_err(from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(backend = "mysql"))]
    async fn force_release_all(&self) -> LockResult<()> {
        sqlx::query("UPDATE SEMAPHORE_SINGLE_LOCK SET TOKEN = NULL, EXPIRES_ON = NULL")
            .execute(self.store.pool())
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }
}
