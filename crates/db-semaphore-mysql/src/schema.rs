//! Table definitions for the semaphore store.
//!
//! Every table keys on a `LOCK_KEY` of at most
//! [`MAX_LOCK_KEY_LENGTH`](db_semaphore_core::key::MAX_LOCK_KEY_LENGTH)
//! characters. `EXPIRES_ON` is compared against the server's `NOW(6)` only.

use sqlx::MySqlPool;
use tracing::debug;

use db_semaphore_core::error::LockResult;

use crate::error::from_sqlx;

pub const MASTER_TABLE: &str = "SEMAPHORE_MASTER";
pub const PERMIT_TABLE: &str = "SEMAPHORE_PERMIT";
pub const SINGLE_LOCK_TABLE: &str = "SEMAPHORE_SINGLE_LOCK";
pub const SHARED_LOCK_TABLE: &str = "RW_SHARED_LOCK";
pub const EXCLUSIVE_LOCK_TABLE: &str = "RW_EXCLUSIVE_LOCK";
pub const PRECURSOR_TABLE: &str = "RW_WRITE_PRECURSOR";

const CREATE_TABLES: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS SEMAPHORE_MASTER (
        LOCK_KEY VARCHAR(100) NOT NULL,
        PRIMARY KEY (LOCK_KEY)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS SEMAPHORE_PERMIT (
        LOCK_KEY VARCHAR(100) NOT NULL,
        TOKEN VARCHAR(64) NOT NULL,
        EXPIRES_ON DATETIME(6) NOT NULL,
        CONTEXT VARCHAR(256) NULL,
        PRIMARY KEY (LOCK_KEY, TOKEN),
        INDEX SEMAPHORE_PERMIT_EXPIRES_ON (EXPIRES_ON)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS SEMAPHORE_SINGLE_LOCK (
        LOCK_KEY VARCHAR(100) NOT NULL,
        TOKEN VARCHAR(64) NULL,
        EXPIRES_ON DATETIME(6) NULL,
        PRIMARY KEY (LOCK_KEY)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS RW_SHARED_LOCK (
        LOCK_KEY VARCHAR(100) NOT NULL,
        TOKEN VARCHAR(64) NOT NULL,
        EXPIRES_ON DATETIME(6) NOT NULL,
        PRIMARY KEY (LOCK_KEY, TOKEN)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS RW_EXCLUSIVE_LOCK (
        LOCK_KEY VARCHAR(100) NOT NULL,
        TOKEN VARCHAR(64) NOT NULL,
        PRECURSOR_TOKEN VARCHAR(64) NOT NULL,
        EXPIRES_ON DATETIME(6) NOT NULL,
        PRIMARY KEY (LOCK_KEY)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS RW_WRITE_PRECURSOR (
        LOCK_KEY VARCHAR(100) NOT NULL,
        TOKEN VARCHAR(64) NOT NULL,
        EXPIRES_ON DATETIME(6) NOT NULL,
        PRIMARY KEY (LOCK_KEY)
    )
    "#,
];

/// Creates any missing table. Safe to run concurrently from many processes.
pub async fn create_tables(pool: &MySqlPool) -> LockResult<()> {
    for statement in CREATE_TABLES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(from_sqlx)?;
    }
    debug!(backend = "mysql", "semaphore schema ensured");
    Ok(())
}
