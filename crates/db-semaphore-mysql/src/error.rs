//! Mapping of `sqlx` errors onto [`LockError`].

use db_semaphore_core::error::LockError;
use sqlx::mysql::MySqlDatabaseError;

/// MySQL error numbers that mean "run the transaction again".
///
/// 1213 is `ER_LOCK_DEADLOCK`, 1205 is `ER_LOCK_WAIT_TIMEOUT`.
pub const TRANSIENT_ERROR_CODES: [u16; 2] = [1213, 1205];

/// Boxes a driver error into the matching [`LockError`] variant.
pub(crate) fn from_sqlx(error: sqlx::Error) -> LockError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Configuration(_) => LockError::Connection(Box::new(error)),
        _ => LockError::Backend(Box::new(error)),
    }
}

/// Whether `error` is store contention that a retry may clear.
pub fn is_transient(error: &LockError) -> bool {
    let LockError::Backend(source) = error else {
        return false;
    };
    source
        .downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|db| db.try_downcast_ref::<MySqlDatabaseError>())
        .is_some_and(|db| TRANSIENT_ERROR_CODES.contains(&db.number()))
}

/// Whether an insert lost a race against another insert of the same key.
pub(crate) fn is_duplicate_key(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
