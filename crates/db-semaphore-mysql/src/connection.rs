//! MySQL connection management for semaphores.

use std::fmt;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool};

/// Isolation every pooled session runs at. Competitors must see each
/// other's committed permit rows as soon as the master row lock is granted.
const SESSION_ISOLATION: &str = "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED";

/// Represents different ways to connect to MySQL.
#[derive(Clone)]
pub enum MySqlConnection {
    /// Connect using a connection string.
    ConnectionString(String),
    /// Use an existing connection pool. Its sessions should already run at
    /// `READ COMMITTED`.
    Pool(Pool<MySql>),
}

impl MySqlConnection {
    /// Get or create a connection pool.
    ///
    /// For the `ConnectionString` variant, creates a pool of at most
    /// `max_connections` whose sessions run at `READ COMMITTED`. For the
    /// `Pool` variant, clones the existing pool.
    pub async fn get_pool(&self, max_connections: u32) -> Result<Pool<MySql>, sqlx::Error> {
        match self {
            MySqlConnection::ConnectionString(url) => {
                MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .after_connect(|conn, _meta| {
                        Box::pin(async move {
                            sqlx::query(SESSION_ISOLATION).execute(&mut *conn).await?;
                            Ok(())
                        })
                    })
                    .connect(url)
                    .await
            }
            MySqlConnection::Pool(pool) => Ok(pool.clone()),
        }
    }
}

impl fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MySqlConnection::ConnectionString(_) => {
                write!(f, "MySqlConnection::ConnectionString([REDACTED])")
            }
            MySqlConnection::Pool(_) => write!(f, "MySqlConnection::Pool([POOL])"),
        }
    }
}
