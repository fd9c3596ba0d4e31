//! MySQL backend for database-backed semaphores.
//!
//! All coordination happens through row locks and lease columns in a small
//! set of tables (see [`schema`]). No MySQL named locks are used, so every
//! primitive survives connection loss and works through any pooled
//! connection.

pub mod connection;
pub mod counting;
pub mod error;
pub mod multi_permit;
pub mod mutex;
pub mod provider;
pub mod rw_semaphore;
pub mod schema;
pub mod store;

pub use counting::MySqlCountingSemaphore;
pub use error::is_transient;
pub use multi_permit::MySqlMultiPermitSemaphore;
pub use mutex::MySqlSimpleMutex;
pub use provider::{MySqlSemaphoreProvider, MySqlSemaphoreProviderBuilder};
pub use rw_semaphore::MySqlReaderWriterSemaphore;
pub use store::LockStore;
