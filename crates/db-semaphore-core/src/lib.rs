//! Core traits, errors and runners for database-backed semaphores.
//!
//! Backends implement the traits in [`traits`]; the runners in [`runner`]
//! build waiting, keepalive and guaranteed release on top of them.

pub mod error;
pub mod key;
pub mod lease;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod traits;

pub use error::{LockError, LockResult};
pub use prelude::*;
