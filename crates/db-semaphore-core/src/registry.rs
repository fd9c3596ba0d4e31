//! Registry of semaphore keys in use by gated runners.
//!
//! Two runners sharing one semaphore key would silently share one permit
//! pool. The registry is created by the application (or test harness) and
//! handed to every runner it builds, so a duplicate key fails at setup.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{LockError, LockResult};

/// Tracks semaphore keys claimed within one process or test harness.
#[derive(Debug, Clone, Default)]
pub struct SemaphoreKeyRegistry {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl SemaphoreKeyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`. The claim lasts until the returned registration is
    /// dropped.
    pub fn register(&self, key: &str) -> LockResult<KeyRegistration> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        if !keys.insert(key.to_string()) {
            return Err(LockError::InvalidConfig(format!(
                "semaphore key '{key}' is already in use by another runner"
            )));
        }
        Ok(KeyRegistration {
            key: key.to_string(),
            keys: Arc::clone(&self.keys),
        })
    }

    /// Whether `key` is currently claimed.
    pub fn is_registered(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(key)
    }

    /// Number of claimed keys.
    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Whether no keys are claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claimed semaphore key. Releases the claim on drop.
#[derive(Debug)]
pub struct KeyRegistration {
    key: String,
    keys: Arc<Mutex<HashSet<String>>>,
}

impl KeyRegistration {
    /// The claimed key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyRegistration {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}
