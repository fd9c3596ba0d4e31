//! In-memory semaphores for exercising the runners without a database.

use db_semaphore_core::error::{LockError, LockResult};
use db_semaphore_core::traits::{CountingSemaphore, MultiPermitSemaphore, ReaderWriterSemaphore};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

fn next_token(counter: &AtomicU32) -> String {
    format!("token-{}", counter.fetch_add(1, Ordering::SeqCst))
}

fn backend_error(message: &str) -> LockError {
    LockError::Backend(Box::new(std::io::Error::other(message.to_string())))
}

/// Mock counting semaphore. Permits never expire.
#[derive(Debug)]
pub struct MockCountingSemaphore {
    key: String,
    lease: Duration,
    max_count: AtomicU32,
    permits: Mutex<HashMap<String, HashSet<String>>>,
    tokens: AtomicU32,
    pub acquire_calls: AtomicU32,
    pub release_calls: AtomicU32,
    pub extend_calls: AtomicU32,
    pub fail_acquire: AtomicBool,
    pub lose_permits: AtomicBool,
}

impl MockCountingSemaphore {
    pub fn new(key: &str, max_count: u32, lease: Duration) -> Self {
        Self {
            key: key.to_string(),
            lease,
            max_count: AtomicU32::new(max_count),
            permits: Mutex::new(HashMap::new()),
            tokens: AtomicU32::new(0),
            acquire_calls: AtomicU32::new(0),
            release_calls: AtomicU32::new(0),
            extend_calls: AtomicU32::new(0),
            fail_acquire: AtomicBool::new(false),
            lose_permits: AtomicBool::new(false),
        }
    }

    fn composite(&self, extra_key: Option<&str>) -> String {
        match extra_key {
            Some(extra) => format!("{}:{extra}", self.key),
            None => self.key.clone(),
        }
    }

    /// Live permits under `extra_key`.
    pub fn held(&self, extra_key: Option<&str>) -> usize {
        let composite = self.composite(extra_key);
        self.permits
            .lock()
            .unwrap()
            .get(&composite)
            .map_or(0, HashSet::len)
    }

    /// Takes a permit outside any runner.
    pub fn occupy(&self, extra_key: Option<&str>) -> String {
        let token = next_token(&self.tokens);
        self.permits
            .lock()
            .unwrap()
            .entry(self.composite(extra_key))
            .or_default()
            .insert(token.clone());
        token
    }
}

impl CountingSemaphore for MockCountingSemaphore {
    fn key(&self) -> &str {
        &self.key
    }

    fn max_count(&self) -> u32 {
        self.max_count.load(Ordering::SeqCst)
    }

    fn set_max_count(&self, max_count: u32) -> LockResult<()> {
        if max_count == 0 {
            return Err(LockError::InvalidConfig("zero".to_string()));
        }
        self.max_count.store(max_count, Ordering::SeqCst);
        Ok(())
    }

    fn lease(&self) -> Duration {
        self.lease
    }

    async fn acquire(&self, extra_key: Option<&str>) -> LockResult<Option<String>> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(backend_error("store unreachable"));
        }
        let composite = self.composite(extra_key);
        let mut permits = self.permits.lock().unwrap();
        let held = permits.entry(composite).or_default();
        if held.len() >= self.max_count() as usize {
            return Ok(None);
        }
        let token = next_token(&self.tokens);
        held.insert(token.clone());
        Ok(Some(token))
    }

    async fn release(&self, token: &str, extra_key: Option<&str>) -> LockResult<()> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let composite = self.composite(extra_key);
        let removed = self
            .permits
            .lock()
            .unwrap()
            .get_mut(&composite)
            .is_some_and(|held| held.remove(token));
        if !removed || self.lose_permits.load(Ordering::SeqCst) {
            return Err(LockError::LockReleaseFailed { key: composite });
        }
        Ok(())
    }

    async fn extend_lease(&self, token: &str, extra_key: Option<&str>) -> LockResult<()> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        let composite = self.composite(extra_key);
        let held = self
            .permits
            .lock()
            .unwrap()
            .get(&composite)
            .is_some_and(|held| held.contains(token));
        if !held || self.lose_permits.load(Ordering::SeqCst) {
            return Err(LockError::NotFound(composite));
        }
        Ok(())
    }
}

/// Mock multi-permit semaphore. Permits never expire.
#[derive(Debug, Default)]
pub struct MockMultiPermitSemaphore {
    permits: Mutex<HashMap<String, HashMap<String, Option<String>>>>,
    tokens: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub release_calls: AtomicU32,
}

impl MockMultiPermitSemaphore {
    pub fn held(&self, key: &str) -> usize {
        self.permits
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, HashMap::len)
    }
}

impl MultiPermitSemaphore for MockMultiPermitSemaphore {
    async fn acquire_with_context(
        &self,
        key: &str,
        _lease: Duration,
        max_permits: u32,
        context: Option<&str>,
    ) -> LockResult<Option<String>> {
        let mut permits = self.permits.lock().unwrap();
        let held = permits.entry(key.to_string()).or_default();
        if held.len() >= max_permits as usize {
            return Ok(None);
        }
        let token = next_token(&self.tokens);
        held.insert(token.clone(), context.map(str::to_string));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<()> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let removed = self
            .permits
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|held| held.remove(token))
            .is_some();
        if !removed {
            return Err(LockError::LockReleaseFailed {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn refresh_lease(&self, key: &str, token: &str, _lease: Duration) -> LockResult<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let held = self
            .permits
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|held| held.contains_key(token));
        if !held {
            return Err(LockError::NotFound(key.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RwKeyState {
    shared: HashSet<String>,
    precursor: Option<String>,
    exclusive: Option<(String, String)>,
}

/// Mock reader-writer semaphore with the store's admission rules but no
/// expiry.
#[derive(Debug, Default)]
pub struct MockReaderWriterSemaphore {
    keys: Mutex<HashMap<String, RwKeyState>>,
    tokens: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub exclusive_attempts: AtomicU32,
    pub fail_release: AtomicBool,
}

impl MockReaderWriterSemaphore {
    pub fn readers(&self, key: &str) -> usize {
        self.keys
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |state| state.shared.len())
    }

    pub fn has_precursor(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|state| state.precursor.is_some())
    }

    pub fn has_exclusive(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|state| state.exclusive.is_some())
    }

    /// Takes a shared lock outside any runner.
    pub fn add_reader(&self, key: &str) -> String {
        let token = next_token(&self.tokens);
        self.keys
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .shared
            .insert(token.clone());
        token
    }

    /// Drops a shared lock outside any runner.
    pub fn remove_reader(&self, key: &str, token: &str) {
        if let Some(state) = self.keys.lock().unwrap().get_mut(key) {
            state.shared.remove(token);
        }
    }

    fn release_failure(&self, key: &str) -> LockResult<()> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(LockError::LockReleaseFailed {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

impl ReaderWriterSemaphore for MockReaderWriterSemaphore {
    async fn acquire_shared(&self, key: &str, _lease: Duration) -> LockResult<String> {
        let mut keys = self.keys.lock().unwrap();
        let state = keys.entry(key.to_string()).or_default();
        if state.precursor.is_some() || state.exclusive.is_some() {
            return Err(LockError::LockUnavailable(format!("writer on {key}")));
        }
        let token = next_token(&self.tokens);
        state.shared.insert(token.clone());
        Ok(token)
    }

    async fn release_shared(&self, key: &str, token: &str) -> LockResult<()> {
        self.release_failure(key)?;
        let removed = self
            .keys
            .lock()
            .unwrap()
            .get_mut(key)
            .is_some_and(|state| state.shared.remove(token));
        if !removed {
            return Err(LockError::LockReleaseFailed {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn refresh_shared_lease(
        &self,
        key: &str,
        token: &str,
        _lease: Duration,
    ) -> LockResult<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let held = self
            .keys
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|state| state.shared.contains(token));
        if !held {
            return Err(LockError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn acquire_exclusive_precursor(&self, key: &str) -> LockResult<String> {
        let mut keys = self.keys.lock().unwrap();
        let state = keys.entry(key.to_string()).or_default();
        if state.precursor.is_some() || state.exclusive.is_some() {
            return Err(LockError::LockUnavailable(format!("writer on {key}")));
        }
        let token = next_token(&self.tokens);
        state.precursor = Some(token.clone());
        Ok(token)
    }

    async fn release_exclusive_precursor(
        &self,
        key: &str,
        precursor_token: &str,
    ) -> LockResult<()> {
        let mut keys = self.keys.lock().unwrap();
        let state = keys.entry(key.to_string()).or_default();
        if state.precursor.as_deref() != Some(precursor_token) {
            return Err(LockError::LockReleaseFailed {
                key: key.to_string(),
            });
        }
        state.precursor = None;
        Ok(())
    }

    async fn acquire_exclusive(
        &self,
        key: &str,
        precursor_token: &str,
        _lease: Duration,
    ) -> LockResult<Option<String>> {
        self.exclusive_attempts.fetch_add(1, Ordering::SeqCst);
        let mut keys = self.keys.lock().unwrap();
        let state = keys.entry(key.to_string()).or_default();
        if state.precursor.as_deref() != Some(precursor_token) {
            return Err(LockError::LockUnavailable(format!("no precursor on {key}")));
        }
        if !state.shared.is_empty() {
            return Ok(None);
        }
        let token = next_token(&self.tokens);
        state.exclusive = Some((token.clone(), precursor_token.to_string()));
        Ok(Some(token))
    }

    async fn refresh_exclusive_lease(
        &self,
        key: &str,
        token: &str,
        _lease: Duration,
    ) -> LockResult<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let held = self
            .keys
            .lock()
            .unwrap()
            .get(key)
            .and_then(|state| state.exclusive.as_ref())
            .is_some_and(|(held, _)| held == token);
        if !held {
            return Err(LockError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn release_exclusive(&self, key: &str, token: &str) -> LockResult<()> {
        self.release_failure(key)?;
        let mut keys = self.keys.lock().unwrap();
        let state = keys.entry(key.to_string()).or_default();
        match state.exclusive.take() {
            Some((held, precursor)) if held == token => {
                if state.precursor.as_deref() == Some(precursor.as_str()) {
                    state.precursor = None;
                }
                Ok(())
            }
            other => {
                state.exclusive = other;
                Err(LockError::LockReleaseFailed {
                    key: key.to_string(),
                })
            }
        }
    }
}
