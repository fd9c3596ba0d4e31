//! Progress reporters that renew a held permit at its half-life.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::LockResult;
use crate::lease::HalfLifeRenewal;
use crate::traits::{CountingSemaphore, MultiPermitSemaphore, ProgressReporter};

/// Renews a counting-semaphore permit held by a gated runner.
#[derive(Debug)]
pub struct CountingLeaseProgress<'a, S> {
    semaphore: &'a S,
    token: &'a str,
    extra_key: Option<&'a str>,
    renewal: HalfLifeRenewal,
}

impl<'a, S: CountingSemaphore> CountingLeaseProgress<'a, S> {
    /// Starts tracking a permit that was just granted.
    pub fn new(semaphore: &'a S, token: &'a str, extra_key: Option<&'a str>) -> Self {
        Self {
            semaphore,
            token,
            extra_key,
            renewal: HalfLifeRenewal::new(semaphore.lease()),
        }
    }

    /// Token of the permit being renewed.
    pub fn token(&self) -> &str {
        self.token
    }
}

impl<S: CountingSemaphore> ProgressReporter for CountingLeaseProgress<'_, S> {
    async fn progress_made(&self) -> LockResult<()> {
        let renewed = self
            .renewal
            .renew_if_due(|| self.semaphore.extend_lease(self.token, self.extra_key))
            .await?;
        if renewed {
            debug!(key = self.semaphore.key(), extra_key = ?self.extra_key, "permit lease renewed");
        }
        Ok(())
    }
}

/// Renews a multi-permit semaphore permit held by a [`PermitRunner`].
///
/// Owned so it can be moved into the task.
///
/// [`PermitRunner`]: crate::runner::PermitRunner
#[derive(Debug)]
pub struct PermitLeaseProgress<S> {
    semaphore: Arc<S>,
    key: String,
    token: String,
    renewal: HalfLifeRenewal,
}

impl<S: MultiPermitSemaphore> PermitLeaseProgress<S> {
    pub(crate) fn new(semaphore: Arc<S>, key: &str, token: &str, lease: Duration) -> Self {
        Self {
            semaphore,
            key: key.to_string(),
            token: token.to_string(),
            renewal: HalfLifeRenewal::new(lease),
        }
    }

    /// Key of the permit being renewed.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token of the permit being renewed.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl<S: MultiPermitSemaphore> ProgressReporter for PermitLeaseProgress<S> {
    async fn progress_made(&self) -> LockResult<()> {
        let lease = self.renewal.lease();
        let renewed = self
            .renewal
            .renew_if_due(|| self.semaphore.refresh_lease(&self.key, &self.token, lease))
            .await?;
        if renewed {
            debug!(key = %self.key, "permit lease renewed");
        }
        Ok(())
    }
}
