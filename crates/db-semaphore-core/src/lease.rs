//! Lease helpers.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{LockError, LockResult};

/// Shortest lease any primitive accepts.
pub const MIN_LEASE: Duration = Duration::from_millis(100);

/// Shortest lease a gated runner accepts.
pub const MIN_GATED_LEASE: Duration = Duration::from_secs(1);

/// Longest lease any primitive accepts. Expirations must stay within the
/// store's date range.
pub const MAX_LEASE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Rejects leases shorter than `floor` or longer than [`MAX_LEASE`].
pub fn validate_lease(lease: Duration, floor: Duration) -> LockResult<()> {
    if lease < floor {
        return Err(LockError::InvalidConfig(format!(
            "lease {lease:?} is below the minimum of {floor:?}"
        )));
    }
    if lease > MAX_LEASE {
        return Err(LockError::InvalidConfig(format!(
            "lease {lease:?} exceeds the maximum of {MAX_LEASE:?}"
        )));
    }
    Ok(())
}

/// Converts a lease to whole microseconds for the store.
pub fn lease_micros(lease: Duration) -> i64 {
    i64::try_from(lease.as_micros()).unwrap_or(i64::MAX)
}

/// Renews a lease once more than half of it has elapsed since the last
/// renewal.
///
/// Long-running work reports progress as often as it likes; only calls that
/// land past the half-life hit the store.
///
/// ```rust,ignore
/// let renewal = HalfLifeRenewal::new(lease);
/// for chunk in work {
///     process(chunk).await;
///     renewal.renew_if_due(|| semaphore.extend_lease(&token, None)).await?;
/// }
/// ```
#[derive(Debug)]
pub struct HalfLifeRenewal {
    lease: Duration,
    last_renewal: Mutex<Instant>,
}

impl HalfLifeRenewal {
    /// Starts the clock now; the lease is assumed freshly granted.
    pub fn new(lease: Duration) -> Self {
        Self::starting_at(lease, Instant::now())
    }

    /// Starts the clock at `granted_at`.
    pub fn starting_at(lease: Duration, granted_at: Instant) -> Self {
        Self {
            lease,
            last_renewal: Mutex::new(granted_at),
        }
    }

    /// The lease being renewed.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Half of the lease.
    pub fn half_life(&self) -> Duration {
        self.lease / 2
    }

    /// Whether a renewal is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last()) > self.half_life()
    }

    /// Runs `renew` if a renewal is due, and restarts the clock when it
    /// succeeds. Returns whether a renewal happened.
    pub async fn renew_if_due<F, Fut>(&self, renew: F) -> LockResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LockResult<()>>,
    {
        if !self.is_due(Instant::now()) {
            return Ok(false);
        }
        renew().await?;
        self.mark_renewed(Instant::now());
        Ok(true)
    }

    fn last(&self) -> Instant {
        *self
            .last_renewal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_renewed(&self, at: Instant) {
        *self
            .last_renewal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }
}
