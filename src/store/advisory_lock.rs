//! Advisory lock lease
//!
//! Lifecycle commands take a store-backed advisory lock before touching the
//! channel-account pool. The lock is handed out as an [`AdvisoryLease`] that
//! releases on every exit path:
//! - explicitly via [`AdvisoryLease::release`]
//! - automatically on `Drop`, including early returns and unwinding
//!
//! Release runs at most once. Backends whose locks expire attach a renewal
//! hook; long-running commands call [`AdvisoryLease::renew`] between steps.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::debug;

use super::StoreResult;

/// Lock id shared by every process that manages the same channel-account pool
pub const CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID: i64 = 2172398390434160;

/// Source of cross-process advisory locks
#[async_trait]
pub trait AdvisoryLocker: Send + Sync {
    /// `Ok(None)` when another holder owns the lock.
    async fn try_acquire(&self, lock_id: i64) -> StoreResult<Option<AdvisoryLease>>;
}

type ReleaseFn = Box<dyn FnOnce() + Send>;
type RenewFn = Box<dyn Fn() -> bool + Send + Sync>;

pub struct AdvisoryLease {
    lock_id: i64,
    acquired_at: Instant,
    release_fn: Mutex<Option<ReleaseFn>>,
    renew_fn: Option<RenewFn>,
}

impl AdvisoryLease {
    pub fn new<F>(lock_id: i64, release_fn: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            lock_id,
            acquired_at: Instant::now(),
            release_fn: Mutex::new(Some(Box::new(release_fn))),
            renew_fn: None,
        }
    }

    /// Attach the hook that pushes the lock's expiry forward.
    pub fn with_renewal<F>(mut self, renew_fn: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.renew_fn = Some(Box::new(renew_fn));
        self
    }

    /// Extend the lock. `false` means the lock is no longer held by this
    /// lease and the caller must stop touching the pool.
    pub fn renew(&self) -> bool {
        if self.is_released() {
            return false;
        }
        match &self.renew_fn {
            Some(renew) => renew(),
            None => true,
        }
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    pub fn is_released(&self) -> bool {
        self.release_fn.lock().is_none()
    }

    pub fn release(self) {
        self.release_internal();
    }

    fn release_internal(&self) {
        let Some(release) = self.release_fn.lock().take() else {
            return;
        };
        release();
        debug!(
            lock_id = self.lock_id,
            held_for_ms = self.acquired_at.elapsed().as_millis() as u64,
            "advisory lock released"
        );
    }
}

impl Drop for AdvisoryLease {
    fn drop(&mut self) {
        self.release_internal();
    }
}

impl std::fmt::Debug for AdvisoryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLease")
            .field("lock_id", &self.lock_id)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_release_runs_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let lease = AdvisoryLease::new(7, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!lease.is_released());
        lease.release();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let counter = Arc::new(AtomicU32::new(0));
        {
            let c = counter.clone();
            let _lease = AdvisoryLease::new(7, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_renew_stops_after_release() {
        let renewals = Arc::new(AtomicU32::new(0));
        let r = renewals.clone();
        let lease = AdvisoryLease::new(7, || {}).with_renewal(move || {
            r.fetch_add(1, Ordering::SeqCst);
            true
        });

        assert!(lease.renew());
        assert!(lease.renew());
        assert_eq!(renewals.load(Ordering::SeqCst), 2);

        lease.release_internal();
        assert!(!lease.renew());
        assert_eq!(renewals.load(Ordering::SeqCst), 2);

        // locks without expiry always renew
        assert!(AdvisoryLease::new(8, || {}).renew());
    }

    #[test]
    fn test_release_on_panic() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _lease = AdvisoryLease::new(7, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            panic!("lifecycle command blew up");
        }));
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
