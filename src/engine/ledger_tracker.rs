//! Cached view of the current network ledger.
//!
//! The cache is a single snapshot behind an async mutex that stays held across
//! the network fetch, so concurrent callers that find the snapshot stale wait
//! for one in-flight fetch and then reuse its result.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::tx_errors::SubmissionError;
use crate::metrics::metrics;
use crate::network::NetworkClient;
use crate::transaction::LedgerBounds;

/// Ledgers added to the current ledger to compute the max ledger bound
pub const INCREMENT_FOR_MAX_LEDGER_BOUNDS: u32 = 10;

/// Default freshness window of a cached ledger number
pub const MAX_LEDGER_AGE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error)]
pub enum LedgerTrackerError {
    #[error("max ledger age must be greater than zero")]
    InvalidMaxAge,

    #[error("retrieving ledger number from the network: {0}")]
    Fetch(#[source] SubmissionError),

    #[error("ledger number {0} is too close to the end of the ledger range")]
    Overflow(u32),
}

pub type LedgerTrackerResult<T> = Result<T, LedgerTrackerError>;

#[async_trait]
pub trait LedgerNumberTracker: Send + Sync {
    async fn get_ledger_number(&self) -> LedgerTrackerResult<u32>;

    /// Bounds whose max is the current ledger plus
    /// [`INCREMENT_FOR_MAX_LEDGER_BOUNDS`].
    async fn get_ledger_bounds(&self) -> LedgerTrackerResult<LedgerBounds> {
        let current = self.get_ledger_number().await?;
        let max_ledger = current
            .checked_add(INCREMENT_FOR_MAX_LEDGER_BOUNDS)
            .ok_or(LedgerTrackerError::Overflow(current))?;
        Ok(LedgerBounds {
            min_ledger: 0,
            max_ledger,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct LedgerSnapshot {
    ledger_number: u32,
    observed_at: Instant,
}

pub struct DefaultLedgerNumberTracker {
    client: Arc<dyn NetworkClient>,
    max_ledger_age: Duration,
    snapshot: Mutex<Option<LedgerSnapshot>>,
}

impl DefaultLedgerNumberTracker {
    pub fn new(client: Arc<dyn NetworkClient>, max_ledger_age: Duration) -> LedgerTrackerResult<Self> {
        if max_ledger_age.is_zero() {
            return Err(LedgerTrackerError::InvalidMaxAge);
        }
        Ok(Self {
            client,
            max_ledger_age,
            snapshot: Mutex::new(None),
        })
    }

    pub fn max_ledger_age(&self) -> Duration {
        self.max_ledger_age
    }
}

impl std::fmt::Debug for DefaultLedgerNumberTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultLedgerNumberTracker")
            .field("max_ledger_age", &self.max_ledger_age)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LedgerNumberTracker for DefaultLedgerNumberTracker {
    async fn get_ledger_number(&self) -> LedgerTrackerResult<u32> {
        let mut snapshot = self.snapshot.lock().await;

        if let Some(cached) = *snapshot {
            if cached.observed_at.elapsed() <= self.max_ledger_age {
                return Ok(cached.ledger_number);
            }
        }

        metrics().ledger_fetches.inc();
        let root = self.client.root().await.map_err(|e| {
            warn!(error = %e, "failed to fetch current ledger");
            LedgerTrackerError::Fetch(e)
        })?;

        debug!(ledger = root.current_ledger, "refreshed ledger number");
        *snapshot = Some(LedgerSnapshot {
            ledger_number: root.current_ledger,
            observed_at: Instant::now(),
        });
        Ok(root.current_ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockNetworkClient;

    fn tracker(client: Arc<MockNetworkClient>) -> DefaultLedgerNumberTracker {
        DefaultLedgerNumberTracker::new(client, MAX_LEDGER_AGE).unwrap()
    }

    #[test]
    fn test_zero_max_age_rejected() {
        let client = Arc::new(MockNetworkClient::new(100));
        assert!(matches!(
            DefaultLedgerNumberTracker::new(client, Duration::ZERO),
            Err(LedgerTrackerError::InvalidMaxAge)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_within_window_refetched_after() {
        let client = Arc::new(MockNetworkClient::new(100));
        let tracker = tracker(client.clone());

        assert_eq!(tracker.get_ledger_number().await.unwrap(), 100);
        client.set_ledger(105);
        assert_eq!(tracker.get_ledger_number().await.unwrap(), 100);
        assert_eq!(client.root_calls(), 1);

        tokio::time::advance(MAX_LEDGER_AGE + Duration::from_millis(1)).await;
        assert_eq!(tracker.get_ledger_number().await.unwrap(), 105);
        assert_eq!(client.root_calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let client = Arc::new(MockNetworkClient::new(321));
        let tracker = Arc::new(tracker(client.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.get_ledger_number().await })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            assert_eq!(result.unwrap().unwrap(), 321);
        }
        assert_eq!(client.root_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_is_not_cached() {
        let client = Arc::new(MockNetworkClient::new(100));
        let tracker = tracker(client.clone());

        client.fail_root(Some(SubmissionError::status(503, "Service Unavailable")));
        assert!(matches!(
            tracker.get_ledger_number().await,
            Err(LedgerTrackerError::Fetch(_))
        ));

        client.fail_root(None);
        assert_eq!(tracker.get_ledger_number().await.unwrap(), 100);
        assert_eq!(client.root_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_previous_value_survives_failed_refresh_inside_window() {
        let client = Arc::new(MockNetworkClient::new(100));
        let tracker = tracker(client.clone());
        assert_eq!(tracker.get_ledger_number().await.unwrap(), 100);

        client.fail_root(Some(SubmissionError::status(503, "Service Unavailable")));
        assert_eq!(tracker.get_ledger_number().await.unwrap(), 100);

        tokio::time::advance(MAX_LEDGER_AGE * 2).await;
        assert!(tracker.get_ledger_number().await.is_err());
    }

    #[tokio::test]
    async fn test_ledger_bounds() {
        let client = Arc::new(MockNetworkClient::new(1000));
        let bounds = tracker(client).get_ledger_bounds().await.unwrap();
        assert_eq!(bounds.min_ledger, 0);
        assert_eq!(bounds.max_ledger, 1000 + INCREMENT_FOR_MAX_LEDGER_BOUNDS);
    }
}
