//! Channel Account Store Module
//!
//! Persistent, lockable pool of channel-account rows plus the advisory lock
//! that serializes lifecycle commands across processes sharing the store.
//!
//! Two backends implement the same contract:
//! - [`InMemoryChannelAccountStore`] for tests and single-process tooling
//! - [`SledChannelAccountStore`] for durable deployments

use async_trait::async_trait;
use thiserror::Error;

pub mod advisory_lock;
pub mod channel_account;
pub mod in_memory;
pub mod sled_store;

pub use advisory_lock::{AdvisoryLease, AdvisoryLocker, CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID};
pub use channel_account::{ChannelAccount, NewChannelAccount};
pub use in_memory::InMemoryChannelAccountStore;
pub use sled_store::SledChannelAccountStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No row, or no row that satisfies the requested lease condition
    #[error("channel account {0} not found")]
    NotFound(String),

    /// Row exists but another operation holds its lease
    #[error("channel account {0} is locked by another operation")]
    AlreadyLocked(String),

    #[error("channel account {0} already exists")]
    AlreadyExists(String),

    #[error("invalid channel account request: {0}")]
    Validation(String),

    #[error("channel account store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Someone else holds the resource
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::AlreadyLocked(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Lockable channel-account pool.
///
/// `current_ledger == 0` disables lease filtering on reads. Lock
/// acquisition is conditional: it succeeds only if the row is unlocked or
/// its lease ended before `current_ledger`.
#[async_trait]
pub trait ChannelAccountStore: Send + Sync {
    async fn insert(&self, public_key: &str, private_key: &str) -> StoreResult<()>;

    async fn batch_insert(&self, accounts: Vec<NewChannelAccount>) -> StoreResult<()>;

    /// Insert every row already locked to `locked_until_ledger`, all or nothing.
    async fn batch_insert_and_lock(
        &self,
        accounts: Vec<NewChannelAccount>,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<()>;

    async fn get(&self, public_key: &str, current_ledger: u32) -> StoreResult<ChannelAccount>;

    async fn get_and_lock(
        &self,
        public_key: &str,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<ChannelAccount>;

    /// `limit == 0` returns every matching row.
    async fn get_all(&self, current_ledger: u32, limit: usize) -> StoreResult<Vec<ChannelAccount>>;

    async fn get_and_lock_all(
        &self,
        current_ledger: u32,
        locked_until_ledger: u32,
        limit: usize,
    ) -> StoreResult<Vec<ChannelAccount>>;

    async fn count(&self) -> StoreResult<usize>;

    async fn lock(
        &self,
        public_key: &str,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<ChannelAccount>;

    async fn unlock(&self, public_key: &str) -> StoreResult<ChannelAccount>;

    async fn delete(&self, public_key: &str) -> StoreResult<()>;

    /// Delete only while the row's lease still reaches `locked_until_ledger`.
    async fn delete_if_locked_until(
        &self,
        public_key: &str,
        locked_until_ledger: u32,
    ) -> StoreResult<()>;
}

pub(crate) fn validate_lease(current_ledger: u32, locked_until_ledger: u32) -> StoreResult<()> {
    if locked_until_ledger < current_ledger {
        return Err(StoreError::Validation(format!(
            "locked_until_ledger {} is before current ledger {}",
            locked_until_ledger, current_ledger
        )));
    }
    Ok(())
}

pub(crate) fn validate_new_accounts(accounts: &[NewChannelAccount]) -> StoreResult<()> {
    let mut seen = std::collections::HashSet::new();
    for account in accounts {
        if account.public_key.is_empty() || account.private_key.is_empty() {
            return Err(StoreError::Validation(
                "public and private key cannot be empty".to_string(),
            ));
        }
        if !seen.insert(account.public_key.as_str()) {
            return Err(StoreError::AlreadyExists(account.public_key.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod contract_tests {
    //! Behaviour every backend must share; invoked from each backend's tests.

    use super::*;

    fn rows(n: usize) -> Vec<NewChannelAccount> {
        (0..n)
            .map(|i| NewChannelAccount {
                public_key: format!("GACC{:03}", i),
                private_key: format!("encrypted-{}", i),
            })
            .collect()
    }

    pub async fn insert_and_get(store: &dyn ChannelAccountStore) {
        store.insert("GONE", "secret").await.unwrap();
        let row = store.get("GONE", 0).await.unwrap();
        assert_eq!(row.private_key, "secret");
        assert!(row.locked_until_ledger.is_none());

        assert_eq!(
            store.insert("GONE", "again").await.unwrap_err(),
            StoreError::AlreadyExists("GONE".into())
        );
        assert!(store.get("GMISSING", 0).await.unwrap_err().is_not_found());
    }

    pub async fn batch_insert_and_lock_is_atomic(store: &dyn ChannelAccountStore) {
        store.insert("GACC001", "existing").await.unwrap();

        let err = store.batch_insert_and_lock(rows(3), 100, 110).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("GACC001".into()));
        assert_eq!(store.count().await.unwrap(), 1);

        store.delete("GACC001").await.unwrap();
        store.batch_insert_and_lock(rows(3), 100, 110).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);
        for row in store.get_all(0, 0).await.unwrap() {
            assert_eq!(row.locked_at_ledger, Some(100));
            assert_eq!(row.locked_until_ledger, Some(110));
        }
    }

    pub async fn conditional_lock(store: &dyn ChannelAccountStore) {
        store.batch_insert(rows(1)).await.unwrap();

        let locked = store.lock("GACC000", 100, 110).await.unwrap();
        assert_eq!(locked.locked_until_ledger, Some(110));

        // lease held
        assert!(store.lock("GACC000", 105, 115).await.unwrap_err().is_contention());
        assert!(store.get("GACC000", 105).await.unwrap_err().is_not_found());
        assert!(store.get_and_lock("GACC000", 110, 120).await.unwrap_err().is_contention());

        // lease expired
        let relocked = store.get_and_lock("GACC000", 111, 121).await.unwrap();
        assert_eq!(relocked.locked_at_ledger, Some(111));

        let unlocked = store.unlock("GACC000").await.unwrap();
        assert!(unlocked.locked_until_ledger.is_none());

        assert!(matches!(
            store.lock("GACC000", 100, 90).await,
            Err(StoreError::Validation(_))
        ));
        assert!(store.unlock("GMISSING").await.unwrap_err().is_not_found());
    }

    pub async fn get_all_and_lock_all(store: &dyn ChannelAccountStore) {
        store.batch_insert(rows(4)).await.unwrap();
        store.lock("GACC000", 100, 110).await.unwrap();

        assert_eq!(store.get_all(0, 0).await.unwrap().len(), 4);
        assert_eq!(store.get_all(105, 0).await.unwrap().len(), 3);
        assert_eq!(store.get_all(105, 2).await.unwrap().len(), 2);

        let locked = store.get_and_lock_all(105, 115, 2).await.unwrap();
        assert_eq!(locked.len(), 2);
        assert!(locked.iter().all(|r| r.locked_until_ledger == Some(115)));
        assert!(locked.iter().all(|r| r.public_key != "GACC000"));

        assert_eq!(store.get_all(105, 0).await.unwrap().len(), 1);
        assert_eq!(store.get_and_lock_all(105, 115, 0).await.unwrap().len(), 1);
        assert!(store.get_and_lock_all(105, 115, 1).await.unwrap().is_empty());
    }

    pub async fn delete_if_locked_until(store: &dyn ChannelAccountStore) {
        store.batch_insert_and_lock(rows(2), 100, 110).await.unwrap();

        // lock does not reach the asserted ledger
        assert!(store
            .delete_if_locked_until("GACC000", 111)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .delete_if_locked_until("GMISSING", 110)
            .await
            .unwrap_err()
            .is_not_found());

        store.delete_if_locked_until("GACC000", 110).await.unwrap();
        store.delete_if_locked_until("GACC001", 105).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);

        store.insert("GFREE", "secret").await.unwrap();
        assert!(store
            .delete_if_locked_until("GFREE", 1)
            .await
            .unwrap_err()
            .is_not_found());
        store.delete("GFREE").await.unwrap();
        assert!(store.delete("GFREE").await.unwrap_err().is_not_found());
    }

    pub async fn rejects_invalid_batches(store: &dyn ChannelAccountStore) {
        let mut dupes = rows(2);
        dupes[1].public_key = dupes[0].public_key.clone();
        assert!(matches!(
            store.batch_insert(dupes).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.batch_insert_and_lock(rows(1), 100, 99).await,
            Err(StoreError::Validation(_))
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
