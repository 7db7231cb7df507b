use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    validate_lease, validate_new_accounts, AdvisoryLease, AdvisoryLocker, ChannelAccount,
    ChannelAccountStore, NewChannelAccount, StoreError, StoreResult,
};

/// Tree holding channel-account rows keyed by public key
pub const TREE_CHANNEL_ACCOUNTS: &str = "channel_accounts";
/// Tree holding advisory lock ownership keyed by lock id
pub const TREE_ADVISORY_LOCKS: &str = "advisory_locks";

/// Advisory locks not renewed within this long are considered abandoned by a
/// dead holder
pub const DEFAULT_ADVISORY_LOCK_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdvisoryRecord {
    owner: Uuid,
    expires_at_ms: i64,
}

impl AdvisoryRecord {
    fn encode(owner: Uuid, ttl: Duration) -> StoreResult<Vec<u8>> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        serde_json::to_vec(&AdvisoryRecord {
            owner,
            expires_at_ms: now_ms().saturating_add(ttl_ms),
        })
        .map_err(backend)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Durable pool backed by sled.
///
/// Multi-row operations run inside sled transactions so batch inserts are
/// all-or-nothing and conditional locks re-check the lease inside the
/// transaction. `Clone` shares the underlying database handle.
#[derive(Debug, Clone)]
pub struct SledChannelAccountStore {
    db: Db,
    accounts: Tree,
    advisory: Tree,
    advisory_ttl: Duration,
}

fn backend<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn encode(row: &ChannelAccount) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(row).map_err(|e| StoreError::Backend(format!("serialization error: {}", e)))
}

fn decode(bytes: &[u8]) -> StoreResult<ChannelAccount> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Backend(format!("deserialization error: {}", e)))
}

fn abort(err: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err)
}

fn unwrap_tx<T>(result: Result<T, TransactionError<StoreError>>) -> StoreResult<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => backend(err),
    })
}

fn tx_get(
    tree: &TransactionalTree,
    public_key: &str,
) -> Result<Option<ChannelAccount>, ConflictableTransactionError<StoreError>> {
    match tree.get(public_key.as_bytes())? {
        Some(bytes) => decode(&bytes).map(Some).map_err(abort),
        None => Ok(None),
    }
}

fn tx_put(
    tree: &TransactionalTree,
    row: &ChannelAccount,
) -> Result<(), ConflictableTransactionError<StoreError>> {
    let bytes = encode(row).map_err(abort)?;
    tree.insert(row.public_key.as_bytes(), bytes)?;
    Ok(())
}

impl SledChannelAccountStore {
    /// Opens or creates the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path).map_err(backend)?;
        Self::from_db(db)
    }

    /// Throwaway database for tests and dry runs.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(backend)?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> StoreResult<Self> {
        let accounts = db.open_tree(TREE_CHANNEL_ACCOUNTS).map_err(backend)?;
        let advisory = db.open_tree(TREE_ADVISORY_LOCKS).map_err(backend)?;
        Ok(Self {
            db,
            accounts,
            advisory,
            advisory_ttl: DEFAULT_ADVISORY_LOCK_TTL,
        })
    }

    pub fn with_advisory_ttl(mut self, ttl: Duration) -> Self {
        self.advisory_ttl = ttl;
        self
    }

    pub async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await.map(|_| ()).map_err(backend)
    }

    fn scan(&self) -> StoreResult<Vec<ChannelAccount>> {
        self.accounts
            .iter()
            .values()
            .map(|item| item.map_err(backend).and_then(|bytes| decode(&bytes)))
            .collect()
    }

    fn insert_rows(&self, accounts: Vec<NewChannelAccount>, lease: Option<(u32, u32)>) -> StoreResult<()> {
        validate_new_accounts(&accounts)?;
        let rows: Vec<ChannelAccount> = accounts
            .into_iter()
            .map(|a| {
                let mut row = ChannelAccount::new(a.public_key, a.private_key);
                if let Some((current, until)) = lease {
                    row.apply_lock(current, until);
                }
                row
            })
            .collect();

        unwrap_tx(self.accounts.transaction(|tree| {
            for row in &rows {
                if tree.get(row.public_key.as_bytes())?.is_some() {
                    return Err(abort(StoreError::AlreadyExists(row.public_key.clone())));
                }
                tx_put(tree, row)?;
            }
            Ok(())
        }))
    }

    fn lock_one(
        &self,
        public_key: &str,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<ChannelAccount> {
        validate_lease(current_ledger, locked_until_ledger)?;
        unwrap_tx(self.accounts.transaction(|tree| {
            let mut row = tx_get(tree, public_key)?
                .ok_or_else(|| abort(StoreError::NotFound(public_key.to_string())))?;
            if row.is_locked(current_ledger) {
                return Err(abort(StoreError::AlreadyLocked(public_key.to_string())));
            }
            row.apply_lock(current_ledger, locked_until_ledger);
            tx_put(tree, &row)?;
            Ok(row)
        }))
    }
}

#[async_trait]
impl ChannelAccountStore for SledChannelAccountStore {
    async fn insert(&self, public_key: &str, private_key: &str) -> StoreResult<()> {
        self.insert_rows(
            vec![NewChannelAccount {
                public_key: public_key.to_string(),
                private_key: private_key.to_string(),
            }],
            None,
        )
    }

    async fn batch_insert(&self, accounts: Vec<NewChannelAccount>) -> StoreResult<()> {
        self.insert_rows(accounts, None)
    }

    async fn batch_insert_and_lock(
        &self,
        accounts: Vec<NewChannelAccount>,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<()> {
        validate_lease(current_ledger, locked_until_ledger)?;
        self.insert_rows(accounts, Some((current_ledger, locked_until_ledger)))
    }

    async fn get(&self, public_key: &str, current_ledger: u32) -> StoreResult<ChannelAccount> {
        let bytes = self
            .accounts
            .get(public_key.as_bytes())
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(public_key.to_string()))?;
        let row = decode(&bytes)?;
        if !row.is_available(current_ledger) {
            return Err(StoreError::NotFound(public_key.to_string()));
        }
        Ok(row)
    }

    async fn get_and_lock(
        &self,
        public_key: &str,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<ChannelAccount> {
        self.lock_one(public_key, current_ledger, locked_until_ledger)
    }

    async fn get_all(&self, current_ledger: u32, limit: usize) -> StoreResult<Vec<ChannelAccount>> {
        let take = if limit == 0 { usize::MAX } else { limit };
        Ok(self
            .scan()?
            .into_iter()
            .filter(|row| row.is_available(current_ledger))
            .take(take)
            .collect())
    }

    async fn get_and_lock_all(
        &self,
        current_ledger: u32,
        locked_until_ledger: u32,
        limit: usize,
    ) -> StoreResult<Vec<ChannelAccount>> {
        validate_lease(current_ledger, locked_until_ledger)?;
        let take = if limit == 0 { usize::MAX } else { limit };
        let candidates: Vec<String> = self
            .scan()?
            .into_iter()
            .filter(|row| !row.is_locked(current_ledger))
            .map(|row| row.public_key)
            .collect();

        // candidates can be taken by a concurrent locker between the scan and
        // the transaction, so each one is re-checked inside it
        unwrap_tx(self.accounts.transaction(|tree| {
            let mut locked = Vec::new();
            for public_key in &candidates {
                if locked.len() >= take {
                    break;
                }
                let Some(mut row) = tx_get(tree, public_key)? else {
                    continue;
                };
                if row.is_locked(current_ledger) {
                    continue;
                }
                row.apply_lock(current_ledger, locked_until_ledger);
                tx_put(tree, &row)?;
                locked.push(row);
            }
            Ok(locked)
        }))
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.accounts.len())
    }

    async fn lock(
        &self,
        public_key: &str,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<ChannelAccount> {
        self.lock_one(public_key, current_ledger, locked_until_ledger)
    }

    async fn unlock(&self, public_key: &str) -> StoreResult<ChannelAccount> {
        unwrap_tx(self.accounts.transaction(|tree| {
            let mut row = tx_get(tree, public_key)?
                .ok_or_else(|| abort(StoreError::NotFound(public_key.to_string())))?;
            row.apply_unlock();
            tx_put(tree, &row)?;
            Ok(row)
        }))
    }

    async fn delete(&self, public_key: &str) -> StoreResult<()> {
        self.accounts
            .remove(public_key.as_bytes())
            .map_err(backend)?
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(public_key.to_string()))
    }

    async fn delete_if_locked_until(
        &self,
        public_key: &str,
        locked_until_ledger: u32,
    ) -> StoreResult<()> {
        unwrap_tx(self.accounts.transaction(|tree| {
            let covered = tx_get(tree, public_key)?
                .is_some_and(|row| row.lock_covers(locked_until_ledger));
            if !covered {
                return Err(abort(StoreError::NotFound(public_key.to_string())));
            }
            tree.remove(public_key.as_bytes())?;
            Ok(())
        }))
    }
}

#[async_trait]
impl AdvisoryLocker for SledChannelAccountStore {
    async fn try_acquire(&self, lock_id: i64) -> StoreResult<Option<AdvisoryLease>> {
        let key = lock_id.to_be_bytes();
        let owner = Uuid::new_v4();
        let ttl = self.advisory_ttl;
        let now = now_ms();

        let current = self.advisory.get(key).map_err(backend)?;
        if let Some(existing) = &current {
            let held = serde_json::from_slice::<AdvisoryRecord>(existing)
                .map(|r| now < r.expires_at_ms)
                .unwrap_or(false);
            if held {
                return Ok(None);
            }
            warn!(lock_id, "taking over an expired advisory lock");
        }

        let record = AdvisoryRecord::encode(owner, ttl)?;
        let swapped = self
            .advisory
            .compare_and_swap(key, current, Some(record.clone()))
            .map_err(backend)?;
        if swapped.is_err() {
            debug!(lock_id, "advisory lock taken by a concurrent holder");
            return Ok(None);
        }

        // the record this lease last wrote; renew and release compare against it
        let held = Arc::new(Mutex::new(record));

        let tree = self.advisory.clone();
        let renew_held = held.clone();
        let renew = move || {
            let mut record = renew_held.lock();
            let Ok(next) = AdvisoryRecord::encode(owner, ttl) else {
                return false;
            };
            match tree.compare_and_swap(key, Some(record.clone()), Some(next.clone())) {
                Ok(Ok(())) => {
                    *record = next;
                    true
                }
                _ => {
                    warn!(lock_id, "advisory lock was taken over before it could be renewed");
                    false
                }
            }
        };

        let tree = self.advisory.clone();
        let release = move || {
            let record = held.lock().clone();
            let released = tree.compare_and_swap(key, Some(record), None::<Vec<u8>>);
            if !matches!(released, Ok(Ok(()))) {
                warn!(lock_id, "advisory lock was no longer held by this lease on release");
            }
        };

        Ok(Some(AdvisoryLease::new(lock_id, release).with_renewal(renew)))
    }
}
