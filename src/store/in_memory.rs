use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::{
    validate_lease, validate_new_accounts, AdvisoryLease, AdvisoryLocker, ChannelAccount,
    ChannelAccountStore, NewChannelAccount, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<String, ChannelAccount>,
    advisory_locks: HashSet<i64>,
}

/// Thread-safe in-memory pool.
///
/// Clones share the same rows and advisory locks, which is how tests model
/// several service instances pointed at one store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryChannelAccountStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryChannelAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_row(
    row: &mut ChannelAccount,
    current_ledger: u32,
    locked_until_ledger: u32,
) -> StoreResult<ChannelAccount> {
    if row.is_locked(current_ledger) {
        return Err(StoreError::AlreadyLocked(row.public_key.clone()));
    }
    row.apply_lock(current_ledger, locked_until_ledger);
    Ok(row.clone())
}

#[async_trait]
impl ChannelAccountStore for InMemoryChannelAccountStore {
    async fn insert(&self, public_key: &str, private_key: &str) -> StoreResult<()> {
        self.batch_insert(vec![NewChannelAccount {
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
        }])
        .await
    }

    async fn batch_insert(&self, accounts: Vec<NewChannelAccount>) -> StoreResult<()> {
        validate_new_accounts(&accounts)?;
        let mut state = self.state.lock();
        if let Some(dupe) = accounts
            .iter()
            .find(|a| state.accounts.contains_key(&a.public_key))
        {
            return Err(StoreError::AlreadyExists(dupe.public_key.clone()));
        }
        for account in accounts {
            let row = ChannelAccount::new(account.public_key, account.private_key);
            state.accounts.insert(row.public_key.clone(), row);
        }
        Ok(())
    }

    async fn batch_insert_and_lock(
        &self,
        accounts: Vec<NewChannelAccount>,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<()> {
        validate_lease(current_ledger, locked_until_ledger)?;
        validate_new_accounts(&accounts)?;
        let mut state = self.state.lock();
        if let Some(dupe) = accounts
            .iter()
            .find(|a| state.accounts.contains_key(&a.public_key))
        {
            return Err(StoreError::AlreadyExists(dupe.public_key.clone()));
        }
        for account in accounts {
            let mut row = ChannelAccount::new(account.public_key, account.private_key);
            row.apply_lock(current_ledger, locked_until_ledger);
            state.accounts.insert(row.public_key.clone(), row);
        }
        Ok(())
    }

    async fn get(&self, public_key: &str, current_ledger: u32) -> StoreResult<ChannelAccount> {
        let state = self.state.lock();
        state
            .accounts
            .get(public_key)
            .filter(|row| row.is_available(current_ledger))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(public_key.to_string()))
    }

    async fn get_and_lock(
        &self,
        public_key: &str,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<ChannelAccount> {
        self.lock(public_key, current_ledger, locked_until_ledger)
            .await
    }

    async fn get_all(&self, current_ledger: u32, limit: usize) -> StoreResult<Vec<ChannelAccount>> {
        let state = self.state.lock();
        let available = state
            .accounts
            .values()
            .filter(|row| row.is_available(current_ledger))
            .cloned();
        Ok(if limit == 0 {
            available.collect()
        } else {
            available.take(limit).collect()
        })
    }

    async fn get_and_lock_all(
        &self,
        current_ledger: u32,
        locked_until_ledger: u32,
        limit: usize,
    ) -> StoreResult<Vec<ChannelAccount>> {
        validate_lease(current_ledger, locked_until_ledger)?;
        let mut state = self.state.lock();
        let take = if limit == 0 { usize::MAX } else { limit };
        let locked = state
            .accounts
            .values_mut()
            .filter(|row| !row.is_locked(current_ledger))
            .take(take)
            .map(|row| {
                row.apply_lock(current_ledger, locked_until_ledger);
                row.clone()
            })
            .collect();
        Ok(locked)
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.state.lock().accounts.len())
    }

    async fn lock(
        &self,
        public_key: &str,
        current_ledger: u32,
        locked_until_ledger: u32,
    ) -> StoreResult<ChannelAccount> {
        validate_lease(current_ledger, locked_until_ledger)?;
        let mut state = self.state.lock();
        let row = state
            .accounts
            .get_mut(public_key)
            .ok_or_else(|| StoreError::NotFound(public_key.to_string()))?;
        lock_row(row, current_ledger, locked_until_ledger)
    }

    async fn unlock(&self, public_key: &str) -> StoreResult<ChannelAccount> {
        let mut state = self.state.lock();
        let row = state
            .accounts
            .get_mut(public_key)
            .ok_or_else(|| StoreError::NotFound(public_key.to_string()))?;
        row.apply_unlock();
        Ok(row.clone())
    }

    async fn delete(&self, public_key: &str) -> StoreResult<()> {
        self.state
            .lock()
            .accounts
            .remove(public_key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(public_key.to_string()))
    }

    async fn delete_if_locked_until(
        &self,
        public_key: &str,
        locked_until_ledger: u32,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let covered = state
            .accounts
            .get(public_key)
            .is_some_and(|row| row.lock_covers(locked_until_ledger));
        if !covered {
            return Err(StoreError::NotFound(public_key.to_string()));
        }
        state.accounts.remove(public_key);
        Ok(())
    }
}

#[async_trait]
impl AdvisoryLocker for InMemoryChannelAccountStore {
    async fn try_acquire(&self, lock_id: i64) -> StoreResult<Option<AdvisoryLease>> {
        if !self.state.lock().advisory_locks.insert(lock_id) {
            return Ok(None);
        }
        let state = Arc::clone(&self.state);
        Ok(Some(AdvisoryLease::new(lock_id, move || {
            state.lock().advisory_locks.remove(&lock_id);
        })))
    }
}
