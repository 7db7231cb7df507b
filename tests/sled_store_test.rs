//! Durability of the sled-backed pool across reopen

use std::time::Duration;

use tss_engine::store::{
    AdvisoryLocker, ChannelAccountStore, NewChannelAccount, SledChannelAccountStore, StoreError,
    CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID,
};

fn rows(n: usize) -> Vec<NewChannelAccount> {
    (0..n)
        .map(|i| NewChannelAccount {
            public_key: format!("GCHANNEL{:02}", i),
            private_key: format!("encrypted-{}", i),
        })
        .collect()
}

#[tokio::test]
async fn test_rows_and_leases_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = SledChannelAccountStore::open(dir.path()).unwrap();
        store.batch_insert_and_lock(rows(3), 100, 110).await.unwrap();
        store.unlock("GCHANNEL01").await.unwrap();
        store.flush().await.unwrap();
    }

    let store = SledChannelAccountStore::open(dir.path()).unwrap();
    assert_eq!(store.count().await.unwrap(), 3);

    // only the unlocked row is available while the lease holds
    let available = store.get_all(105, 0).await.unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].public_key, "GCHANNEL01");

    // leases end on their own once the ledger moves past them
    assert_eq!(store.get_all(111, 0).await.unwrap().len(), 3);
    let row = store.get("GCHANNEL00", 0).await.unwrap();
    assert_eq!(row.locked_until_ledger, Some(110));
    assert_eq!(row.private_key, "encrypted-0");
}

#[tokio::test]
async fn test_conflicting_batch_is_rejected_whole() {
    let store = SledChannelAccountStore::temporary().unwrap();
    store.batch_insert(rows(2)).await.unwrap();

    let mut batch = rows(4);
    batch.drain(..1);
    let err = store.batch_insert(batch).await.unwrap_err();
    assert_eq!(err, StoreError::AlreadyExists("GCHANNEL01".to_string()));
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_advisory_lock_is_shared_by_handles_on_one_database() {
    let first = SledChannelAccountStore::temporary().unwrap();
    let second = first.clone();

    let lease = first
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .expect("lock is free");
    assert!(second
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .is_none());
    // other lock ids are independent
    assert!(second.try_acquire(7).await.unwrap().is_some());

    drop(lease);
    assert!(second
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_expired_advisory_lock_is_taken_over() {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let crashed = SledChannelAccountStore::from_db(db.clone())
        .unwrap()
        .with_advisory_ttl(Duration::from_millis(50));
    let survivor = SledChannelAccountStore::from_db(db).unwrap();

    // a holder that never released or renewed, e.g. a killed process
    let stale = crashed
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .expect("lock is free");
    std::mem::forget(stale);
    assert!(survivor
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let lease = survivor
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap();
    assert!(lease.is_some());
    // the new holder's expiry is its own
    assert!(crashed
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_renewed_advisory_lock_outlives_its_ttl() {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let holder = SledChannelAccountStore::from_db(db.clone())
        .unwrap()
        .with_advisory_ttl(Duration::from_millis(300));
    let replica = SledChannelAccountStore::from_db(db).unwrap();

    let lease = holder
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .expect("lock is free");

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(lease.renew());
    }
    // well past the original expiry, still held
    assert!(replica
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .is_none());

    // once renewals stop the lock can be taken over, and the old lease knows it
    tokio::time::sleep(Duration::from_millis(400)).await;
    let takeover = replica
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .expect("expired lock is free");
    assert!(!lease.renew());

    // the stale lease's release leaves the new holder alone
    drop(lease);
    assert!(holder
        .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
        .await
        .unwrap()
        .is_none());
    drop(takeover);
}
