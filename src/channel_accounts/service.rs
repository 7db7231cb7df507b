use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument, Span};

use super::on_chain::{
    add_trustlines, create_and_fund_account, create_channel_accounts_on_chain,
    delete_channel_account_on_chain,
};
use super::retry::RetryConfig;
use super::{
    LifecycleError, LifecyclePhase, LifecycleResult, MAXIMUM_CREATE_ACCOUNT_OPERATIONS_PER_TX,
    MAX_NUMBER_OF_CHANNEL_ACCOUNTS, MIN_NUMBER_OF_CHANNEL_ACCOUNTS,
};
use crate::engine::{SubmitterEngine, INCREMENT_FOR_MAX_LEDGER_BOUNDS};
use crate::metrics::metrics;
use crate::observability::CorrelationId;
use crate::store::{
    AdvisoryLease, AdvisoryLocker, ChannelAccount, ChannelAccountStore, CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID,
};
use crate::transaction::Asset;

/// Which channel accounts [`ChannelAccountsService::delete_channel_account`] removes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteChannelAccountsOptions {
    pub channel_account_id: Option<String>,
    pub delete_all: bool,
}

impl DeleteChannelAccountsOptions {
    pub fn by_id(public_key: impl Into<String>) -> Self {
        Self {
            channel_account_id: Some(public_key.into()),
            delete_all: false,
        }
    }

    pub fn all() -> Self {
        Self {
            channel_account_id: None,
            delete_all: true,
        }
    }
}

/// Outcome of [`ChannelAccountsService::verify_channel_accounts`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub total: usize,
    /// Rows whose account no longer exists on the network
    pub invalid: usize,
    pub deleted: usize,
}

/// Operator commands over the channel-account pool.
///
/// Each public command validates the engine and holds the pool's advisory
/// lease for its whole duration. Commands that call each other go through
/// the `*_locked` helpers so the lease is only taken once.
#[derive(Clone)]
pub struct ChannelAccountsService {
    pub engine: SubmitterEngine,
    pub store: Arc<dyn ChannelAccountStore>,
    pub advisory_locker: Arc<dyn AdvisoryLocker>,
}

impl ChannelAccountsService {
    pub fn new(
        engine: SubmitterEngine,
        store: Arc<dyn ChannelAccountStore>,
        advisory_locker: Arc<dyn AdvisoryLocker>,
    ) -> Self {
        Self {
            engine,
            store,
            advisory_locker,
        }
    }

    fn command_span(phase: LifecyclePhase) -> Span {
        info_span!(
            "channel_accounts",
            command = %phase,
            correlation_id = %CorrelationId::new()
        )
    }

    async fn acquire_lease(&self, phase: LifecyclePhase) -> LifecycleResult<AdvisoryLease> {
        self.engine
            .validate()
            .map_err(|e| LifecycleError::failed(phase, "validating submitter engine", e))?;

        match self
            .advisory_locker
            .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
            .await
        {
            Ok(Some(lease)) => Ok(lease),
            Ok(None) => Err(LifecycleError::AdvisoryLockUnavailable {
                phase,
                lock_id: CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID,
            }),
            Err(e) => Err(LifecycleError::failed(phase, "acquiring advisory lock", e)),
        }
    }

    /// Push the advisory lock's expiry forward before the next on-chain step.
    fn renew_lease(lease: &AdvisoryLease, phase: LifecyclePhase) -> LifecycleResult<()> {
        if lease.renew() {
            return Ok(());
        }
        Err(LifecycleError::AdvisoryLockLost {
            phase,
            lock_id: lease.lock_id(),
        })
    }

    async fn lease_until(&self, phase: LifecyclePhase) -> LifecycleResult<(u32, u32)> {
        let current = self
            .engine
            .ledger_tracker
            .get_ledger_number()
            .await
            .map_err(|e| LifecycleError::failed(phase, "getting current ledger number", e))?;
        Ok((current, current.saturating_add(INCREMENT_FOR_MAX_LEDGER_BOUNDS)))
    }

    /// Create `count` sponsored channel accounts and leave them unlocked and
    /// ready for use. Returns their public keys.
    pub async fn create_channel_accounts(&self, count: usize) -> LifecycleResult<Vec<String>> {
        let phase = LifecyclePhase::Create;
        async {
            let lease = self.acquire_lease(phase).await?;
            self.create_locked(&lease, count).await
        }
        .instrument(Self::command_span(phase))
        .await
    }

    async fn create_locked(&self, lease: &AdvisoryLease, count: usize) -> LifecycleResult<Vec<String>> {
        let phase = LifecyclePhase::Create;
        if count < MIN_NUMBER_OF_CHANNEL_ACCOUNTS {
            return Err(LifecycleError::invalid(phase, "invalid number of channel accounts to create"));
        }

        let mut created = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            Self::renew_lease(lease, phase)?;
            let batch = remaining.min(MAXIMUM_CREATE_ACCOUNT_OPERATIONS_PER_TX);
            info!(batch, remaining, "creating channel account batch");
            let keys = create_channel_accounts_on_chain(&self.engine, batch).await?;

            for public_key in keys {
                self.store
                    .unlock(&public_key)
                    .await
                    .map_err(|e| LifecycleError::account(phase, &public_key, "unlocking channel account", e))?;
                info!(public_key = %public_key, "channel account is ready for use");
                created.push(public_key);
            }
            remaining -= batch;
        }
        Ok(created)
    }

    /// Delete one account by id, or every account with `delete_all`.
    /// Returns how many were deleted.
    pub async fn delete_channel_account(&self, opts: DeleteChannelAccountsOptions) -> LifecycleResult<usize> {
        let phase = LifecyclePhase::Delete;
        async {
            let lease = self.acquire_lease(phase).await?;

            if let Some(public_key) = opts.channel_account_id.as_deref() {
                let (current, locked_until) = self.lease_until(phase).await?;
                let account = self
                    .store
                    .get_and_lock(public_key, current, locked_until)
                    .await
                    .map_err(|e| LifecycleError::account(phase, public_key, "retrieving channel account", e))?;
                self.delete_account_locked(&account.public_key, locked_until).await?;
                return Ok(1);
            }

            if opts.delete_all {
                let count = self
                    .store
                    .count()
                    .await
                    .map_err(|e| LifecycleError::failed(phase, "counting channel accounts", e))?;
                return self.delete_up_to_locked(&lease, count).await;
            }

            warn!("no channel account was selected for deletion, pass an id or delete all");
            Ok(0)
        }
        .instrument(Self::command_span(phase))
        .await
    }

    /// Lock and delete available accounts one at a time until `limit` are
    /// gone or none are left.
    async fn delete_up_to_locked(&self, lease: &AdvisoryLease, limit: usize) -> LifecycleResult<usize> {
        let phase = LifecyclePhase::Delete;
        let mut deleted = 0;
        while deleted < limit {
            Self::renew_lease(lease, phase)?;
            let (current, locked_until) = self.lease_until(phase).await?;
            let accounts = self
                .store
                .get_and_lock_all(current, locked_until, 1)
                .await
                .map_err(|e| LifecycleError::failed(phase, "retrieving channel accounts", e))?;
            let Some(account) = accounts.into_iter().next() else {
                warn!(deleted, requested = limit, "no channel accounts available to delete");
                break;
            };
            self.delete_account_locked(&account.public_key, locked_until).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn delete_account_locked(&self, public_key: &str, locked_until_ledger: u32) -> LifecycleResult<()> {
        let phase = LifecyclePhase::Delete;
        match self.engine.network_client.account_detail(public_key).await {
            Err(e) if e.is_not_found() => {
                info!(public_key = %public_key, "account not found on the network, removing it from the signature service only");
                self.engine
                    .signature_service
                    .delete(public_key, locked_until_ledger)
                    .await
                    .map_err(|e| LifecycleError::account(phase, public_key, "deleting from the signature service", e))?;
            }
            Err(e) => {
                return Err(LifecycleError::account(
                    phase,
                    public_key,
                    "retrieving account details for",
                    e,
                ));
            }
            Ok(_) => delete_channel_account_on_chain(&self.engine, public_key, locked_until_ledger).await?,
        }
        metrics().channel_accounts_deleted.inc();
        info!(public_key = %public_key, "channel account deleted");
        Ok(())
    }

    /// Check every stored account against the network, optionally deleting
    /// rows whose account no longer exists.
    pub async fn verify_channel_accounts(&self, delete_invalid: bool) -> LifecycleResult<VerificationReport> {
        let phase = LifecyclePhase::Verify;
        async {
            let lease = self.acquire_lease(phase).await?;

            let accounts = self
                .store
                .get_all(0, 0)
                .await
                .map_err(|e| LifecycleError::failed(phase, "retrieving channel accounts", e))?;
            let mut report = VerificationReport {
                total: accounts.len(),
                ..VerificationReport::default()
            };
            info!(total = report.total, "verifying channel accounts");

            for account in &accounts {
                Self::renew_lease(&lease, phase)?;
                let public_key = account.public_key.as_str();
                match self.engine.network_client.account_detail(public_key).await {
                    Ok(_) => continue,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        return Err(LifecycleError::account(phase, public_key, "retrieving account details for", e));
                    }
                }

                report.invalid += 1;
                if !delete_invalid {
                    warn!(public_key = %public_key, "account does not exist on the network, rerun with delete-invalid to remove it");
                    continue;
                }
                warn!(public_key = %public_key, "account does not exist on the network, deleting it");
                self.store
                    .delete(public_key)
                    .await
                    .map_err(|e| LifecycleError::account(phase, public_key, "deleting invalid channel account", e))?;
                report.deleted += 1;
            }

            info!(
                total = report.total,
                invalid = report.invalid,
                deleted = report.deleted,
                "channel account verification finished"
            );
            Ok(report)
        }
        .instrument(Self::command_span(phase))
        .await
    }

    /// Create or delete accounts until the pool holds exactly `count`.
    pub async fn ensure_channel_accounts_count(&self, count: usize) -> LifecycleResult<()> {
        let phase = LifecyclePhase::Ensure;
        async {
            let lease = self.acquire_lease(phase).await?;

            if count > MAX_NUMBER_OF_CHANNEL_ACCOUNTS {
                return Err(LifecycleError::invalid(
                    phase,
                    format!(
                        "count {} exceeds the maximum of {} channel accounts",
                        count, MAX_NUMBER_OF_CHANNEL_ACCOUNTS
                    ),
                ));
            }
            if count < MIN_NUMBER_OF_CHANNEL_ACCOUNTS {
                return Err(LifecycleError::invalid(
                    phase,
                    format!(
                        "count {} is below the minimum of {} channel accounts",
                        count, MIN_NUMBER_OF_CHANNEL_ACCOUNTS
                    ),
                ));
            }

            let existing = self
                .store
                .count()
                .await
                .map_err(|e| LifecycleError::failed(phase, "counting channel accounts", e))?;
            info!(existing, desired = count, "ensuring channel account count");

            if existing == count {
                info!("there are exactly {} channel accounts, nothing to do", count);
                return Ok(());
            }
            if existing > count {
                let to_delete = existing - count;
                info!(to_delete, "deleting surplus channel accounts");
                self.delete_up_to_locked(&lease, to_delete)
                    .await
                    .map_err(|e| e.in_phase(phase))?;
            } else {
                let to_create = count - existing;
                info!(to_create, "creating missing channel accounts");
                self.create_locked(&lease, to_create).await.map_err(|e| e.in_phase(phase))?;
            }
            Ok(())
        }
        .instrument(Self::command_span(phase))
        .await
    }

    pub async fn list_channel_accounts(&self) -> LifecycleResult<Vec<ChannelAccount>> {
        let phase = LifecyclePhase::List;
        async {
            let _lease = self.acquire_lease(phase).await?;
            let accounts = self
                .store
                .get_all(0, 0)
                .await
                .map_err(|e| LifecycleError::failed(phase, "retrieving channel accounts", e))?;
            for account in &accounts {
                info!(
                    public_key = %account.public_key,
                    locked_until_ledger = ?account.locked_until_ledger,
                    "channel account"
                );
            }
            info!(count = accounts.len(), "listed channel accounts");
            Ok(accounts)
        }
        .instrument(Self::command_span(phase))
        .await
    }

    /// Fund `destination` from the host distribution account.
    pub async fn create_and_fund_account(
        &self,
        amount: &str,
        destination: &str,
        retry: &RetryConfig,
    ) -> LifecycleResult<()> {
        let phase = LifecyclePhase::Fund;
        async {
            let _lease = self.acquire_lease(phase).await?;
            let host = self
                .engine
                .host_distribution_account()
                .await
                .map_err(|e| LifecycleError::failed(phase, "resolving host distribution account", e))?;
            create_and_fund_account(&self.engine, amount, &host, destination, retry).await
        }
        .instrument(Self::command_span(phase))
        .await
    }

    pub async fn add_trustlines(&self, account: &str, assets: &[Asset]) -> LifecycleResult<usize> {
        let phase = LifecyclePhase::Trustline;
        async {
            let _lease = self.acquire_lease(phase).await?;
            add_trustlines(&self.engine, account, assets).await
        }
        .instrument(Self::command_span(phase))
        .await
    }
}

impl std::fmt::Debug for ChannelAccountsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAccountsService")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::engine::SubmissionError;
    use crate::test_utils::TestHarness;

    #[tokio::test]
    async fn test_create_runs_in_batches_and_unlocks() {
        let harness = TestHarness::new(100);
        let service = harness.service();

        let keys = service.create_channel_accounts(25).await.unwrap();
        assert_eq!(keys.len(), 25);
        assert_eq!(harness.network.submitted().len(), 2);
        for key in &keys {
            let row = harness.store.get(key, 0).await.unwrap();
            assert_eq!(row.locked_until_ledger, None);
            assert!(harness.network.has_account(key));
        }
        assert!(service.create_channel_accounts(0).await.is_err());
    }

    #[tokio::test]
    async fn test_commands_fail_while_lease_is_held() {
        let harness = TestHarness::new(100);
        let service = harness.service();

        let lease = harness
            .store
            .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
            .await
            .unwrap()
            .unwrap();
        let err = service.create_channel_accounts(1).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::AdvisoryLockUnavailable {
                phase: LifecyclePhase::Create,
                ..
            }
        ));
        assert_eq!(harness.store.count().await.unwrap(), 0);

        drop(lease);
        assert_eq!(service.create_channel_accounts(1).await.unwrap().len(), 1);
        // released after the command returns
        assert!(harness
            .store
            .try_acquire(CHANNEL_ACCOUNTS_ADVISORY_LOCK_ID)
            .await
            .unwrap()
            .is_some());
    }

    /// Hands out leases that renew `renewals` times and then report the lock lost.
    struct ExpiringLocker {
        renewals: u32,
    }

    #[async_trait::async_trait]
    impl AdvisoryLocker for ExpiringLocker {
        async fn try_acquire(&self, lock_id: i64) -> crate::store::StoreResult<Option<AdvisoryLease>> {
            let left = Arc::new(std::sync::atomic::AtomicU32::new(self.renewals));
            Ok(Some(AdvisoryLease::new(lock_id, || {}).with_renewal(move || {
                left.fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |n| n.checked_sub(1),
                )
                .is_ok()
            })))
        }
    }

    #[tokio::test]
    async fn test_long_commands_stop_when_the_lease_is_lost() {
        let harness = TestHarness::new(100);
        let service = ChannelAccountsService::new(
            harness.engine(),
            harness.store.clone(),
            Arc::new(ExpiringLocker { renewals: 1 }),
        );

        // first batch renews, the second finds the lock gone
        let err = service.create_channel_accounts(25).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::AdvisoryLockLost {
                phase: LifecyclePhase::Create,
                ..
            }
        ));
        assert_eq!(harness.store.count().await.unwrap(), 19);
        assert_eq!(harness.network.submitted().len(), 1);

        let service = ChannelAccountsService::new(
            harness.engine(),
            harness.store.clone(),
            Arc::new(ExpiringLocker { renewals: 2 }),
        );
        let err = service
            .delete_channel_account(DeleteChannelAccountsOptions::all())
            .await
            .unwrap_err();
        assert_eq!(err.phase(), LifecyclePhase::Delete);
        assert_eq!(harness.store.count().await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_engine_is_validated_before_work() {
        let harness = TestHarness::new(100);
        let mut service = harness.service();
        service.engine.max_base_fee = 10;
        assert!(service.list_channel_accounts().await.is_err());
    }

    #[tokio::test]
    async fn test_delete_by_id() {
        let harness = TestHarness::new(100);
        let service = harness.service();
        let keys = service.create_channel_accounts(2).await.unwrap();

        let deleted = service
            .delete_channel_account(DeleteChannelAccountsOptions::by_id(keys[0].clone()))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!harness.network.has_account(&keys[0]));
        assert_eq!(harness.store.count().await.unwrap(), 1);

        let missing = service
            .delete_channel_account(DeleteChannelAccountsOptions::by_id("GMISSING"))
            .await
            .unwrap_err();
        assert_eq!(missing.public_key(), Some("GMISSING"));
    }

    #[tokio::test]
    async fn test_delete_account_missing_on_network_only_removes_row() {
        let harness = TestHarness::new(100);
        let service = harness.service();
        let orphan = Keypair::random();
        harness.store.insert(orphan.address(), orphan.secret_seed().as_str()).await.unwrap();

        service
            .delete_channel_account(DeleteChannelAccountsOptions::by_id(orphan.address()))
            .await
            .unwrap();
        assert_eq!(harness.store.count().await.unwrap(), 0);
        assert!(harness.network.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_delete_aborts_on_unexpected_account_lookup_error() {
        let harness = TestHarness::new(100);
        let service = harness.service();
        let keys = service.create_channel_accounts(1).await.unwrap();
        harness
            .network
            .fail_account_detail(&keys[0], SubmissionError::status(500, "Internal Server Error"));

        let err = service
            .delete_channel_account(DeleteChannelAccountsOptions::by_id(keys[0].clone()))
            .await
            .unwrap_err();
        assert_eq!(err.phase(), LifecyclePhase::Delete);
        assert_eq!(harness.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_and_nothing_selected() {
        let harness = TestHarness::new(100);
        let service = harness.service();
        service.create_channel_accounts(3).await.unwrap();

        let none = service
            .delete_channel_account(DeleteChannelAccountsOptions::default())
            .await
            .unwrap();
        assert_eq!(none, 0);

        let deleted = service
            .delete_channel_account(DeleteChannelAccountsOptions::all())
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(harness.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verify_reports_and_deletes_invalid() {
        let harness = TestHarness::new(100);
        let service = harness.service();
        let keys = service.create_channel_accounts(3).await.unwrap();
        harness.network.remove_account(&keys[1]);

        let report = service.verify_channel_accounts(false).await.unwrap();
        assert_eq!(
            report,
            VerificationReport {
                total: 3,
                invalid: 1,
                deleted: 0
            }
        );
        assert_eq!(harness.store.count().await.unwrap(), 3);

        let report = service.verify_channel_accounts(true).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(harness.store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ensure_count_grows_and_shrinks() {
        let harness = TestHarness::new(100);
        let service = harness.service();

        service.ensure_channel_accounts_count(4).await.unwrap();
        assert_eq!(harness.store.count().await.unwrap(), 4);

        service.ensure_channel_accounts_count(4).await.unwrap();
        assert_eq!(harness.network.submitted().len(), 1);

        service.ensure_channel_accounts_count(1).await.unwrap();
        assert_eq!(harness.store.count().await.unwrap(), 1);

        assert!(matches!(
            service.ensure_channel_accounts_count(0).await,
            Err(LifecycleError::InvalidRequest {
                phase: LifecyclePhase::Ensure,
                ..
            })
        ));
        assert!(service.ensure_channel_accounts_count(1001).await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_fund() {
        let harness = TestHarness::new(100);
        let service = harness.service();
        service.create_channel_accounts(2).await.unwrap();
        assert_eq!(service.list_channel_accounts().await.unwrap().len(), 2);

        let destination = Keypair::random();
        service
            .create_and_fund_account("10", destination.address(), &RetryConfig::none())
            .await
            .unwrap();
        assert!(harness.network.has_account(destination.address()));
    }
}
