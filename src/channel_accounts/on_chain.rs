//! Transactions that create, fund and merge accounts on the network.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::retry::{retry_if, RetryConfig};
use super::{
    LifecycleCause, LifecycleError, LifecyclePhase, LifecycleResult, CHANNEL_ACCOUNT_TX_TIMEOUT_SECS,
    CREATE_AND_FUND_TX_TIMEOUT_SECS, DEFAULT_REVOKE_SPONSORSHIP_RESERVE_AMOUNT,
    MAXIMUM_CREATE_ACCOUNT_OPERATIONS_PER_TX,
};
use crate::engine::SubmitterEngine;
use crate::metrics::metrics;
use crate::network::SubmitOptions;
use crate::signing::SignatureService;
use crate::transaction::{
    parse_amount, Asset, LedgerBounds, Operation, TimeBounds, Transaction, TransactionParams,
};

const SUBMIT_OPTIONS: SubmitOptions = SubmitOptions {
    skip_memo_required_check: true,
};

/// Compensation for a batch of freshly inserted channel accounts.
///
/// Keys tracked here are deleted from the signature service by
/// [`RollbackScope::rollback`] unless the scope is committed first. Rollback
/// failures are logged and never surface to the caller, so the error that
/// triggered the rollback is the one reported.
pub struct RollbackScope {
    signature_service: Arc<dyn SignatureService>,
    host_account: String,
    locked_until_ledger: u32,
    inserted: Vec<String>,
    settled: bool,
}

impl RollbackScope {
    pub fn new(
        signature_service: Arc<dyn SignatureService>,
        host_account: impl Into<String>,
        locked_until_ledger: u32,
    ) -> Self {
        Self {
            signature_service,
            host_account: host_account.into(),
            locked_until_ledger,
            inserted: Vec::new(),
            settled: false,
        }
    }

    pub fn track<I: IntoIterator<Item = String>>(&mut self, public_keys: I) {
        self.inserted.extend(public_keys);
    }

    pub fn tracked(&self) -> &[String] {
        &self.inserted
    }

    /// Keep the tracked accounts.
    pub fn commit(mut self) -> Vec<String> {
        self.settled = true;
        std::mem::take(&mut self.inserted)
    }

    /// Delete every tracked account except the host. Returns how many were removed.
    pub async fn rollback(mut self) -> usize {
        self.settled = true;
        let mut removed = 0;
        for public_key in std::mem::take(&mut self.inserted) {
            if public_key == self.host_account {
                continue;
            }
            match self
                .signature_service
                .delete(&public_key, self.locked_until_ledger)
                .await
            {
                Ok(()) => {
                    removed += 1;
                    metrics().channel_account_rollbacks.inc();
                    debug!(public_key = %public_key, "rolled back channel account");
                }
                Err(e) => {
                    error!(public_key = %public_key, error = %e, "failed to roll back channel account");
                }
            }
        }
        removed
    }
}

impl Drop for RollbackScope {
    fn drop(&mut self) {
        if !self.settled && !self.inserted.is_empty() {
            warn!(
                accounts = self.inserted.len(),
                locked_until_ledger = self.locked_until_ledger,
                "rollback scope dropped unsettled, rows stay locked until their lease expires"
            );
        }
    }
}

async fn host_account(engine: &SubmitterEngine, phase: LifecyclePhase) -> LifecycleResult<String> {
    engine
        .host_distribution_account()
        .await
        .map_err(|e| LifecycleError::failed(phase, "resolving host distribution account", e))
}

async fn ledger_bounds(engine: &SubmitterEngine, phase: LifecyclePhase) -> LifecycleResult<LedgerBounds> {
    engine
        .ledger_tracker
        .get_ledger_bounds()
        .await
        .map_err(|e| LifecycleError::failed(phase, "getting ledger bounds", e))
}

/// Create up to [`MAXIMUM_CREATE_ACCOUNT_OPERATIONS_PER_TX`] sponsored
/// channel accounts in one transaction.
///
/// The new rows are inserted locked before anything is submitted; if any
/// later step fails they are deleted again and the error is returned.
/// Bounds are read before the insert, so the transaction never outlives
/// the rows' lease.
pub async fn create_channel_accounts_on_chain(
    engine: &SubmitterEngine,
    count: usize,
) -> LifecycleResult<Vec<String>> {
    let phase = LifecyclePhase::Create;
    if count > MAXIMUM_CREATE_ACCOUNT_OPERATIONS_PER_TX {
        return Err(LifecycleError::invalid(
            phase,
            format!(
                "cannot create more than {} channel accounts in one transaction",
                MAXIMUM_CREATE_ACCOUNT_OPERATIONS_PER_TX
            ),
        ));
    }
    if count == 0 {
        return Err(LifecycleError::invalid(phase, "invalid number of channel accounts to create"));
    }

    let host = host_account(engine, phase).await?;
    let host_detail = engine
        .network_client
        .account_detail(&host)
        .await
        .map_err(|e| LifecycleError::account(phase, &host, "retrieving host account", e))?;
    let bounds = ledger_bounds(engine, phase).await?;

    let public_keys = engine
        .signature_service
        .batch_insert(count)
        .await
        .map_err(|e| LifecycleError::failed(phase, "inserting channel accounts into the signature service", e))?;

    let mut scope = RollbackScope::new(engine.signature_service.clone(), host.clone(), bounds.max_ledger);
    scope.track(public_keys.iter().cloned());

    let submitted = async {
        let mut operations = Vec::with_capacity(public_keys.len() * 3);
        for public_key in &public_keys {
            info!(public_key = %public_key, "creating sponsored channel account");
            operations.push(Operation::begin_sponsoring(public_key.as_str()));
            operations.push(Operation::create_account(public_key.as_str(), 0));
            operations.push(Operation::end_sponsoring(public_key.as_str()));
        }

        let mut tx = Transaction::new(TransactionParams {
            source_account: host.clone(),
            sequence: host_detail.sequence,
            increment_sequence_num: true,
            base_fee: engine.max_base_fee,
            time_bounds: Some(TimeBounds::with_timeout(CHANNEL_ACCOUNT_TX_TIMEOUT_SECS)),
            ledger_bounds: Some(bounds),
            operations,
        })
        .map_err(|e| LifecycleError::failed(phase, "building channel account creation transaction", e))?;

        let mut signers = public_keys.clone();
        signers.push(host.clone());
        engine
            .signature_service
            .sign_transaction(&mut tx, &signers)
            .await
            .map_err(|e| {
                LifecycleError::failed(
                    phase,
                    format!("signing account creation transaction with accounts {:?}", public_keys),
                    e,
                )
            })?;

        engine
            .network_client
            .submit_transaction_with_options(&tx, SUBMIT_OPTIONS)
            .await
            .map_err(|e| LifecycleError::failed(phase, "submitting sponsored channel account creation", e))?;
        Ok::<_, LifecycleError>(())
    }
    .await;

    match submitted {
        Ok(()) => {
            metrics().transactions_submitted.inc();
            metrics().channel_accounts_created.inc_by(public_keys.len() as u64);
            info!(count = public_keys.len(), "created sponsored channel accounts");
            Ok(scope.commit())
        }
        Err(err) => {
            let removed = scope.rollback().await;
            warn!(error = %err, removed, "channel account creation failed, rolled back inserted accounts");
            Err(err)
        }
    }
}

/// Return the reserve, revoke sponsorship and merge `public_key` back into
/// the host, then remove it from the signature service.
///
/// `locked_until_ledger` must be the lease the caller took on the row.
pub async fn delete_channel_account_on_chain(
    engine: &SubmitterEngine,
    public_key: &str,
    locked_until_ledger: u32,
) -> LifecycleResult<()> {
    let phase = LifecyclePhase::Delete;
    let host = host_account(engine, phase).await?;
    let host_detail = engine
        .network_client
        .account_detail(&host)
        .await
        .map_err(|e| LifecycleError::account(phase, &host, "retrieving host account", e))?;
    // valid only while the caller's lease on the row holds
    let bounds = LedgerBounds {
        min_ledger: 0,
        max_ledger: locked_until_ledger,
    };

    let reserve = parse_amount(DEFAULT_REVOKE_SPONSORSHIP_RESERVE_AMOUNT)
        .map_err(|e| LifecycleError::account(phase, public_key, "computing reserve refund for", e))?;

    let mut tx = Transaction::new(TransactionParams {
        source_account: host.clone(),
        sequence: host_detail.sequence,
        increment_sequence_num: true,
        base_fee: engine.max_base_fee,
        time_bounds: Some(TimeBounds::with_timeout(CHANNEL_ACCOUNT_TX_TIMEOUT_SECS)),
        ledger_bounds: Some(bounds),
        operations: vec![
            Operation::payment(public_key, Asset::Native, reserve).with_source(host.as_str()),
            Operation::revoke_account_sponsorship(public_key),
            Operation::account_merge(host.as_str(), public_key),
        ],
    })
    .map_err(|e| LifecycleError::account(phase, public_key, "constructing remove account transaction for", e))?;

    engine
        .signature_service
        .sign_transaction(&mut tx, &[public_key.to_string(), host.clone()])
        .await
        .map_err(|e| LifecycleError::account(phase, public_key, "signing remove account transaction for", e))?;

    engine
        .network_client
        .submit_transaction_with_options(&tx, SUBMIT_OPTIONS)
        .await
        .map_err(|e| {
            LifecycleError::account(phase, public_key, "submitting remove account transaction for", e)
        })?;
    metrics().transactions_submitted.inc();

    engine
        .signature_service
        .delete(public_key, locked_until_ledger)
        .await
        .map_err(|e| LifecycleError::account(phase, public_key, "deleting from the signature service", e))?;
    Ok(())
}

fn is_retryable_funding_error(err: &LifecycleError) -> bool {
    match err.cause() {
        Some(LifecycleCause::Submission(e)) => e.is_transport() || !e.should_mark_as_error(),
        _ => false,
    }
}

/// Create and fund `destination` from `source` with `amount` native units,
/// retrying transient submission failures per `retry`, then confirm the
/// destination exists.
pub async fn create_and_fund_account(
    engine: &SubmitterEngine,
    amount: &str,
    source: &str,
    destination: &str,
    retry: &RetryConfig,
) -> LifecycleResult<()> {
    let phase = LifecyclePhase::Fund;
    if source == destination {
        return Err(LifecycleError::invalid(
            phase,
            format!("funding source account and destination account cannot be the same: {}", source),
        ));
    }
    let starting_balance = parse_amount(amount)
        .map_err(|e| LifecycleError::account(phase, destination, "parsing funding amount for", e))?;
    let host = host_account(engine, phase).await?;

    retry_if(
        "create_and_fund_account",
        retry,
        || async {
            let source_detail = engine
                .network_client
                .account_detail(source)
                .await
                .map_err(|e| LifecycleError::account(phase, source, "getting details for source account", e))?;

            let mut tx = Transaction::new(TransactionParams {
                source_account: source.to_string(),
                sequence: source_detail.sequence,
                increment_sequence_num: true,
                base_fee: engine.max_base_fee,
                time_bounds: Some(TimeBounds::with_timeout(CREATE_AND_FUND_TX_TIMEOUT_SECS)),
                ledger_bounds: None,
                operations: vec![Operation::create_account(destination, starting_balance)],
            })
            .map_err(|e| LifecycleError::account(phase, destination, "creating create account tx for", e))?;

            engine
                .signature_service
                .sign_transaction(&mut tx, std::slice::from_ref(&host))
                .await
                .map_err(|e| LifecycleError::account(phase, destination, "signing create account tx for", e))?;

            engine
                .network_client
                .submit_transaction_with_options(&tx, SUBMIT_OPTIONS)
                .await
                .map_err(|e| LifecycleError::account(phase, destination, "submitting create account tx for", e))?;
            metrics().transactions_submitted.inc();
            Ok::<(), LifecycleError>(())
        },
        is_retryable_funding_error,
    )
    .await?;

    engine
        .network_client
        .account_detail(destination)
        .await
        .map_err(|e| LifecycleError::account(phase, destination, "getting details for destination account", e))?;
    info!(destination = %destination, amount = %amount, "account created and funded");
    Ok(())
}

/// Add a trustline on `account` for every non-native asset it does not
/// already trust. Returns how many trustlines were added.
pub async fn add_trustlines(engine: &SubmitterEngine, account: &str, assets: &[Asset]) -> LifecycleResult<usize> {
    let phase = LifecyclePhase::Trustline;
    if account.is_empty() {
        return Err(LifecycleError::invalid(phase, "transaction account address cannot be empty"));
    }

    let candidates: BTreeMap<String, &Asset> = assets
        .iter()
        .filter(|a| !a.is_native())
        .map(|a| (a.id(), a))
        .collect();
    if candidates.is_empty() {
        return Ok(0);
    }

    let detail = engine
        .network_client
        .account_detail(account)
        .await
        .map_err(|e| LifecycleError::account(phase, account, "getting account details for", e))?;
    let existing = detail.trustline_ids();

    let operations: Vec<Operation> = candidates
        .into_iter()
        .filter(|(id, _)| {
            let present = existing.contains(id);
            if present {
                debug!(account = %account, asset = %id, "trustline already present, skipping");
            }
            !present
        })
        .map(|(_, asset)| Operation::change_trust(asset.clone(), i64::MAX).with_source(account))
        .collect();
    if operations.is_empty() {
        info!(account = %account, "account already has trustlines for all provided assets");
        return Ok(0);
    }
    let added = operations.len();

    let mut tx = Transaction::new(TransactionParams {
        source_account: account.to_string(),
        sequence: detail.sequence,
        increment_sequence_num: true,
        base_fee: engine.max_base_fee,
        time_bounds: Some(TimeBounds::with_timeout(20)),
        ledger_bounds: None,
        operations,
    })
    .map_err(|e| LifecycleError::account(phase, account, "creating change trust transaction for", e))?;

    engine
        .signature_service
        .sign_transaction(&mut tx, &[account.to_string()])
        .await
        .map_err(|e| LifecycleError::account(phase, account, "signing change trust transaction for", e))?;

    info!(account = %account, trustlines = added, "adding trustlines");
    engine
        .network_client
        .submit_transaction_with_options(&tx, SUBMIT_OPTIONS)
        .await
        .map_err(|e| LifecycleError::account(phase, account, "submitting change trust transaction for", e))?;
    metrics().transactions_submitted.inc();
    Ok(added)
}
