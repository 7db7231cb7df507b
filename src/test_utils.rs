//! Test Utilities Module
//!
//! In-process doubles for the network and simulation RPC plus a harness that
//! wires a complete engine around them. The mock network validates
//! signatures and applies operations to an in-memory ledger, so lifecycle
//! tests observe the same accounts a real network would end up with.
//!
//! Only compiled for tests or with the `test_utils` feature.

#![cfg(any(test, feature = "test_utils"))]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::channel_accounts::ChannelAccountsService;
use crate::crypto::{verify_signature, AesGcmEncrypter, Keypair};
use crate::engine::{
    DefaultLedgerNumberTracker, ResultCodes, SubmissionError, SubmitterEngine, MAX_LEDGER_AGE,
};
use crate::network::{
    AccountDetail, Balance, NetworkClient, Root, SimulationClient, SimulationClientError,
    SimulationRequest, SimulationResponse, SubmitOptions, TransactionResult,
};
use crate::signing::DefaultSignatureService;
use crate::store::InMemoryChannelAccountStore;
use crate::transaction::{
    Asset, FeeBumpTransaction, LedgerBounds, Operation, OperationBody, TimeBounds, Transaction,
    TransactionParams, MIN_BASE_FEE,
};

pub const TEST_NETWORK_PASSPHRASE: &str = "Test SDF Network ; September 2015";
pub const TEST_ENCRYPTION_PASSPHRASE: &str = "test-encryption-passphrase";

#[derive(Debug, Clone, Default)]
struct MockAccount {
    sequence: i64,
    trustlines: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct MockLedger {
    current_ledger: u32,
    accounts: HashMap<String, MockAccount>,
    root_failure: Option<SubmissionError>,
    submit_failures: VecDeque<SubmissionError>,
    account_failures: HashMap<String, SubmissionError>,
    submitted: Vec<Transaction>,
}

/// Network double with a tiny ledger behind it.
///
/// Submissions are rejected with `tx_bad_auth` unless the transaction source
/// and every operation source signed, and with `tx_bad_seq` unless the
/// sequence number follows the source account's. Operations apply all or
/// nothing.
pub struct MockNetworkClient {
    network_passphrase: String,
    state: Mutex<MockLedger>,
    root_calls: AtomicUsize,
    submit_calls: AtomicUsize,
}

impl MockNetworkClient {
    pub fn new(current_ledger: u32) -> Self {
        Self {
            network_passphrase: TEST_NETWORK_PASSPHRASE.to_string(),
            state: Mutex::new(MockLedger {
                current_ledger,
                ..MockLedger::default()
            }),
            root_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_ledger(&self, ledger: u32) {
        self.state.lock().current_ledger = ledger;
    }

    pub fn root_calls(&self) -> usize {
        self.root_calls.load(Ordering::SeqCst)
    }

    /// `None` clears a previously injected failure.
    pub fn fail_root(&self, error: Option<SubmissionError>) {
        self.state.lock().root_failure = error;
    }

    pub fn add_account(&self, account_id: &str, sequence: i64) {
        self.state.lock().accounts.insert(
            account_id.to_string(),
            MockAccount {
                sequence,
                trustlines: Vec::new(),
            },
        );
    }

    pub fn remove_account(&self, account_id: &str) {
        self.state.lock().accounts.remove(account_id);
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        self.state.lock().accounts.contains_key(account_id)
    }

    /// Queue an error for the next submission; the call still counts.
    pub fn fail_next_submit(&self, error: SubmissionError) {
        self.state.lock().submit_failures.push_back(error);
    }

    pub fn fail_account_detail(&self, account_id: &str, error: SubmissionError) {
        self.state
            .lock()
            .account_failures
            .insert(account_id.to_string(), error);
    }

    /// Transactions that were accepted, in order.
    pub fn submitted(&self) -> Vec<Transaction> {
        self.state.lock().submitted.clone()
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    fn required_signers(tx: &Transaction) -> Vec<&str> {
        let mut signers = vec![tx.source_account()];
        for op in tx.operations() {
            if let Some(source) = op.source_account.as_deref() {
                if !signers.contains(&source) {
                    signers.push(source);
                }
            }
        }
        signers
    }

    fn failed(transaction: &str, operations: Vec<String>) -> SubmissionError {
        SubmissionError::with_result_codes(
            400,
            ResultCodes {
                transaction: transaction.to_string(),
                operations,
                ..ResultCodes::default()
            },
        )
    }

    fn apply(&self, ledger: &mut MockLedger, tx: &Transaction) -> Result<TransactionResult, SubmissionError> {
        let hash = tx
            .hash(&self.network_passphrase)
            .map_err(|e| SubmissionError::status(400, e.to_string()))?;
        let signed_by = |signer: &str| {
            tx.signatures()
                .iter()
                .any(|s| verify_signature(signer, &hash, &s.signature))
        };
        if !Self::required_signers(tx).into_iter().all(signed_by) {
            return Err(Self::failed("tx_bad_auth", Vec::new()));
        }
        Self::check_bounds(tx, ledger.current_ledger)?;

        let source = tx.source_account().to_string();
        let Some(source_account) = ledger.accounts.get(&source) else {
            return Err(Self::failed("tx_no_source_account", Vec::new()));
        };
        if source_account.sequence.checked_add(1) != Some(tx.body().seq_num) {
            return Err(Self::failed("tx_bad_seq", Vec::new()));
        }

        let mut accounts = ledger.accounts.clone();
        let mut codes = Vec::with_capacity(tx.operations().len());
        let mut ok = true;
        for op in tx.operations() {
            let op_source = op.source_account.clone().unwrap_or_else(|| source.clone());
            let code = Self::apply_operation(&mut accounts, &op_source, op, ledger.current_ledger);
            ok &= code == "op_success";
            codes.push(code.to_string());
        }
        if !ok {
            return Err(Self::failed("tx_failed", codes));
        }

        if let Some(account) = accounts.get_mut(&source) {
            account.sequence = tx.body().seq_num;
        }
        ledger.accounts = accounts;
        ledger.submitted.push(tx.clone());
        Ok(TransactionResult {
            hash: hex_hash(&hash),
            ledger: ledger.current_ledger,
            successful: true,
        })
    }

    /// A zero maximum means unbounded.
    fn check_bounds(tx: &Transaction, current_ledger: u32) -> Result<(), SubmissionError> {
        if let Some(bounds) = tx.body().ledger_bounds {
            if current_ledger < bounds.min_ledger {
                return Err(Self::failed("tx_too_early", Vec::new()));
            }
            if bounds.max_ledger != 0 && bounds.max_ledger < current_ledger {
                return Err(Self::failed("tx_too_late", Vec::new()));
            }
        }
        if let Some(bounds) = tx.body().time_bounds {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            if bounds.max_time != 0 && bounds.max_time < now {
                return Err(Self::failed("tx_too_late", Vec::new()));
            }
        }
        Ok(())
    }

    fn apply_operation(
        accounts: &mut HashMap<String, MockAccount>,
        op_source: &str,
        op: &Operation,
        current_ledger: u32,
    ) -> &'static str {
        match &op.body {
            OperationBody::CreateAccount { destination, .. } => {
                if accounts.contains_key(destination) {
                    return "op_already_exists";
                }
                accounts.insert(
                    destination.clone(),
                    MockAccount {
                        sequence: i64::from(current_ledger) << 32,
                        trustlines: Vec::new(),
                    },
                );
            }
            OperationBody::Payment { destination, .. } => {
                if !accounts.contains_key(destination) {
                    return "op_no_destination";
                }
            }
            OperationBody::AccountMerge { destination } => {
                if !accounts.contains_key(destination) {
                    return "op_no_account";
                }
                if accounts.remove(op_source).is_none() {
                    return "op_no_account";
                }
            }
            OperationBody::ChangeTrust { asset, .. } => {
                let Asset::Credit { code, issuer } = asset else {
                    return "op_malformed";
                };
                let Some(account) = accounts.get_mut(op_source) else {
                    return "op_no_account";
                };
                account.trustlines.push((code.clone(), issuer.clone()));
            }
            OperationBody::RevokeAccountSponsorship { account_id } => {
                if !accounts.contains_key(account_id) {
                    return "op_does_not_exist";
                }
            }
            OperationBody::BeginSponsoringFutureReserves { .. } | OperationBody::EndSponsoringFutureReserves => {}
        }
        "op_success"
    }
}

fn hex_hash(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl NetworkClient for MockNetworkClient {
    async fn account_detail(&self, account_id: &str) -> Result<AccountDetail, SubmissionError> {
        let state = self.state.lock();
        if let Some(err) = state.account_failures.get(account_id) {
            return Err(err.clone());
        }
        let account = state
            .accounts
            .get(account_id)
            .ok_or_else(|| SubmissionError::status(404, "Resource Missing"))?;

        let mut balances = vec![Balance {
            asset_type: "native".to_string(),
            asset_code: None,
            asset_issuer: None,
            balance: "10000.0000000".to_string(),
        }];
        balances.extend(account.trustlines.iter().map(|(code, issuer)| Balance {
            asset_type: "credit_alphanum4".to_string(),
            asset_code: Some(code.clone()),
            asset_issuer: Some(issuer.clone()),
            balance: "0.0000000".to_string(),
        }));
        Ok(AccountDetail {
            account_id: account_id.to_string(),
            sequence: account.sequence,
            balances,
        })
    }

    async fn submit_transaction_with_options(
        &self,
        tx: &Transaction,
        _opts: SubmitOptions,
    ) -> Result<TransactionResult, SubmissionError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }
        self.apply(&mut state, tx)
    }

    async fn submit_fee_bump_transaction_with_options(
        &self,
        tx: &FeeBumpTransaction,
        _opts: SubmitOptions,
    ) -> Result<TransactionResult, SubmissionError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }
        let hash = tx
            .hash(&self.network_passphrase)
            .map_err(|e| SubmissionError::status(400, e.to_string()))?;
        let fee_source_signed = tx
            .signatures()
            .iter()
            .any(|s| verify_signature(tx.fee_source(), &hash, &s.signature));
        if !fee_source_signed {
            return Err(Self::failed("tx_bad_auth", Vec::new()));
        }
        self.apply(&mut state, tx.inner())
    }

    async fn root(&self) -> Result<Root, SubmissionError> {
        self.root_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if let Some(err) = &state.root_failure {
            return Err(err.clone());
        }
        Ok(Root {
            current_ledger: state.current_ledger,
            core_latest_ledger: state.current_ledger,
            network_passphrase: self.network_passphrase.clone(),
        })
    }
}

/// Simulation RPC double that replays queued outcomes, then succeeds.
#[derive(Default)]
pub struct MockSimulationClient {
    responses: Mutex<VecDeque<Result<SimulationResponse, SimulationClientError>>>,
    requests: Mutex<Vec<SimulationRequest>>,
}

impl MockSimulationClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: SimulationResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    pub fn push_error(&self, error: SimulationClientError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<SimulationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SimulationClient for MockSimulationClient {
    async fn simulate_transaction(
        &self,
        request: SimulationRequest,
    ) -> Result<SimulationResponse, SimulationClientError> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(SimulationResponse::default()))
    }
}

/// Unsigned native payment from `source` to `destination`.
pub fn payment_tx(source: &str, destination: &str) -> Transaction {
    Transaction::new(TransactionParams {
        source_account: source.to_string(),
        sequence: 1,
        increment_sequence_num: true,
        base_fee: MIN_BASE_FEE,
        time_bounds: Some(TimeBounds::with_timeout(30)),
        ledger_bounds: Some(LedgerBounds {
            min_ledger: 0,
            max_ledger: 110,
        }),
        operations: vec![Operation::payment(destination, Asset::Native, 10_000_000)],
    })
    .expect("payment fixture is valid")
}

/// Engine wired to the mock network, an in-memory store and the default
/// signature service. The host account exists on the mock ledger.
pub struct TestHarness {
    pub host: Keypair,
    pub network: Arc<MockNetworkClient>,
    pub store: Arc<InMemoryChannelAccountStore>,
    pub ledger_tracker: Arc<DefaultLedgerNumberTracker>,
    pub signature_service: Arc<DefaultSignatureService>,
}

impl TestHarness {
    pub fn new(current_ledger: u32) -> Self {
        let host = Keypair::random();
        let network = Arc::new(MockNetworkClient::new(current_ledger));
        network.add_account(host.address(), 1);

        let store = Arc::new(InMemoryChannelAccountStore::new());
        let ledger_tracker = Arc::new(
            DefaultLedgerNumberTracker::new(network.clone(), MAX_LEDGER_AGE)
                .expect("ledger tracker fixture is valid"),
        );
        let signature_service = Arc::new(
            DefaultSignatureService::new(
                TEST_NETWORK_PASSPHRASE,
                &host.secret_seed(),
                store.clone(),
                ledger_tracker.clone(),
                Arc::new(AesGcmEncrypter),
                TEST_ENCRYPTION_PASSPHRASE,
            )
            .expect("signature service fixture is valid"),
        );

        Self {
            host,
            network,
            store,
            ledger_tracker,
            signature_service,
        }
    }

    pub fn engine(&self) -> SubmitterEngine {
        SubmitterEngine::new(
            self.network.clone(),
            self.ledger_tracker.clone(),
            self.signature_service.clone(),
            MIN_BASE_FEE,
        )
        .expect("engine fixture is valid")
    }

    pub fn service(&self) -> ChannelAccountsService {
        ChannelAccountsService::new(self.engine(), self.store.clone(), self.store.clone())
    }
}
