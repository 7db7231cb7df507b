//! Transaction Model
//!
//! A compact, strongly-typed representation of the ledger transactions the
//! engine builds: sponsorship-wrapped account creation, reserve refunds,
//! sponsorship revocation and account merges. Signatures cover
//! `SHA-256(network_id || envelope_tag || body)` where `network_id` is the
//! SHA-256 of the network passphrase, so a signature for one network can
//! never be replayed on another.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::crypto::Keypair;

/// Stroops per unit of the native asset (7 decimal places)
pub const STROOPS_PER_UNIT: i64 = 10_000_000;

/// Minimum base fee per operation accepted by the network
pub const MIN_BASE_FEE: u32 = 100;

/// Maximum operations a single transaction may carry
pub const MAX_OPERATIONS_PER_TX: usize = 100;

/// Maximum signatures a single envelope may carry
pub const MAX_SIGNATURES_PER_TX: usize = 20;

const ENVELOPE_TYPE_TX: [u8; 4] = [0, 0, 0, 2];
const ENVELOPE_TYPE_TX_FEE_BUMP: [u8; 4] = [0, 0, 0, 5];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionBuildError {
    #[error("transaction must contain at least one operation")]
    NoOperations,

    #[error("transaction has {0} operations, the maximum is 100")]
    TooManyOperations(usize),

    #[error("base fee {0} is below the network minimum of 100 stroops")]
    BaseFeeTooLow(u32),

    #[error("fee overflow computing {base_fee} x {operations}")]
    FeeOverflow { base_fee: u32, operations: usize },

    #[error("sequence number {0} cannot be incremented")]
    SequenceOverflow(i64),

    #[error("transaction would carry {0} signatures, the maximum is 20")]
    TooManySignatures(usize),

    #[error("invalid amount {0:?}")]
    InvalidAmount(String),

    #[error("envelope encoding failed: {0}")]
    Encoding(String),
}

pub type TransactionBuildResult<T> = Result<T, TransactionBuildError>;

/// Network identifier derived from the passphrase.
pub fn network_id(network_passphrase: &str) -> [u8; 32] {
    Sha256::digest(network_passphrase.as_bytes()).into()
}

/// Parse a decimal amount such as `"1.5"` into stroops.
pub fn parse_amount(amount: &str) -> TransactionBuildResult<i64> {
    let invalid = || TransactionBuildError::InvalidAmount(amount.to_string());
    let (whole, frac) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if frac.len() > 7 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    if whole < 0 {
        return Err(invalid());
    }
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<7}", frac).parse().map_err(|_| invalid())?
    };

    whole
        .checked_mul(STROOPS_PER_UNIT)
        .and_then(|w| w.checked_add(frac))
        .ok_or_else(invalid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerBounds {
    pub min_ledger: u32,
    pub max_ledger: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeBounds {
    pub min_time: u64,
    pub max_time: u64,
}

impl TimeBounds {
    /// Valid from now until `timeout_secs` in the future.
    pub fn with_timeout(timeout_secs: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            min_time: 0,
            max_time: now + timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    Native,
    Credit { code: String, issuer: String },
}

impl Asset {
    pub fn is_native(&self) -> bool {
        matches!(self, Asset::Native)
    }

    /// `CODE:ISSUER` identifier, `native` for the native asset
    pub fn id(&self) -> String {
        match self {
            Asset::Native => "native".to_string(),
            Asset::Credit { code, issuer } => format!("{}:{}", code, issuer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationBody {
    CreateAccount {
        destination: String,
        starting_balance: i64,
    },
    Payment {
        destination: String,
        asset: Asset,
        amount: i64,
    },
    BeginSponsoringFutureReserves {
        sponsored_id: String,
    },
    EndSponsoringFutureReserves,
    RevokeAccountSponsorship {
        account_id: String,
    },
    AccountMerge {
        destination: String,
    },
    ChangeTrust {
        asset: Asset,
        limit: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Overrides the transaction source for this operation
    pub source_account: Option<String>,
    pub body: OperationBody,
}

impl Operation {
    fn new(body: OperationBody) -> Self {
        Self {
            source_account: None,
            body,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_account = Some(source.into());
        self
    }

    pub fn create_account(destination: impl Into<String>, starting_balance: i64) -> Self {
        Self::new(OperationBody::CreateAccount {
            destination: destination.into(),
            starting_balance,
        })
    }

    pub fn payment(destination: impl Into<String>, asset: Asset, amount: i64) -> Self {
        Self::new(OperationBody::Payment {
            destination: destination.into(),
            asset,
            amount,
        })
    }

    pub fn begin_sponsoring(sponsored_id: impl Into<String>) -> Self {
        Self::new(OperationBody::BeginSponsoringFutureReserves {
            sponsored_id: sponsored_id.into(),
        })
    }

    /// Must be sourced by the sponsored account.
    pub fn end_sponsoring(sponsored_id: impl Into<String>) -> Self {
        Self::new(OperationBody::EndSponsoringFutureReserves).with_source(sponsored_id)
    }

    pub fn revoke_account_sponsorship(account_id: impl Into<String>) -> Self {
        Self::new(OperationBody::RevokeAccountSponsorship {
            account_id: account_id.into(),
        })
    }

    /// Merge `source` into `destination`.
    pub fn account_merge(destination: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(OperationBody::AccountMerge {
            destination: destination.into(),
        })
        .with_source(source)
    }

    pub fn change_trust(asset: Asset, limit: i64) -> Self {
        Self::new(OperationBody::ChangeTrust { asset, limit })
    }
}

/// Unsigned transaction body; this is what signatures commit to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBody {
    pub source_account: String,
    pub fee: u32,
    pub seq_num: i64,
    pub time_bounds: Option<TimeBounds>,
    pub ledger_bounds: Option<LedgerBounds>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoratedSignature {
    pub hint: [u8; 4],
    pub signature: Vec<u8>,
}

/// Inputs to [`Transaction::new`]
#[derive(Debug, Clone)]
pub struct TransactionParams {
    pub source_account: String,
    /// Current sequence number of the source account
    pub sequence: i64,
    pub increment_sequence_num: bool,
    pub base_fee: u32,
    pub time_bounds: Option<TimeBounds>,
    pub ledger_bounds: Option<LedgerBounds>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    body: TransactionBody,
    signatures: Vec<DecoratedSignature>,
}

impl Transaction {
    pub fn new(params: TransactionParams) -> TransactionBuildResult<Self> {
        let op_count = params.operations.len();
        if op_count == 0 {
            return Err(TransactionBuildError::NoOperations);
        }
        if op_count > MAX_OPERATIONS_PER_TX {
            return Err(TransactionBuildError::TooManyOperations(op_count));
        }
        if params.base_fee < MIN_BASE_FEE {
            return Err(TransactionBuildError::BaseFeeTooLow(params.base_fee));
        }
        let fee = u32::try_from(op_count)
            .ok()
            .and_then(|ops| params.base_fee.checked_mul(ops))
            .ok_or(TransactionBuildError::FeeOverflow {
                base_fee: params.base_fee,
                operations: op_count,
            })?;

        let seq_num = if params.increment_sequence_num {
            params
                .sequence
                .checked_add(1)
                .ok_or(TransactionBuildError::SequenceOverflow(params.sequence))?
        } else {
            params.sequence
        };

        Ok(Self {
            body: TransactionBody {
                source_account: params.source_account,
                fee,
                seq_num,
                time_bounds: params.time_bounds,
                ledger_bounds: params.ledger_bounds,
                operations: params.operations,
            },
            signatures: Vec::new(),
        })
    }

    pub fn body(&self) -> &TransactionBody {
        &self.body
    }

    pub fn source_account(&self) -> &str {
        &self.body.source_account
    }

    pub fn operations(&self) -> &[Operation] {
        &self.body.operations
    }

    pub fn signatures(&self) -> &[DecoratedSignature] {
        &self.signatures
    }

    /// Payload that every signer signs for the given network.
    pub fn hash(&self, network_passphrase: &str) -> TransactionBuildResult<[u8; 32]> {
        signature_payload(network_passphrase, ENVELOPE_TYPE_TX, &self.body)
    }

    /// Append one signature per keypair, all over the same payload.
    pub fn sign(
        &mut self,
        network_passphrase: &str,
        keypairs: &[&Keypair],
    ) -> TransactionBuildResult<()> {
        let total = self.signatures.len() + keypairs.len();
        if total > MAX_SIGNATURES_PER_TX {
            return Err(TransactionBuildError::TooManySignatures(total));
        }
        let hash = self.hash(network_passphrase)?;
        self.signatures
            .extend(keypairs.iter().map(|kp| kp.sign(&hash)));
        Ok(())
    }

    pub fn add_signature(&mut self, signature: DecoratedSignature) {
        self.signatures.push(signature);
    }

    pub fn to_envelope_base64(&self) -> TransactionBuildResult<String> {
        encode_envelope(self)
    }

    pub fn from_envelope_base64(envelope: &str) -> TransactionBuildResult<Self> {
        decode_envelope(envelope)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FeeBumpBody {
    fee_source: String,
    fee: i64,
    inner: Transaction,
}

/// Wraps a signed inner transaction so a different account pays its fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBumpTransaction {
    body: FeeBumpBody,
    signatures: Vec<DecoratedSignature>,
}

impl FeeBumpTransaction {
    pub fn new(
        inner: Transaction,
        fee_source: impl Into<String>,
        base_fee: u32,
    ) -> TransactionBuildResult<Self> {
        if base_fee < MIN_BASE_FEE {
            return Err(TransactionBuildError::BaseFeeTooLow(base_fee));
        }
        let ops = inner.operations().len();
        let fee = i64::try_from(ops + 1)
            .ok()
            .and_then(|n| i64::from(base_fee).checked_mul(n))
            .ok_or(TransactionBuildError::FeeOverflow {
                base_fee,
                operations: ops + 1,
            })?;
        Ok(Self {
            body: FeeBumpBody {
                fee_source: fee_source.into(),
                fee,
                inner,
            },
            signatures: Vec::new(),
        })
    }

    pub fn fee_source(&self) -> &str {
        &self.body.fee_source
    }

    pub fn fee(&self) -> i64 {
        self.body.fee
    }

    pub fn inner(&self) -> &Transaction {
        &self.body.inner
    }

    pub fn signatures(&self) -> &[DecoratedSignature] {
        &self.signatures
    }

    pub fn hash(&self, network_passphrase: &str) -> TransactionBuildResult<[u8; 32]> {
        signature_payload(network_passphrase, ENVELOPE_TYPE_TX_FEE_BUMP, &self.body)
    }

    pub fn sign(
        &mut self,
        network_passphrase: &str,
        keypairs: &[&Keypair],
    ) -> TransactionBuildResult<()> {
        let total = self.signatures.len() + keypairs.len();
        if total > MAX_SIGNATURES_PER_TX {
            return Err(TransactionBuildError::TooManySignatures(total));
        }
        let hash = self.hash(network_passphrase)?;
        self.signatures
            .extend(keypairs.iter().map(|kp| kp.sign(&hash)));
        Ok(())
    }

    pub fn add_signature(&mut self, signature: DecoratedSignature) {
        self.signatures.push(signature);
    }

    pub fn to_envelope_base64(&self) -> TransactionBuildResult<String> {
        encode_envelope(self)
    }
}

fn signature_payload<T: Serialize>(
    network_passphrase: &str,
    envelope_tag: [u8; 4],
    body: &T,
) -> TransactionBuildResult<[u8; 32]> {
    let encoded =
        bincode::serialize(body).map_err(|e| TransactionBuildError::Encoding(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(network_id(network_passphrase));
    hasher.update(envelope_tag);
    hasher.update(&encoded);
    Ok(hasher.finalize().into())
}

fn encode_envelope<T: Serialize>(envelope: &T) -> TransactionBuildResult<String> {
    bincode::serialize(envelope)
        .map(|bytes| STANDARD.encode(bytes))
        .map_err(|e| TransactionBuildError::Encoding(e.to_string()))
}

fn decode_envelope<T: for<'de> Deserialize<'de>>(envelope: &str) -> TransactionBuildResult<T> {
    let bytes = STANDARD
        .decode(envelope)
        .map_err(|e| TransactionBuildError::Encoding(e.to_string()))?;
    bincode::deserialize(&bytes).map_err(|e| TransactionBuildError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_signature;

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";

    fn params(operations: Vec<Operation>) -> TransactionParams {
        TransactionParams {
            source_account: Keypair::random().address().to_string(),
            sequence: 41,
            increment_sequence_num: true,
            base_fee: MIN_BASE_FEE,
            time_bounds: Some(TimeBounds::with_timeout(15)),
            ledger_bounds: Some(LedgerBounds {
                min_ledger: 0,
                max_ledger: 110,
            }),
            operations,
        }
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1.5").unwrap(), 15_000_000);
        assert_eq!(parse_amount("0").unwrap(), 0);
        assert_eq!(parse_amount("10").unwrap(), 100_000_000);
        assert_eq!(parse_amount("0.0000001").unwrap(), 1);
        assert!(parse_amount("0.00000001").is_err());
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount(".").is_err());
    }

    #[test]
    fn test_new_transaction_fee_and_sequence() {
        let dest = Keypair::random();
        let tx = Transaction::new(params(vec![
            Operation::begin_sponsoring(dest.address()),
            Operation::create_account(dest.address(), 0),
            Operation::end_sponsoring(dest.address()),
        ]))
        .unwrap();

        assert_eq!(tx.body().fee, 300);
        assert_eq!(tx.body().seq_num, 42);
        assert_eq!(
            tx.operations()[2].source_account.as_deref(),
            Some(dest.address())
        );
    }

    #[test]
    fn test_new_transaction_validation() {
        assert_eq!(
            Transaction::new(params(vec![])).unwrap_err(),
            TransactionBuildError::NoOperations
        );

        let mut low_fee = params(vec![Operation::create_account("G", 0)]);
        low_fee.base_fee = 10;
        assert_eq!(
            Transaction::new(low_fee).unwrap_err(),
            TransactionBuildError::BaseFeeTooLow(10)
        );

        let mut exhausted = params(vec![Operation::create_account("G", 0)]);
        exhausted.sequence = i64::MAX;
        assert_eq!(
            Transaction::new(exhausted.clone()).unwrap_err(),
            TransactionBuildError::SequenceOverflow(i64::MAX)
        );
        exhausted.increment_sequence_num = false;
        assert_eq!(Transaction::new(exhausted).unwrap().body().seq_num, i64::MAX);
    }

    #[test]
    fn test_signatures_bind_to_network() {
        let signer = Keypair::random();
        let mut tx = Transaction::new(params(vec![Operation::create_account("G", 0)])).unwrap();
        tx.sign(PASSPHRASE, &[&signer]).unwrap();

        let hash = tx.hash(PASSPHRASE).unwrap();
        let other = tx.hash("Public Global Stellar Network ; September 2015").unwrap();
        assert_ne!(hash, other);
        assert!(verify_signature(
            signer.address(),
            &hash,
            &tx.signatures()[0].signature
        ));
    }

    #[test]
    fn test_signature_ceiling() {
        let signers: Vec<Keypair> = (0..21).map(|_| Keypair::random()).collect();
        let refs: Vec<&Keypair> = signers.iter().collect();
        let mut tx = Transaction::new(params(vec![Operation::create_account("G", 0)])).unwrap();

        assert_eq!(
            tx.sign(PASSPHRASE, &refs).unwrap_err(),
            TransactionBuildError::TooManySignatures(21)
        );
        assert!(tx.signatures().is_empty());
    }

    #[test]
    fn test_envelope_decodes_to_same_transaction() {
        let signer = Keypair::random();
        let mut tx = Transaction::new(params(vec![Operation::payment(
            "G",
            Asset::Native,
            15_000_000,
        )]))
        .unwrap();
        tx.sign(PASSPHRASE, &[&signer]).unwrap();

        let envelope = tx.to_envelope_base64().unwrap();
        assert_eq!(Transaction::from_envelope_base64(&envelope).unwrap(), tx);
    }

    #[test]
    fn test_fee_bump_fee_and_hash() {
        let inner = Transaction::new(params(vec![Operation::create_account("G", 0)])).unwrap();
        let inner_hash = inner.hash(PASSPHRASE).unwrap();
        let fee_bump = FeeBumpTransaction::new(inner, "GFEESOURCE", 200).unwrap();

        assert_eq!(fee_bump.fee(), 400);
        assert_ne!(fee_bump.hash(PASSPHRASE).unwrap(), inner_hash);
    }
}
