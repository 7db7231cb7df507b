use thiserror::Error;

use crate::crypto::{EncryptionError, KeypairError};
use crate::engine::ledger_tracker::LedgerTrackerError;
use crate::store::StoreError;
use crate::transaction::TransactionBuildError;

#[derive(Debug, Clone, Error)]
pub enum SigningError {
    #[error("stellar accounts cannot be empty")]
    EmptyAccounts,

    #[error("account cannot be empty")]
    EmptyAccount,

    /// The account is neither the distribution account nor a pooled channel account
    #[error("account {0} does not exist in the signature service")]
    NotFound(String),

    #[error("decrypting private key of {public_key}: {source}")]
    Decryption {
        public_key: String,
        #[source]
        source: EncryptionError,
    },

    #[error("invalid key material for {public_key}: {source}")]
    InvalidKey {
        public_key: String,
        #[source]
        source: KeypairError,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{operation} is not supported by the {service} signature service")]
    Unsupported {
        service: &'static str,
        operation: &'static str,
    },

    #[error("channel account store: {0}")]
    Store(#[from] StoreError),

    #[error("resolving current ledger: {0}")]
    Ledger(#[from] LedgerTrackerError),

    #[error("signing transaction: {0}")]
    Build(#[from] TransactionBuildError),

    #[error("encrypting private key: {0}")]
    Encryption(EncryptionError),

    #[error("custody service error: {0}")]
    Remote(String),

    #[error("signature service configuration: {0}")]
    Config(String),
}

impl SigningError {
    /// True when the requested account is unknown, as opposed to a failure
    /// while resolving a known one.
    pub fn is_not_found(&self) -> bool {
        match self {
            SigningError::NotFound(_) => true,
            SigningError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type SigningResult<T> = Result<T, SigningError>;
