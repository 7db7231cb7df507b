//! Channel Accounts Module
//!
//! On-chain lifecycle of the channel-account pool: sponsored creation with
//! compensating rollback, merge-back deletion, verification against the
//! network and reconciliation to a target pool size. Every command runs under
//! the pool's advisory lock so replicas sharing a store never race.

use std::fmt;
use thiserror::Error;

use crate::engine::{EngineError, LedgerTrackerError, SubmissionError};
use crate::signing::SigningError;
use crate::store::StoreError;
use crate::transaction::TransactionBuildError;

pub mod on_chain;
pub mod retry;
pub mod service;

pub use on_chain::{
    add_trustlines, create_and_fund_account, create_channel_accounts_on_chain,
    delete_channel_account_on_chain, RollbackScope,
};
pub use retry::{retry_if, RetryConfig};
pub use service::{ChannelAccountsService, DeleteChannelAccountsOptions, VerificationReport};

/// Sponsorship uses three operations per account and a transaction carries
/// at most 20 signatures (19 channels plus the host).
pub const MAXIMUM_CREATE_ACCOUNT_OPERATIONS_PER_TX: usize = 19;
pub const MAX_NUMBER_OF_CHANNEL_ACCOUNTS: usize = 1000;
pub const MIN_NUMBER_OF_CHANNEL_ACCOUNTS: usize = 1;
/// Native amount returned to a channel account so it can cover its own
/// reserve once sponsorship is revoked
pub const DEFAULT_REVOKE_SPONSORSHIP_RESERVE_AMOUNT: &str = "1.5";
pub const CHANNEL_ACCOUNT_TX_TIMEOUT_SECS: u64 = 15;
pub const CREATE_AND_FUND_TX_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Create,
    Delete,
    Verify,
    Ensure,
    List,
    Fund,
    Trustline,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::Create => "create",
            LifecyclePhase::Delete => "delete",
            LifecyclePhase::Verify => "verify",
            LifecyclePhase::Ensure => "ensure",
            LifecyclePhase::List => "list",
            LifecyclePhase::Fund => "fund",
            LifecyclePhase::Trustline => "trustline",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower-level failure wrapped by a [`LifecycleError`]
#[derive(Debug, Clone, Error)]
pub enum LifecycleCause {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerTrackerError),

    #[error(transparent)]
    Build(#[from] TransactionBuildError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("{phase}: advisory lock {lock_id} is unavailable, another process is managing channel accounts")]
    AdvisoryLockUnavailable { phase: LifecyclePhase, lock_id: i64 },

    #[error("{phase}: advisory lock {lock_id} expired while the command was running")]
    AdvisoryLockLost { phase: LifecyclePhase, lock_id: i64 },

    #[error("{phase}: {message}")]
    InvalidRequest { phase: LifecyclePhase, message: String },

    #[error("{phase}: {context}: {source}")]
    Failed {
        phase: LifecyclePhase,
        public_key: Option<String>,
        context: String,
        #[source]
        source: LifecycleCause,
    },
}

impl LifecycleError {
    pub(crate) fn invalid(phase: LifecyclePhase, message: impl Into<String>) -> Self {
        LifecycleError::InvalidRequest {
            phase,
            message: message.into(),
        }
    }

    pub(crate) fn failed(
        phase: LifecyclePhase,
        context: impl Into<String>,
        source: impl Into<LifecycleCause>,
    ) -> Self {
        LifecycleError::Failed {
            phase,
            public_key: None,
            context: context.into(),
            source: source.into(),
        }
    }

    /// Failure tied to one account; the key is also spelled out in the message.
    pub(crate) fn account(
        phase: LifecyclePhase,
        public_key: &str,
        context: impl fmt::Display,
        source: impl Into<LifecycleCause>,
    ) -> Self {
        LifecycleError::Failed {
            phase,
            public_key: Some(public_key.to_string()),
            context: format!("{} {}", context, public_key),
            source: source.into(),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        match self {
            LifecycleError::AdvisoryLockUnavailable { phase, .. }
            | LifecycleError::AdvisoryLockLost { phase, .. }
            | LifecycleError::InvalidRequest { phase, .. }
            | LifecycleError::Failed { phase, .. } => *phase,
        }
    }

    pub fn public_key(&self) -> Option<&str> {
        match self {
            LifecycleError::Failed { public_key, .. } => public_key.as_deref(),
            _ => None,
        }
    }

    pub fn cause(&self) -> Option<&LifecycleCause> {
        match self {
            LifecycleError::Failed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Re-tag an error raised by a nested command with the outer phase.
    pub(crate) fn in_phase(self, phase: LifecyclePhase) -> Self {
        match self {
            LifecycleError::AdvisoryLockUnavailable { lock_id, .. } => {
                LifecycleError::AdvisoryLockUnavailable { phase, lock_id }
            }
            LifecycleError::AdvisoryLockLost { lock_id, .. } => LifecycleError::AdvisoryLockLost { phase, lock_id },
            LifecycleError::InvalidRequest { message, .. } => LifecycleError::InvalidRequest { phase, message },
            LifecycleError::Failed {
                public_key,
                context,
                source,
                ..
            } => LifecycleError::Failed {
                phase,
                public_key,
                context,
                source,
            },
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
