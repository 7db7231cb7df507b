//! Engine Module
//!
//! Shared machinery of the transaction submission path:
//! - `ledger_tracker`: cached current ledger and ledger bounds
//! - `error_classifier` / `tx_errors`: classified submission and simulation failures
//! - `tx_limiter`: adaptive ceiling on channel accounts per round
//! - `submitter`: bundle of network, ledger and signing collaborators

pub mod error_classifier;
pub mod ledger_tracker;
pub mod submitter;
pub mod tx_errors;
pub mod tx_limiter;

pub use error_classifier::{classify, default_classifier, ClassificationRule, ErrorClassifier, ErrorKind};
pub use ledger_tracker::{
    DefaultLedgerNumberTracker, LedgerNumberTracker, LedgerTrackerError, LedgerTrackerResult,
    INCREMENT_FOR_MAX_LEDGER_BOUNDS, MAX_LEDGER_AGE,
};
pub use submitter::{EngineError, EngineResult, SubmitterEngine};
pub use tx_errors::{
    Problem, ResultCodes, SimulationError, SubmissionError, TransactionError, TransportFailure,
};
pub use tx_limiter::{
    DefaultTransactionProcessingLimiter, LimiterSettings, TransactionProcessingLimiter,
    DEFAULT_BUNDLES_SELECTION_LIMIT, INDETERMINATE_RESPONSES_TOLERANCE_LIMIT, LIMITER_WINDOW,
};
