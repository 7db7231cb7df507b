use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::error_classifier::{default_classifier, ErrorClassifier, ErrorKind};
use crate::network::SimulationResponse;

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a transaction simulation, classified by the response message
#[derive(Clone)]
pub struct SimulationError {
    kind: ErrorKind,
    cause: Option<Cause>,
    response: Option<SimulationResponse>,
}

impl SimulationError {
    /// Classify a simulation outcome.
    ///
    /// A response message is always classified. Without one, a cause means
    /// the request never got an answer (network) and no cause is unknown.
    pub fn new(cause: Option<Cause>, response: Option<SimulationResponse>) -> Self {
        Self::classified(cause, response, default_classifier())
    }

    /// Same as [`SimulationError::new`] with deployment-specific keyword rules.
    pub fn classified(
        cause: Option<Cause>,
        response: Option<SimulationResponse>,
        classifier: &ErrorClassifier,
    ) -> Self {
        let message = response.as_ref().map(|r| r.error.as_str()).unwrap_or_default();
        let kind = match (&cause, message.is_empty()) {
            (_, false) => classifier.classify(message),
            (Some(_), true) => ErrorKind::Network,
            (None, true) => ErrorKind::Unknown,
        };
        Self::with_kind(kind, cause, response)
    }

    pub(crate) fn with_kind(kind: ErrorKind, cause: Option<Cause>, response: Option<SimulationResponse>) -> Self {
        Self {
            kind,
            cause,
            response,
        }
    }

    pub fn from_error<E>(error: E, response: Option<SimulationResponse>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(Some(Arc::new(error)), response)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn raw_response(&self) -> Option<&SimulationResponse> {
        self.response.as_ref()
    }
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "simulation {} error: {}", self.kind, cause),
            None => write!(f, "simulation {} error", self.kind),
        }
    }
}

impl fmt::Debug for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationError")
            .field("kind", &self.kind)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .field("response", &self.response)
            .finish()
    }
}

impl std::error::Error for SimulationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result codes attached to a rejected submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCodes {
    #[serde(default)]
    pub transaction: String,
    #[serde(default)]
    pub inner_transaction: String,
    #[serde(default)]
    pub operations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemExtras {
    #[serde(default)]
    pub result_codes: Option<ResultCodes>,
    #[serde(default)]
    pub envelope_xdr: Option<String>,
    #[serde(default)]
    pub result_xdr: Option<String>,
}

/// `application/problem+json` body returned by the network API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(default, rename = "type")]
    pub problem_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub extras: Option<ProblemExtras>,
}

/// Failure below the HTTP response level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Connect,
    Other,
}

const FAILED_TX_CODES: &[&str] = &["tx_bad_auth", "tx_bad_auth_extra", "tx_insufficient_balance"];

const FAILED_OP_CODES: &[&str] = &[
    "op_bad_auth",
    "op_underfunded",
    "op_src_not_authorized",
    "op_no_destination",
    "op_no_trust",
    "op_line_full",
    "op_not_authorized",
    "op_no_issuer",
];

/// Error returned by the network client, either a problem response or a
/// transport failure that never produced one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionError {
    problem: Option<Problem>,
    transport: Option<TransportFailure>,
    message: String,
}

impl SubmissionError {
    pub fn from_problem(problem: Problem) -> Self {
        let message = if problem.detail.is_empty() {
            problem.title.clone()
        } else {
            problem.detail.clone()
        };
        Self {
            problem: Some(problem),
            transport: None,
            message,
        }
    }

    pub fn transport(failure: TransportFailure, message: impl Into<String>) -> Self {
        Self {
            problem: None,
            transport: Some(failure),
            message: message.into(),
        }
    }

    /// Convenience for a bare status response (e.g. 404 with no body).
    pub fn status(status: u16, title: impl Into<String>) -> Self {
        Self::from_problem(Problem {
            status,
            title: title.into(),
            ..Problem::default()
        })
    }

    /// Problem response carrying result codes.
    pub fn with_result_codes(status: u16, result_codes: ResultCodes) -> Self {
        Self::from_problem(Problem {
            status,
            title: "Transaction Failed".to_string(),
            extras: Some(ProblemExtras {
                result_codes: Some(result_codes),
                ..ProblemExtras::default()
            }),
            ..Problem::default()
        })
    }

    pub fn is_problem(&self) -> bool {
        self.problem.is_some()
    }

    pub fn problem(&self) -> Option<&Problem> {
        self.problem.as_ref()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.problem.as_ref().map(|p| p.status)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn result_codes(&self) -> Option<&ResultCodes> {
        self.problem
            .as_ref()
            .and_then(|p| p.extras.as_ref())
            .and_then(|e| e.result_codes.as_ref())
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_rate_limit(&self) -> bool {
        self.status_code() == Some(429)
    }

    pub fn is_gateway_timeout(&self) -> bool {
        self.status_code() == Some(504)
    }

    pub fn is_timeout(&self) -> bool {
        self.transport == Some(TransportFailure::Timeout)
    }

    pub fn is_transport(&self) -> bool {
        self.transport.is_some()
    }

    fn has_tx_code(&self, codes: &[&str]) -> bool {
        self.result_codes().is_some_and(|rc| {
            codes.contains(&rc.transaction.as_str()) || codes.contains(&rc.inner_transaction.as_str())
        })
    }

    fn has_op_code(&self, codes: &[&str]) -> bool {
        self.result_codes()
            .is_some_and(|rc| rc.operations.iter().any(|op| codes.contains(&op.as_str())))
    }

    pub fn is_tx_insufficient_fee(&self) -> bool {
        self.has_tx_code(&["tx_insufficient_fee"])
    }

    pub fn is_bad_authentication(&self) -> bool {
        self.has_tx_code(&["tx_bad_auth", "tx_bad_auth_extra"]) || self.has_op_code(&["op_bad_auth"])
    }

    pub fn is_not_enough_lumens(&self) -> bool {
        self.has_tx_code(&["tx_insufficient_balance"]) || self.has_op_code(&["op_underfunded"])
    }

    pub fn is_no_source_account(&self) -> bool {
        self.has_tx_code(&["tx_no_source_account"]) || self.has_op_code(&["op_no_source_account"])
    }

    pub fn is_source_not_authorized(&self) -> bool {
        self.has_op_code(&["op_src_not_authorized"])
    }

    pub fn is_source_no_trustline(&self) -> bool {
        self.has_op_code(&["op_src_no_trust"])
    }

    pub fn is_no_destination_account(&self) -> bool {
        self.has_op_code(&["op_no_destination"])
    }

    pub fn is_destination_not_authorized(&self) -> bool {
        self.has_op_code(&["op_not_authorized"])
    }

    pub fn is_destination_no_trustline(&self) -> bool {
        self.has_op_code(&["op_no_trust"])
    }

    pub fn is_line_full(&self) -> bool {
        self.has_op_code(&["op_line_full"])
    }

    pub fn is_no_issuer(&self) -> bool {
        self.has_op_code(&["op_no_issuer"])
    }

    /// Failure caused by how the source account is set up
    pub fn is_source_account_not_ready(&self) -> bool {
        self.is_not_enough_lumens()
            || self.is_no_source_account()
            || self.is_source_not_authorized()
            || self.is_source_no_trustline()
    }

    /// Failure caused by how the destination account is set up
    pub fn is_destination_account_not_ready(&self) -> bool {
        self.is_destination_not_authorized()
            || self.is_destination_no_trustline()
            || self.is_no_destination_account()
            || self.is_line_full()
    }

    /// Terminal rejection; resubmitting the same payment will not help.
    pub fn should_mark_as_error(&self) -> bool {
        self.has_tx_code(FAILED_TX_CODES) || self.has_op_code(FAILED_OP_CODES)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind_with(default_classifier())
    }

    /// Status and result codes decide first; only a bare message reaches the
    /// keyword rules.
    pub fn kind_with(&self, classifier: &ErrorClassifier) -> ErrorKind {
        if self.is_transport() || self.is_rate_limit() || self.is_gateway_timeout() {
            return ErrorKind::Network;
        }
        if self.is_tx_insufficient_fee() {
            return ErrorKind::Resource;
        }
        if self.is_bad_authentication() {
            return ErrorKind::Auth;
        }
        if self.result_codes().is_some() {
            return ErrorKind::TransactionInvalid;
        }
        classifier.classify(&self.message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(problem) = &self.problem else {
            return write!(f, "network response error: {}", self.message);
        };

        write!(f, "network response error: StatusCode={}", problem.status)?;
        if !problem.problem_type.is_empty() {
            write!(f, ", Type={}", problem.problem_type)?;
        }
        if !problem.title.is_empty() {
            write!(f, ", Title={}", problem.title)?;
        }
        if !problem.detail.is_empty() {
            write!(f, ", Detail={}", problem.detail)?;
        }

        if let Some(codes) = self.result_codes() {
            let mut extras = Vec::new();
            if !codes.transaction.is_empty() {
                extras.push(format!("transaction: {}", codes.transaction));
            }
            if !codes.inner_transaction.is_empty() {
                extras.push(format!("inner transaction: {}", codes.inner_transaction));
            }
            if !codes.operations.is_empty() {
                extras.push(format!(
                    "operation codes: [ {} ]",
                    codes.operations.join(", ")
                ));
            }
            if !extras.is_empty() {
                write!(f, ", Extras={}", extras.join(" - "))?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SubmissionError {}

/// Any classified failure that can feed the processing limiter
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::Submission(e) => e.kind(),
            TransactionError::Simulation(e) => e.kind(),
        }
    }

    /// Outcome that cannot be confirmed locally: timeouts, throttling,
    /// fee pressure and retryable simulation failures.
    pub fn is_indeterminate(&self) -> bool {
        match self {
            TransactionError::Submission(e) => {
                e.is_timeout() || e.is_rate_limit() || e.is_gateway_timeout() || e.is_tx_insufficient_fee()
            }
            TransactionError::Simulation(e) => e.is_retryable(),
        }
    }
}
