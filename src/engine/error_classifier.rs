//! Ordered keyword classification of network and simulation error messages.
//!
//! Rules are evaluated in a fixed priority order and the first match wins:
//! ContractExecution, Resource, TransactionInvalid, Auth, then Unknown. A
//! contract failure that mentions "limit" therefore stays a ContractExecution
//! error. Broadening any keyword set changes which errors are retried, so the
//! sets are data that deployments can override rather than code.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    TransactionInvalid,
    Auth,
    ContractExecution,
    Resource,
    Unknown,
}

impl ErrorKind {
    /// Only network and resource failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Resource)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::TransactionInvalid => "transaction_invalid",
            ErrorKind::Auth => "auth",
            ErrorKind::ContractExecution => "contract_execution",
            ErrorKind::Resource => "resource",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keywords that map a message onto one error kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub kind: ErrorKind,
    pub keywords: Vec<String>,
}

impl ClassificationRule {
    pub fn new<I, S>(kind: ErrorKind, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

pub const CONTRACT_EXECUTION_KEYWORDS: &[&str] = &[
    "contract execution failed",
    "contract error",
    "contract panic",
    "hosterror: error(storage,",
    "contract already exists",
    "wasm does not exist",
    "existingvalue)",
    "missingvalue)",
];

pub const RESOURCE_KEYWORDS: &[&str] = &[
    "resource",
    "cpu limit",
    "memory limit",
    "instructions limit",
    "limit exceeded",
];

pub const TRANSACTION_INVALID_KEYWORDS: &[&str] =
    &["unmarshal", "parse", "decode", "invalid transaction"];

pub const AUTH_KEYWORDS: &[&str] = &["authorization", "signature", "unauthorized"];

/// Priority order of the built-in rules
pub const CLASSIFICATION_PRIORITY: [ErrorKind; 4] = [
    ErrorKind::ContractExecution,
    ErrorKind::Resource,
    ErrorKind::TransactionInvalid,
    ErrorKind::Auth,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                ClassificationRule::new(
                    ErrorKind::ContractExecution,
                    CONTRACT_EXECUTION_KEYWORDS.iter().copied(),
                ),
                ClassificationRule::new(ErrorKind::Resource, RESOURCE_KEYWORDS.iter().copied()),
                ClassificationRule::new(
                    ErrorKind::TransactionInvalid,
                    TRANSACTION_INVALID_KEYWORDS.iter().copied(),
                ),
                ClassificationRule::new(ErrorKind::Auth, AUTH_KEYWORDS.iter().copied()),
            ],
        }
    }
}

impl ErrorClassifier {
    /// Build a classifier from rules already in priority order.
    pub fn from_rules(rules: Vec<ClassificationRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| ClassificationRule::new(r.kind, r.keywords))
            .collect();
        Self { rules }
    }

    /// Replace the keyword set of individual kinds while keeping the priority order.
    pub fn with_overrides(overrides: &[ClassificationRule]) -> Self {
        let mut classifier = Self::default();
        for over in overrides {
            match classifier.rules.iter_mut().find(|r| r.kind == over.kind) {
                Some(rule) => *rule = ClassificationRule::new(over.kind, over.keywords.clone()),
                None => tracing::warn!(
                    kind = %over.kind,
                    "ignoring classifier override for a kind without keyword rules"
                ),
            }
        }
        classifier
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(&self, message: &str) -> ErrorKind {
        if message.is_empty() {
            return ErrorKind::Unknown;
        }
        let lowered = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}

static DEFAULT_CLASSIFIER: Lazy<ErrorClassifier> = Lazy::new(ErrorClassifier::default);

pub fn default_classifier() -> &'static ErrorClassifier {
    &DEFAULT_CLASSIFIER
}

/// Classify with the built-in keyword sets.
pub fn classify(message: &str) -> ErrorKind {
    DEFAULT_CLASSIFIER.classify(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resource_messages_are_retryable() {
        for msg in [
            "CPU limit exceeded",
            "memory limit reached",
            "Instructions limit hit",
            "insufficient RESOURCE fee",
        ] {
            let kind = classify(msg);
            assert_eq!(kind, ErrorKind::Resource, "message: {}", msg);
            assert!(kind.is_retryable());
        }
    }

    #[test]
    fn test_contract_execution_is_terminal() {
        let kind = classify("HostError: contract execution failed");
        assert_eq!(kind, ErrorKind::ContractExecution);
        assert!(!kind.is_retryable());
    }

    #[test]
    fn test_priority_order_wins_on_overlap() {
        // contract + resource keywords: contract wins
        assert_eq!(
            classify("contract panic: cpu limit exceeded"),
            ErrorKind::ContractExecution
        );
        // resource + invalid keywords: resource wins
        assert_eq!(
            classify("failed to parse resource footprint"),
            ErrorKind::Resource
        );
        // invalid + auth keywords: invalid wins
        assert_eq!(
            classify("cannot decode signature"),
            ErrorKind::TransactionInvalid
        );
    }

    #[test]
    fn test_other_kinds() {
        assert_eq!(
            classify("HostError: Error(Storage, MissingValue)"),
            ErrorKind::ContractExecution
        );
        assert_eq!(classify("xdr unmarshal failed"), ErrorKind::TransactionInvalid);
        assert_eq!(classify("Unauthorized invoker"), ErrorKind::Auth);
        assert_eq!(classify("something odd happened"), ErrorKind::Unknown);
        assert_eq!(classify(""), ErrorKind::Unknown);
    }

    #[test]
    fn test_retryable_table() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Resource.is_retryable());
        assert!(!ErrorKind::TransactionInvalid.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::ContractExecution.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_overrides_keep_priority() {
        let classifier = ErrorClassifier::with_overrides(&[ClassificationRule::new(
            ErrorKind::Auth,
            ["Forbidden"],
        )]);
        assert_eq!(classifier.classify("403 forbidden"), ErrorKind::Auth);
        assert_eq!(classifier.classify("bad signature"), ErrorKind::Unknown);
        assert_eq!(classifier.rules()[0].kind, ErrorKind::ContractExecution);
    }

    proptest! {
        #[test]
        fn prop_contract_keyword_always_wins(prefix in "[a-z ]{0,20}", suffix in "[a-z ]{0,20}") {
            let msg = format!("{}contract error{} cpu limit", prefix, suffix);
            prop_assert_eq!(classify(&msg), ErrorKind::ContractExecution);
        }

        #[test]
        fn prop_classification_is_case_insensitive(msg in "[a-zA-Z ]{0,40}") {
            prop_assert_eq!(classify(&msg), classify(&msg.to_uppercase()));
        }
    }
}
