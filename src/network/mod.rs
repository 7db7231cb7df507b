//! Network Module
//!
//! Interfaces to the ledger network consumed by the engine: the
//! Horizon-style account/submission API and the simulation RPC. Each
//! interface ships with a reqwest adapter; tests use the mocks in
//! `test_utils`.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::engine::tx_errors::SubmissionError;
use crate::transaction::{FeeBumpTransaction, Transaction};

pub mod horizon_http;
pub mod simulation;

pub use horizon_http::HorizonHttpClient;
pub use simulation::{
    simulate_transaction, simulate_transaction_with, RpcSimulationClient, SimulationClient, SimulationClientError,
    SimulationRequest, SimulationResponse,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset_type: String,
    #[serde(default)]
    pub asset_code: Option<String>,
    #[serde(default)]
    pub asset_issuer: Option<String>,
    pub balance: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetail {
    pub account_id: String,
    #[serde(deserialize_with = "i64_from_str_or_number")]
    pub sequence: i64,
    #[serde(default)]
    pub balances: Vec<Balance>,
}

impl AccountDetail {
    /// `CODE:ISSUER` ids of every non-native balance line.
    pub fn trustline_ids(&self) -> Vec<String> {
        self.balances
            .iter()
            .filter(|b| b.asset_type != "native")
            .filter_map(|b| match (&b.asset_code, &b.asset_issuer) {
                (Some(code), Some(issuer)) => Some(format!("{}:{}", code, issuer)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    #[serde(rename = "history_latest_ledger")]
    pub current_ledger: u32,
    #[serde(default)]
    pub core_latest_ledger: u32,
    #[serde(default)]
    pub network_passphrase: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub skip_memo_required_check: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub hash: String,
    #[serde(default)]
    pub ledger: u32,
    #[serde(default)]
    pub successful: bool,
}

/// Horizon-style network API
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Returns a 404 [`SubmissionError`] when the account does not exist.
    async fn account_detail(&self, account_id: &str) -> Result<AccountDetail, SubmissionError>;

    async fn submit_transaction_with_options(
        &self,
        tx: &Transaction,
        opts: SubmitOptions,
    ) -> Result<TransactionResult, SubmissionError>;

    async fn submit_fee_bump_transaction_with_options(
        &self,
        tx: &FeeBumpTransaction,
        opts: SubmitOptions,
    ) -> Result<TransactionResult, SubmissionError>;

    async fn root(&self) -> Result<Root, SubmissionError>;
}

fn i64_from_str_or_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(i64),
    }

    match StrOrNum::deserialize(deserializer)? {
        StrOrNum::Str(s) => s.parse().map_err(serde::de::Error::custom),
        StrOrNum::Num(n) => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_detail_sequence_as_string() {
        let json = r#"{
            "account_id": "GABC",
            "sequence": "103420918407103888",
            "balances": [
                {"asset_type": "native", "balance": "10.0000000"},
                {"asset_type": "credit_alphanum4", "asset_code": "USDC", "asset_issuer": "GISSUER", "balance": "1.0"}
            ]
        }"#;
        let account: AccountDetail = serde_json::from_str(json).unwrap();
        assert_eq!(account.sequence, 103420918407103888);
        assert_eq!(account.trustline_ids(), vec!["USDC:GISSUER".to_string()]);
    }

    #[test]
    fn test_root_maps_history_ledger() {
        let json = r#"{"history_latest_ledger": 1234, "core_latest_ledger": 1235, "network_passphrase": "Test"}"#;
        let root: Root = serde_json::from_str(json).unwrap();
        assert_eq!(root.current_ledger, 1234);
    }
}
