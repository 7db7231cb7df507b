use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::{AccountDetail, NetworkClient, Root, SubmitOptions, TransactionResult};
use crate::engine::tx_errors::{Problem, SubmissionError, TransportFailure};
use crate::transaction::{FeeBumpTransaction, Transaction};

/// reqwest-backed [`NetworkClient`] speaking the Horizon REST API.
#[derive(Debug, Clone)]
pub struct HorizonHttpClient {
    client: Client,
    base_url: String,
}

impl HorizonHttpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SubmissionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubmissionError::transport(TransportFailure::Other, e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn submit_envelope(
        &self,
        envelope: String,
        opts: SubmitOptions,
    ) -> Result<TransactionResult, SubmissionError> {
        debug!(
            skip_memo_required_check = opts.skip_memo_required_check,
            "submitting transaction envelope"
        );
        let response = self
            .client
            .post(self.url("/transactions"))
            .form(&[("tx", envelope)])
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }
}

fn transport_error(err: reqwest::Error) -> SubmissionError {
    let failure = if err.is_timeout() {
        TransportFailure::Timeout
    } else if err.is_connect() {
        TransportFailure::Connect
    } else {
        TransportFailure::Other
    };
    SubmissionError::transport(failure, err.to_string())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SubmissionError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(transport_error);
    }

    let body = response.text().await.map_err(transport_error)?;
    let problem = serde_json::from_str::<Problem>(&body).unwrap_or_else(|_| Problem {
        status: status.as_u16(),
        title: status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string(),
        detail: body,
        ..Problem::default()
    });
    Err(SubmissionError::from_problem(Problem {
        status: status.as_u16(),
        ..problem
    }))
}

#[async_trait]
impl NetworkClient for HorizonHttpClient {
    async fn account_detail(&self, account_id: &str) -> Result<AccountDetail, SubmissionError> {
        let response = self
            .client
            .get(self.url(&format!("/accounts/{}", account_id)))
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    async fn submit_transaction_with_options(
        &self,
        tx: &Transaction,
        opts: SubmitOptions,
    ) -> Result<TransactionResult, SubmissionError> {
        let envelope = tx
            .to_envelope_base64()
            .map_err(|e| SubmissionError::transport(TransportFailure::Other, e.to_string()))?;
        self.submit_envelope(envelope, opts).await
    }

    async fn submit_fee_bump_transaction_with_options(
        &self,
        tx: &FeeBumpTransaction,
        opts: SubmitOptions,
    ) -> Result<TransactionResult, SubmissionError> {
        let envelope = tx
            .to_envelope_base64()
            .map_err(|e| SubmissionError::transport(TransportFailure::Other, e.to_string()))?;
        self.submit_envelope(envelope, opts).await
    }

    async fn root(&self) -> Result<Root, SubmissionError> {
        let response = self
            .client
            .get(self.url("/"))
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_root_and_account_detail() {
        let mut server = mockito::Server::new_async().await;
        let _root = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"history_latest_ledger": 500, "core_latest_ledger": 501}"#)
            .create_async()
            .await;
        let _account = server
            .mock("GET", "/accounts/GABC")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"account_id": "GABC", "sequence": "42", "balances": []}"#)
            .create_async()
            .await;

        let client = HorizonHttpClient::new(server.url(), Duration::from_secs(5)).unwrap();
        assert_eq!(client.root().await.unwrap().current_ledger, 500);
        assert_eq!(client.account_detail("GABC").await.unwrap().sequence, 42);
    }

    #[tokio::test]
    async fn test_not_found_problem() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server
            .mock("GET", "/accounts/GMISSING")
            .with_status(404)
            .with_header("content-type", "application/problem+json")
            .with_body(r#"{"type": "https://stellar.org/horizon-errors/not_found", "title": "Resource Missing", "status": 404}"#)
            .create_async()
            .await;

        let client = HorizonHttpClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let err = client.account_detail("GMISSING").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.problem().unwrap().title, "Resource Missing");
    }

    #[tokio::test]
    async fn test_submission_result_codes_decoded() {
        let mut server = mockito::Server::new_async().await;
        let _submit = server
            .mock("POST", "/transactions")
            .with_status(400)
            .with_header("content-type", "application/problem+json")
            .with_body(
                r#"{"title": "Transaction Failed", "status": 400,
                    "extras": {"result_codes": {"transaction": "tx_insufficient_fee"}}}"#,
            )
            .create_async()
            .await;

        let client = HorizonHttpClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let err = client.submit_envelope("AAAA".to_string(), SubmitOptions::default()).await.unwrap_err();
        assert!(err.is_tx_insufficient_fee());
    }

    #[tokio::test]
    async fn test_non_json_error_body() {
        let mut server = mockito::Server::new_async().await;
        let _limited = server
            .mock("GET", "/")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let client = HorizonHttpClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let err = client.root().await.unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(err.message(), "slow down");
    }
}
