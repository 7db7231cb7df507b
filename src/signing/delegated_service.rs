//! Signing delegated to a remote custody service.
//!
//! No key material is held locally. The custody service owns the
//! distribution account and the channel-account pool; this variant ships the
//! envelope and the requested signers over and appends whatever signatures
//! come back.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    unique_accounts, DistributionAccountResolver, SignatureService, SignatureServiceType,
    SigningError, SigningResult,
};
use crate::transaction::{DecoratedSignature, FeeBumpTransaction, Transaction};

#[async_trait]
pub trait CustodyClient: Send + Sync {
    async fn distribution_account(&self) -> SigningResult<String>;

    /// Signatures over `envelope` for each of `accounts`, in order.
    async fn sign(
        &self,
        envelope: &str,
        network_passphrase: &str,
        accounts: &[&str],
    ) -> SigningResult<Vec<DecoratedSignature>>;

    async fn create_accounts(&self, count: usize) -> SigningResult<Vec<String>>;

    async fn delete_account(&self, public_key: &str, locked_until_ledger: u32) -> SigningResult<()>;
}

pub struct DelegatedSignatureService {
    network_passphrase: String,
    custody: Arc<dyn CustodyClient>,
}

impl DelegatedSignatureService {
    pub fn new(network_passphrase: &str, custody: Arc<dyn CustodyClient>) -> SigningResult<Self> {
        if network_passphrase.is_empty() {
            return Err(SigningError::Config("network passphrase cannot be empty".into()));
        }
        Ok(Self {
            network_passphrase: network_passphrase.to_string(),
            custody,
        })
    }

    async fn remote_signatures(&self, envelope: &str, accounts: &[String]) -> SigningResult<Vec<DecoratedSignature>> {
        let unique = unique_accounts(accounts)?;
        let signatures = self
            .custody
            .sign(envelope, &self.network_passphrase, &unique)
            .await?;
        if signatures.len() != unique.len() {
            warn!(
                requested = unique.len(),
                returned = signatures.len(),
                "custody service returned an unexpected number of signatures"
            );
            return Err(SigningError::Remote(format!(
                "expected {} signatures, got {}",
                unique.len(),
                signatures.len()
            )));
        }
        Ok(signatures)
    }
}

impl std::fmt::Debug for DelegatedSignatureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedSignatureService")
            .field("network_passphrase", &self.network_passphrase)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DistributionAccountResolver for DelegatedSignatureService {
    async fn distribution_account(&self) -> SigningResult<String> {
        self.custody.distribution_account().await
    }
}

#[async_trait]
impl SignatureService for DelegatedSignatureService {
    async fn sign_transaction(&self, tx: &mut Transaction, accounts: &[String]) -> SigningResult<()> {
        let envelope = tx.to_envelope_base64()?;
        for signature in self.remote_signatures(&envelope, accounts).await? {
            tx.add_signature(signature);
        }
        Ok(())
    }

    async fn sign_fee_bump_transaction(
        &self,
        tx: &mut FeeBumpTransaction,
        accounts: &[String],
    ) -> SigningResult<()> {
        let envelope = tx.to_envelope_base64()?;
        for signature in self.remote_signatures(&envelope, accounts).await? {
            tx.add_signature(signature);
        }
        Ok(())
    }

    async fn batch_insert(&self, count: usize) -> SigningResult<Vec<String>> {
        if count < 1 {
            return Err(SigningError::Validation(
                "the number of accounts to insert needs to be greater than zero".into(),
            ));
        }
        self.custody.create_accounts(count).await
    }

    async fn delete(&self, public_key: &str, locked_until_ledger: u32) -> SigningResult<()> {
        self.custody.delete_account(public_key, locked_until_ledger).await
    }

    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    fn kind(&self) -> SignatureServiceType {
        SignatureServiceType::Delegated
    }
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    envelope: &'a str,
    network_passphrase: &'a str,
    accounts: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signatures: Vec<DecoratedSignature>,
}

#[derive(Debug, Deserialize)]
struct DistributionAccountResponse {
    address: String,
}

#[derive(Debug, Serialize)]
struct CreateAccountsRequest {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct CreateAccountsResponse {
    public_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CustodyErrorBody {
    #[serde(default)]
    error: String,
}

/// reqwest-backed [`CustodyClient`] for a JSON custody API.
#[derive(Debug, Clone)]
pub struct HttpCustodyClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCustodyClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SigningResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SigningError::Config(format!("custody http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> SigningResult<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| SigningError::Remote(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<CustodyErrorBody>(&body)
            .map(|b| b.error)
            .ok()
            .filter(|e| !e.is_empty())
            .unwrap_or(body);

        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(%status, %message, "custody service reported a missing account");
            return Err(SigningError::NotFound(message));
        }
        Err(SigningError::Remote(format!("status {}: {}", status.as_u16(), message)))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> SigningResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| SigningError::Remote(format!("decoding custody response: {}", e)))
    }
}

#[async_trait]
impl CustodyClient for HttpCustodyClient {
    async fn distribution_account(&self) -> SigningResult<String> {
        let response = self.send(self.client.get(self.url("/distribution-account"))).await?;
        Ok(Self::json::<DistributionAccountResponse>(response).await?.address)
    }

    async fn sign(
        &self,
        envelope: &str,
        network_passphrase: &str,
        accounts: &[&str],
    ) -> SigningResult<Vec<DecoratedSignature>> {
        let body = SignRequest {
            envelope,
            network_passphrase,
            accounts,
        };
        let response = self.send(self.client.post(self.url("/sign")).json(&body)).await?;
        Ok(Self::json::<SignResponse>(response).await?.signatures)
    }

    async fn create_accounts(&self, count: usize) -> SigningResult<Vec<String>> {
        let response = self
            .send(
                self.client
                    .post(self.url("/channel-accounts"))
                    .json(&CreateAccountsRequest { count }),
            )
            .await?;
        Ok(Self::json::<CreateAccountsResponse>(response).await?.public_keys)
    }

    async fn delete_account(&self, public_key: &str, locked_until_ledger: u32) -> SigningResult<()> {
        self.send(
            self.client
                .delete(self.url(&format!("/channel-accounts/{}", public_key)))
                .query(&[("locked_until_ledger", locked_until_ledger)]),
        )
        .await?;
        Ok(())
    }
}
