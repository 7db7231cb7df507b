//! Signing Module
//!
//! Pluggable signature abstraction used by the engine and the channel-account
//! lifecycle. A [`SignatureService`] signs for the distribution (host) account
//! and for pooled channel accounts, provisions new channel accounts, and
//! removes them again once they are merged on chain.
//!
//! Variants are selected by [`SignatureServiceType`]:
//! - [`DefaultSignatureService`]: keys held locally, channel seeds encrypted in the store
//! - [`DelegatedSignatureService`]: every capability forwarded to a custody service
//! - [`DistributionEnvSignatureService`]: distribution key only, no channel pool

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::crypto::{AesGcmEncrypter, PrivateKeyEncrypter};
use crate::engine::ledger_tracker::LedgerNumberTracker;
use crate::store::ChannelAccountStore;
use crate::transaction::{FeeBumpTransaction, Transaction};

pub mod default_service;
pub mod delegated_service;
pub mod distribution_env;
pub mod signing_errors;

pub use default_service::DefaultSignatureService;
pub use delegated_service::{CustodyClient, DelegatedSignatureService, HttpCustodyClient};
pub use distribution_env::DistributionEnvSignatureService;
pub use signing_errors::{SigningError, SigningResult};

/// Answers which account is the host that funds and sponsors channel accounts.
#[async_trait]
pub trait DistributionAccountResolver: Send + Sync {
    async fn distribution_account(&self) -> SigningResult<String>;

    async fn is_distribution_account(&self, address: &str) -> SigningResult<bool> {
        Ok(self.distribution_account().await? == address)
    }
}

#[async_trait]
pub trait SignatureService: DistributionAccountResolver {
    /// Append one signature per distinct account in `accounts`.
    async fn sign_transaction(&self, tx: &mut Transaction, accounts: &[String]) -> SigningResult<()>;

    async fn sign_fee_bump_transaction(
        &self,
        tx: &mut FeeBumpTransaction,
        accounts: &[String],
    ) -> SigningResult<()>;

    /// Provision `count` channel accounts, persisted and locked in one atomic
    /// write. Returns their public keys in insertion order.
    async fn batch_insert(&self, count: usize) -> SigningResult<Vec<String>>;

    /// Remove a channel account whose lease still reaches `locked_until_ledger`.
    async fn delete(&self, public_key: &str, locked_until_ledger: u32) -> SigningResult<()>;

    fn network_passphrase(&self) -> &str;

    fn kind(&self) -> SignatureServiceType;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureServiceType {
    #[default]
    Default,
    Delegated,
    DistributionEnv,
}

impl SignatureServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureServiceType::Default => "DEFAULT",
            SignatureServiceType::Delegated => "DELEGATED",
            SignatureServiceType::DistributionEnv => "DISTRIBUTION_ENV",
        }
    }
}

impl fmt::Display for SignatureServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureServiceType {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DEFAULT" => Ok(SignatureServiceType::Default),
            "DELEGATED" => Ok(SignatureServiceType::Delegated),
            "DISTRIBUTION_ENV" | "DISTRIBUTION_ACCOUNT_ENV" => Ok(SignatureServiceType::DistributionEnv),
            other => Err(SigningError::Config(format!(
                "unknown signature service type {:?}",
                other
            ))),
        }
    }
}

/// Everything [`new_signature_service`] may need. Which fields are required
/// depends on the selected type.
#[derive(Clone)]
pub struct SignatureServiceOptions {
    pub service_type: SignatureServiceType,
    pub network_passphrase: String,
    pub distribution_seed: Option<String>,
    pub encryption_passphrase: Option<String>,
    pub store: Option<Arc<dyn ChannelAccountStore>>,
    pub ledger_tracker: Option<Arc<dyn LedgerNumberTracker>>,
    pub encrypter: Arc<dyn PrivateKeyEncrypter>,
    pub custody_client: Option<Arc<dyn CustodyClient>>,
}

impl SignatureServiceOptions {
    pub fn new(service_type: SignatureServiceType, network_passphrase: impl Into<String>) -> Self {
        Self {
            service_type,
            network_passphrase: network_passphrase.into(),
            distribution_seed: None,
            encryption_passphrase: None,
            store: None,
            ledger_tracker: None,
            encrypter: Arc::new(AesGcmEncrypter),
            custody_client: None,
        }
    }
}

impl fmt::Debug for SignatureServiceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureServiceOptions")
            .field("service_type", &self.service_type)
            .field("network_passphrase", &self.network_passphrase)
            .field("has_distribution_seed", &self.distribution_seed.is_some())
            .field("has_store", &self.store.is_some())
            .field("has_custody_client", &self.custody_client.is_some())
            .finish_non_exhaustive()
    }
}

fn required<T: Clone>(value: &Option<T>, what: &str) -> SigningResult<T> {
    value
        .clone()
        .ok_or_else(|| SigningError::Config(format!("{} is required", what)))
}

/// Build the signature service variant named by `opts.service_type`.
pub fn new_signature_service(opts: SignatureServiceOptions) -> SigningResult<Arc<dyn SignatureService>> {
    match opts.service_type {
        SignatureServiceType::Default => {
            let seed = required(&opts.distribution_seed, "distribution seed")?;
            let passphrase = required(&opts.encryption_passphrase, "encryption passphrase")?;
            Ok(Arc::new(DefaultSignatureService::new(
                &opts.network_passphrase,
                &seed,
                required(&opts.store, "channel account store")?,
                required(&opts.ledger_tracker, "ledger tracker")?,
                opts.encrypter.clone(),
                &passphrase,
            )?))
        }
        SignatureServiceType::Delegated => Ok(Arc::new(DelegatedSignatureService::new(
            &opts.network_passphrase,
            required(&opts.custody_client, "custody client")?,
        )?)),
        SignatureServiceType::DistributionEnv => {
            let seed = required(&opts.distribution_seed, "distribution seed")?;
            Ok(Arc::new(DistributionEnvSignatureService::new(
                &opts.network_passphrase,
                &seed,
            )?))
        }
    }
}

/// Accounts in first-seen order with duplicates dropped; rejects empty input.
pub(crate) fn unique_accounts(accounts: &[String]) -> SigningResult<Vec<&str>> {
    use itertools::Itertools;

    if accounts.is_empty() {
        return Err(SigningError::EmptyAccounts);
    }
    let unique: Vec<&str> = accounts.iter().map(String::as_str).unique().collect();
    if unique.iter().any(|a| a.is_empty()) {
        return Err(SigningError::EmptyAccount);
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn test_unique_accounts_preserves_order() {
        let accounts = vec!["GB".to_string(), "GA".to_string(), "GB".to_string()];
        assert_eq!(unique_accounts(&accounts).unwrap(), vec!["GB", "GA"]);
        assert!(matches!(unique_accounts(&[]), Err(SigningError::EmptyAccounts)));
        assert!(matches!(
            unique_accounts(&["GA".to_string(), String::new()]),
            Err(SigningError::EmptyAccount)
        ));
    }

    #[test]
    fn test_service_type_parsing() {
        assert_eq!("default".parse::<SignatureServiceType>().unwrap(), SignatureServiceType::Default);
        assert_eq!(
            "distribution-env".parse::<SignatureServiceType>().unwrap(),
            SignatureServiceType::DistributionEnv
        );
        assert!("vault".parse::<SignatureServiceType>().is_err());
    }

    #[test]
    fn test_factory_requires_variant_inputs() {
        let opts = SignatureServiceOptions::new(SignatureServiceType::Default, "Test SDF Network ; September 2015");
        assert!(matches!(new_signature_service(opts), Err(SigningError::Config(_))));

        let mut opts = SignatureServiceOptions::new(
            SignatureServiceType::DistributionEnv,
            "Test SDF Network ; September 2015",
        );
        let host = Keypair::random();
        opts.distribution_seed = Some(host.secret_seed().to_string());
        let service = new_signature_service(opts).unwrap();
        assert_eq!(service.kind(), SignatureServiceType::DistributionEnv);
    }
}
