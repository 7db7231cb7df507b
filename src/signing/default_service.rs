//! Locally held keys.
//!
//! The distribution keypair stays in memory for the life of the service.
//! Channel-account seeds live encrypted in the store and are decrypted per
//! call; the resulting keypairs are dropped as soon as the payload is signed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use super::{
    unique_accounts, DistributionAccountResolver, SignatureService, SignatureServiceType,
    SigningError, SigningResult,
};
use crate::crypto::{is_secret_seed, Keypair, PrivateKeyEncrypter};
use crate::engine::ledger_tracker::{LedgerNumberTracker, INCREMENT_FOR_MAX_LEDGER_BOUNDS};
use crate::metrics::metrics;
use crate::store::{ChannelAccountStore, NewChannelAccount};
use crate::transaction::{FeeBumpTransaction, Transaction};

pub struct DefaultSignatureService {
    network_passphrase: String,
    distribution: Keypair,
    store: Arc<dyn ChannelAccountStore>,
    ledger_tracker: Arc<dyn LedgerNumberTracker>,
    encrypter: Arc<dyn PrivateKeyEncrypter>,
    encryption_passphrase: String,
}

impl DefaultSignatureService {
    pub fn new(
        network_passphrase: &str,
        distribution_seed: &str,
        store: Arc<dyn ChannelAccountStore>,
        ledger_tracker: Arc<dyn LedgerNumberTracker>,
        encrypter: Arc<dyn PrivateKeyEncrypter>,
        encryption_passphrase: &str,
    ) -> SigningResult<Self> {
        if network_passphrase.is_empty() {
            return Err(SigningError::Config("network passphrase cannot be empty".into()));
        }
        if encryption_passphrase.is_empty() {
            return Err(SigningError::Config("encryption passphrase cannot be empty".into()));
        }
        let distribution = Keypair::from_secret(distribution_seed)
            .map_err(|e| SigningError::Config(format!("distribution seed: {}", e)))?;

        Ok(Self {
            network_passphrase: network_passphrase.to_string(),
            distribution,
            store,
            ledger_tracker,
            encrypter,
            encryption_passphrase: encryption_passphrase.to_string(),
        })
    }

    async fn channel_keypair(&self, public_key: &str) -> SigningResult<Keypair> {
        let row = self.store.get(public_key, 0).await.map_err(|e| {
            if e.is_not_found() {
                SigningError::NotFound(public_key.to_string())
            } else {
                SigningError::Store(e)
            }
        })?;

        let keypair = if is_secret_seed(&row.private_key) {
            Keypair::from_secret(&row.private_key)
        } else {
            let seed = self
                .encrypter
                .decrypt(&row.private_key, &self.encryption_passphrase)
                .map_err(|source| SigningError::Decryption {
                    public_key: public_key.to_string(),
                    source,
                })?;
            Keypair::from_secret(&seed)
        };

        keypair.map_err(|source| SigningError::InvalidKey {
            public_key: public_key.to_string(),
            source,
        })
    }

    /// One keypair per distinct account, in first-seen order.
    async fn resolve_keypairs(&self, accounts: &[String]) -> SigningResult<Vec<Keypair>> {
        let mut keypairs = Vec::new();
        for account in unique_accounts(accounts)? {
            if account == self.distribution.address() {
                keypairs.push(self.distribution.clone());
            } else {
                keypairs.push(self.channel_keypair(account).await?);
            }
        }
        Ok(keypairs)
    }
}

impl std::fmt::Debug for DefaultSignatureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultSignatureService")
            .field("network_passphrase", &self.network_passphrase)
            .field("distribution_account", &self.distribution.address())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DistributionAccountResolver for DefaultSignatureService {
    async fn distribution_account(&self) -> SigningResult<String> {
        Ok(self.distribution.address().to_string())
    }
}

#[async_trait]
impl SignatureService for DefaultSignatureService {
    #[instrument(skip_all, fields(accounts = accounts.len()))]
    async fn sign_transaction(&self, tx: &mut Transaction, accounts: &[String]) -> SigningResult<()> {
        let _timer = scopeguard::guard(Instant::now(), |started| {
            metrics().sign_duration.observe(started.elapsed().as_secs_f64());
        });

        let keypairs = self.resolve_keypairs(accounts).await?;
        let signers: Vec<&Keypair> = keypairs.iter().collect();
        tx.sign(&self.network_passphrase, &signers)?;
        debug!(signers = signers.len(), "transaction signed");
        Ok(())
    }

    #[instrument(skip_all, fields(accounts = accounts.len()))]
    async fn sign_fee_bump_transaction(
        &self,
        tx: &mut FeeBumpTransaction,
        accounts: &[String],
    ) -> SigningResult<()> {
        let _timer = scopeguard::guard(Instant::now(), |started| {
            metrics().sign_duration.observe(started.elapsed().as_secs_f64());
        });

        let keypairs = self.resolve_keypairs(accounts).await?;
        let signers: Vec<&Keypair> = keypairs.iter().collect();
        tx.sign(&self.network_passphrase, &signers)?;
        Ok(())
    }

    async fn batch_insert(&self, count: usize) -> SigningResult<Vec<String>> {
        if count < 1 {
            return Err(SigningError::Validation(
                "the number of accounts to insert needs to be greater than zero".into(),
            ));
        }

        let current_ledger = self.ledger_tracker.get_ledger_number().await?;
        let locked_until = current_ledger.saturating_add(INCREMENT_FOR_MAX_LEDGER_BOUNDS);

        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            let keypair = Keypair::random();
            let private_key = self
                .encrypter
                .encrypt(&keypair.secret_seed(), &self.encryption_passphrase)
                .map_err(SigningError::Encryption)?;
            rows.push(NewChannelAccount {
                public_key: keypair.address().to_string(),
                private_key,
            });
        }
        let public_keys: Vec<String> = rows.iter().map(|r| r.public_key.clone()).collect();

        self.store
            .batch_insert_and_lock(rows, current_ledger, locked_until)
            .await?;
        debug!(count, current_ledger, locked_until, "channel accounts inserted and locked");
        Ok(public_keys)
    }

    async fn delete(&self, public_key: &str, locked_until_ledger: u32) -> SigningResult<()> {
        self.store
            .delete_if_locked_until(public_key, locked_until_ledger)
            .await?;
        Ok(())
    }

    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    fn kind(&self) -> SignatureServiceType {
        SignatureServiceType::Default
    }
}
