use async_trait::async_trait;

use super::{
    unique_accounts, DistributionAccountResolver, SignatureService, SignatureServiceType,
    SigningError, SigningResult,
};
use crate::crypto::Keypair;
use crate::transaction::{FeeBumpTransaction, Transaction};

/// Signs only for a distribution account whose seed comes from the
/// environment. Deployments using it have no channel-account pool.
pub struct DistributionEnvSignatureService {
    network_passphrase: String,
    distribution: Keypair,
}

impl DistributionEnvSignatureService {
    pub fn new(network_passphrase: &str, distribution_seed: &str) -> SigningResult<Self> {
        if network_passphrase.is_empty() {
            return Err(SigningError::Config("network passphrase cannot be empty".into()));
        }
        let distribution = Keypair::from_secret(distribution_seed)
            .map_err(|e| SigningError::Config(format!("distribution seed: {}", e)))?;
        Ok(Self {
            network_passphrase: network_passphrase.to_string(),
            distribution,
        })
    }

    fn check_accounts(&self, accounts: &[String]) -> SigningResult<()> {
        match unique_accounts(accounts)?
            .into_iter()
            .find(|a| *a != self.distribution.address())
        {
            Some(other) => Err(SigningError::NotFound(other.to_string())),
            None => Ok(()),
        }
    }

    fn unsupported(operation: &'static str) -> SigningError {
        SigningError::Unsupported {
            service: "distribution account env",
            operation,
        }
    }
}

impl std::fmt::Debug for DistributionEnvSignatureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionEnvSignatureService")
            .field("distribution_account", &self.distribution.address())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DistributionAccountResolver for DistributionEnvSignatureService {
    async fn distribution_account(&self) -> SigningResult<String> {
        Ok(self.distribution.address().to_string())
    }
}

#[async_trait]
impl SignatureService for DistributionEnvSignatureService {
    async fn sign_transaction(&self, tx: &mut Transaction, accounts: &[String]) -> SigningResult<()> {
        self.check_accounts(accounts)?;
        tx.sign(&self.network_passphrase, &[&self.distribution])?;
        Ok(())
    }

    async fn sign_fee_bump_transaction(
        &self,
        tx: &mut FeeBumpTransaction,
        accounts: &[String],
    ) -> SigningResult<()> {
        self.check_accounts(accounts)?;
        tx.sign(&self.network_passphrase, &[&self.distribution])?;
        Ok(())
    }

    async fn batch_insert(&self, _count: usize) -> SigningResult<Vec<String>> {
        Err(Self::unsupported("batch insert"))
    }

    async fn delete(&self, _public_key: &str, _locked_until_ledger: u32) -> SigningResult<()> {
        Err(Self::unsupported("delete"))
    }

    fn network_passphrase(&self) -> &str {
        &self.network_passphrase
    }

    fn kind(&self) -> SignatureServiceType {
        SignatureServiceType::DistributionEnv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{payment_tx, TEST_NETWORK_PASSPHRASE};

    #[tokio::test]
    async fn test_signs_only_for_distribution_account() {
        let host = Keypair::random();
        let service = DistributionEnvSignatureService::new(TEST_NETWORK_PASSPHRASE, &host.secret_seed()).unwrap();
        assert!(service.is_distribution_account(host.address()).await.unwrap());

        let mut tx = payment_tx(host.address(), Keypair::random().address());
        service
            .sign_transaction(&mut tx, &[host.address().to_string(), host.address().to_string()])
            .await
            .unwrap();
        assert_eq!(tx.signatures().len(), 1);

        let stranger = Keypair::random();
        let err = service
            .sign_transaction(&mut tx, &[stranger.address().to_string()])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pool_operations_unsupported() {
        let host = Keypair::random();
        let service = DistributionEnvSignatureService::new(TEST_NETWORK_PASSPHRASE, &host.secret_seed()).unwrap();
        assert!(matches!(service.batch_insert(1).await, Err(SigningError::Unsupported { .. })));
        assert!(matches!(service.delete("GABC", 10).await, Err(SigningError::Unsupported { .. })));
    }
}
