use std::sync::Arc;
use thiserror::Error;

use super::error_classifier::ErrorClassifier;
use super::ledger_tracker::LedgerNumberTracker;
use super::tx_errors::SimulationError;
use super::tx_limiter::{DefaultTransactionProcessingLimiter, LimiterSettings};
use crate::network::{
    simulate_transaction_with, NetworkClient, SimulationClient, SimulationRequest, SimulationResponse,
};
use crate::signing::{SignatureService, SigningError};
use crate::transaction::MIN_BASE_FEE;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("maximum base fee must be greater than or equal to 100, got {0}")]
    MaxBaseFeeTooLow(u32),

    #[error("resolving host distribution account: {0}")]
    DistributionAccount(#[source] SigningError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Collaborators every on-chain operation needs, bundled so they travel
/// together through the channel-account lifecycle.
///
/// The error classifier and limiter settings default to the built-in rules
/// and are replaced from configuration with the `with_*` builders.
#[derive(Clone)]
pub struct SubmitterEngine {
    pub network_client: Arc<dyn NetworkClient>,
    pub ledger_tracker: Arc<dyn LedgerNumberTracker>,
    pub signature_service: Arc<dyn SignatureService>,
    pub max_base_fee: u32,
    pub error_classifier: Arc<ErrorClassifier>,
    pub limiter_settings: LimiterSettings,
}

impl SubmitterEngine {
    pub fn new(
        network_client: Arc<dyn NetworkClient>,
        ledger_tracker: Arc<dyn LedgerNumberTracker>,
        signature_service: Arc<dyn SignatureService>,
        max_base_fee: u32,
    ) -> EngineResult<Self> {
        let engine = Self {
            network_client,
            ledger_tracker,
            signature_service,
            max_base_fee,
            error_classifier: Arc::new(ErrorClassifier::default()),
            limiter_settings: LimiterSettings::default(),
        };
        engine.validate()?;
        Ok(engine)
    }

    pub fn with_error_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.error_classifier = Arc::new(classifier);
        self
    }

    pub fn with_limiter_settings(mut self, settings: LimiterSettings) -> Self {
        self.limiter_settings = settings;
        self
    }

    /// Simulate through `client`, classifying failures with this engine's rules.
    pub async fn simulate(
        &self,
        client: &dyn SimulationClient,
        request: SimulationRequest,
    ) -> Result<SimulationResponse, SimulationError> {
        simulate_transaction_with(client, request, &self.error_classifier).await
    }

    /// Limiter for a submission round over `channel_account_count` accounts.
    pub fn processing_limiter(&self, channel_account_count: i64) -> DefaultTransactionProcessingLimiter {
        DefaultTransactionProcessingLimiter::with_settings(channel_account_count, self.limiter_settings)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_base_fee < MIN_BASE_FEE {
            return Err(EngineError::MaxBaseFeeTooLow(self.max_base_fee));
        }
        Ok(())
    }

    /// Account that funds, sponsors and signs for channel-account operations.
    pub async fn host_distribution_account(&self) -> EngineResult<String> {
        self.signature_service
            .distribution_account()
            .await
            .map_err(EngineError::DistributionAccount)
    }
}

impl std::fmt::Debug for SubmitterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitterEngine")
            .field("signature_service", &self.signature_service.kind())
            .field("max_base_fee", &self.max_base_fee)
            .field("limiter_settings", &self.limiter_settings)
            .finish_non_exhaustive()
    }
}
