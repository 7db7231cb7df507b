//! Simulation RPC client.
//!
//! The client trait only reports raw failures; classification happens in
//! [`simulate_transaction_with`], which turns a client error or a response
//! carrying an error message into a [`SimulationError`] using the supplied
//! keyword rules.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::engine::error_classifier::{default_classifier, ErrorClassifier, ErrorKind};
use crate::engine::tx_errors::SimulationError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub instruction_leeway: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    /// Base64 transaction envelope
    pub transaction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_config: Option<ResourceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub transaction_data: Option<String>,
    #[serde(default)]
    pub min_resource_fee: Option<String>,
    #[serde(default)]
    pub latest_ledger: u32,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SimulationClientError {
    #[error("simulation request failed: {0}")]
    Transport(String),

    #[error("simulation rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("simulation response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SimulationClient: Send + Sync {
    async fn simulate_transaction(
        &self,
        request: SimulationRequest,
    ) -> Result<SimulationResponse, SimulationClientError>;
}

/// Run a simulation and classify any failure with the default rules.
pub async fn simulate_transaction(
    client: &dyn SimulationClient,
    request: SimulationRequest,
) -> Result<SimulationResponse, SimulationError> {
    simulate_transaction_with(client, request, default_classifier()).await
}

/// Run a simulation and classify any failure it reports.
///
/// JSON-RPC error messages go through the keyword rules too; one that
/// matches none of them counts as a failed request.
pub async fn simulate_transaction_with(
    client: &dyn SimulationClient,
    request: SimulationRequest,
    classifier: &ErrorClassifier,
) -> Result<SimulationResponse, SimulationError> {
    match client.simulate_transaction(request).await {
        Err(SimulationClientError::Rpc { code, message }) => {
            let kind = match classifier.classify(&message) {
                ErrorKind::Unknown => ErrorKind::Network,
                kind => kind,
            };
            let cause = SimulationClientError::Rpc { code, message };
            Err(SimulationError::with_kind(kind, Some(Arc::new(cause)), None))
        }
        Err(err) => Err(SimulationError::classified(Some(Arc::new(err)), None, classifier)),
        Ok(response) if !response.error.is_empty() => {
            let cause = SimulationClientError::Rpc {
                code: 0,
                message: response.error.clone(),
            };
            Err(SimulationError::classified(Some(Arc::new(cause)), Some(response), classifier))
        }
        Ok(response) => Ok(response),
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 simulation client with an optional auth header.
#[derive(Debug, Clone)]
pub struct RpcSimulationClient {
    client: Client,
    url: String,
    auth_header: Option<(String, String)>,
}

impl RpcSimulationClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SimulationClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SimulationClientError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            auth_header: None,
        })
    }

    pub fn with_auth_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_header = Some((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl SimulationClient for RpcSimulationClient {
    async fn simulate_transaction(
        &self,
        request: SimulationRequest,
    ) -> Result<SimulationResponse, SimulationClientError> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "simulateTransaction",
            params: request,
        };
        let mut builder = self.client.post(&self.url).json(&body);
        if let Some((key, value)) = &self.auth_header {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SimulationClientError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SimulationClientError::Transport(format!(
                "unexpected status {}",
                status
            )));
        }

        let decoded: JsonRpcResponse<SimulationResponse> = response
            .json()
            .await
            .map_err(|e| SimulationClientError::Decode(e.to_string()))?;
        match (decoded.result, decoded.error) {
            (_, Some(err)) => Err(SimulationClientError::Rpc {
                code: err.code,
                message: err.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(SimulationClientError::Decode(
                "response carries neither result nor error".to_string(),
            )),
        }
    }
}
