//! Configuration module
//!
//! Loads the engine configuration from a TOML file, then applies environment
//! overrides (a `.env` file is honored through dotenvy). Secrets such as the
//! distribution seed are normally supplied through the environment only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::{ClassificationRule, ErrorClassifier, LimiterSettings};
use crate::signing::SignatureServiceType;
use crate::transaction::MIN_BASE_FEE;

pub const DISTRIBUTION_SEED_ENV: &str = "DISTRIBUTION_SEED";
pub const ENCRYPTION_PASSPHRASE_ENV: &str = "CHANNEL_ACCOUNT_ENCRYPTION_PASSPHRASE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {var}: {message}")]
    Env { var: &'static str, message: String },

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_horizon_url")]
    pub horizon_url: String,

    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    #[serde(default = "default_network_passphrase")]
    pub network_passphrase: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_signature_service_type")]
    pub signature_service_type: SignatureServiceType,

    #[serde(default, skip_serializing)]
    pub distribution_seed: Option<String>,

    #[serde(default, skip_serializing)]
    pub encryption_passphrase: Option<String>,

    /// Base URL of the custody service for the delegated signer
    #[serde(default)]
    pub custody_url: Option<String>,

    #[serde(default, skip_serializing)]
    pub custody_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_base_fee")]
    pub max_base_fee: u32,

    /// How long a fetched ledger number is reused
    #[serde(default = "default_max_ledger_age")]
    pub max_ledger_age_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// An advisory lock not renewed for this long can be taken over
    #[serde(default = "default_advisory_lock_ttl")]
    pub advisory_lock_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_bundles_selection_limit")]
    pub bundles_selection_limit: u32,
}

/// Keyword overrides for individual error kinds, in TOML as
/// `[[classifier.overrides]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub overrides: Vec<ClassificationRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_horizon_url() -> String { "https://horizon-testnet.stellar.org".to_string() }
fn default_rpc_url() -> String { "https://soroban-testnet.stellar.org".to_string() }
fn default_network_passphrase() -> String { "Test SDF Network ; September 2015".to_string() }
fn default_request_timeout() -> u64 { 30 }
fn default_signature_service_type() -> SignatureServiceType { SignatureServiceType::Default }
fn default_max_base_fee() -> u32 { MIN_BASE_FEE }
fn default_max_ledger_age() -> u64 { 10 }
fn default_store_backend() -> StoreBackend { StoreBackend::Sled }
fn default_store_path() -> PathBuf { PathBuf::from("data/channel_accounts") }
fn default_advisory_lock_ttl() -> u64 { crate::store::sled_store::DEFAULT_ADVISORY_LOCK_TTL.as_secs() }
fn default_tolerance() -> u32 { crate::engine::INDETERMINATE_RESPONSES_TOLERANCE_LIMIT }
fn default_window_secs() -> u64 { crate::engine::LIMITER_WINDOW.as_secs() }
fn default_bundles_selection_limit() -> u32 { crate::engine::DEFAULT_BUNDLES_SELECTION_LIMIT }
fn default_log_level() -> String { "info".to_string() }

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            horizon_url: default_horizon_url(),
            rpc_url: default_rpc_url(),
            network_passphrase: default_network_passphrase(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            signature_service_type: default_signature_service_type(),
            distribution_seed: None,
            encryption_passphrase: None,
            custody_url: None,
            custody_token: None,
        }
    }
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("signature_service_type", &self.signature_service_type)
            .field("distribution_seed", &self.distribution_seed.as_ref().map(|_| "<redacted>"))
            .field("encryption_passphrase", &self.encryption_passphrase.as_ref().map(|_| "<redacted>"))
            .field("custody_url", &self.custody_url)
            .field("custody_token", &self.custody_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_base_fee: default_max_base_fee(),
            max_ledger_age_secs: default_max_ledger_age(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            advisory_lock_ttl_secs: default_advisory_lock_ttl(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            window_secs: default_window_secs(),
            bundles_selection_limit: default_bundles_selection_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file without overrides or validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the file if given (defaults otherwise), apply `.env` and process
    /// environment overrides, then validate.
    pub fn from_env_overrides(path: Option<&Path>) -> ConfigResult<Self> {
        dotenvy::dotenv().ok();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps an environment variable name
    /// to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HORIZON_URL") {
            self.network.horizon_url = v;
        }
        if let Some(v) = lookup("RPC_URL") {
            self.network.rpc_url = v;
        }
        if let Some(v) = lookup("NETWORK_PASSPHRASE") {
            self.network.network_passphrase = v;
        }
        if let Some(v) = lookup("SIGNATURE_SERVICE_TYPE") {
            self.signing.signature_service_type = v.parse().map_err(|e| ConfigError::Env {
                var: "SIGNATURE_SERVICE_TYPE",
                message: format!("{}", e),
            })?;
        }
        if let Some(v) = lookup(DISTRIBUTION_SEED_ENV) {
            self.signing.distribution_seed = Some(v);
        }
        if let Some(v) = lookup(ENCRYPTION_PASSPHRASE_ENV) {
            self.signing.encryption_passphrase = Some(v);
        }
        if let Some(v) = lookup("CUSTODY_URL") {
            self.signing.custody_url = Some(v);
        }
        if let Some(v) = lookup("CUSTODY_TOKEN") {
            self.signing.custody_token = Some(v);
        }
        if let Some(v) = lookup("MAX_BASE_FEE") {
            self.engine.max_base_fee = v.parse().map_err(|e| ConfigError::Env {
                var: "MAX_BASE_FEE",
                message: format!("{}", e),
            })?;
        }
        if let Some(v) = lookup("CHANNEL_ACCOUNT_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (field, url) in [
            ("network.horizon_url", &self.network.horizon_url),
            ("network.rpc_url", &self.network.rpc_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(field, format!("{:?} is not an http(s) url", url)));
            }
        }
        if self.network.network_passphrase.is_empty() {
            return Err(invalid("network.network_passphrase", "cannot be empty"));
        }
        if self.network.request_timeout_secs == 0 {
            return Err(invalid("network.request_timeout_secs", "must be greater than zero"));
        }
        if self.store.advisory_lock_ttl_secs == 0 {
            return Err(invalid("store.advisory_lock_ttl_secs", "must be greater than zero"));
        }

        if self.engine.max_base_fee < MIN_BASE_FEE {
            return Err(invalid(
                "engine.max_base_fee",
                format!("must be at least {}, got {}", MIN_BASE_FEE, self.engine.max_base_fee),
            ));
        }
        if self.engine.max_ledger_age_secs == 0 {
            return Err(invalid("engine.max_ledger_age_secs", "must be greater than zero"));
        }

        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        match self.signing.signature_service_type {
            SignatureServiceType::Default => {
                if !has(&self.signing.distribution_seed) {
                    return Err(invalid("signing.distribution_seed", format!("{} is not set", DISTRIBUTION_SEED_ENV)));
                }
                if !has(&self.signing.encryption_passphrase) {
                    return Err(invalid(
                        "signing.encryption_passphrase",
                        format!("{} is not set", ENCRYPTION_PASSPHRASE_ENV),
                    ));
                }
            }
            SignatureServiceType::DistributionEnv => {
                if !has(&self.signing.distribution_seed) {
                    return Err(invalid("signing.distribution_seed", format!("{} is not set", DISTRIBUTION_SEED_ENV)));
                }
            }
            SignatureServiceType::Delegated => {
                if !has(&self.signing.custody_url) {
                    return Err(invalid("signing.custody_url", "required for the delegated signature service"));
                }
            }
        }

        if self.store.backend == StoreBackend::Sled && self.store.path.as_os_str().is_empty() {
            return Err(invalid("store.path", "required for the sled backend"));
        }

        if self.limiter.tolerance == 0 {
            return Err(invalid("limiter.tolerance", "must be greater than zero"));
        }
        if self.limiter.window_secs == 0 {
            return Err(invalid("limiter.window_secs", "must be greater than zero"));
        }
        if self.limiter.bundles_selection_limit == 0 {
            return Err(invalid("limiter.bundles_selection_limit", "must be greater than zero"));
        }

        if self.logging.level.trim().is_empty() {
            return Err(invalid("logging.level", "cannot be empty"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_secs)
    }

    pub fn max_ledger_age(&self) -> Duration {
        Duration::from_secs(self.engine.max_ledger_age_secs)
    }

    pub fn advisory_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.store.advisory_lock_ttl_secs)
    }

    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            tolerance: self.limiter.tolerance,
            window: Duration::from_secs(self.limiter.window_secs),
            bundles_selection_limit: self.limiter.bundles_selection_limit,
        }
    }

    pub fn error_classifier(&self) -> ErrorClassifier {
        ErrorClassifier::with_overrides(&self.classifier.overrides)
    }
}
