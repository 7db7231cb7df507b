//! Transaction submission engine with a pooled channel-account lifecycle.
//!
//! Channel accounts give the submission path independent sequence numbers.
//! This library provisions them with sponsored creation, signs with them,
//! tracks ledger-range leases on them, reconciles them against the network
//! and merges them back into the host account when the pool shrinks.
//!
//! Layout:
//! - [`transaction`]: transaction model, envelopes and signature payloads
//! - [`crypto`]: keypairs and at-rest encryption of channel seeds
//! - [`network`]: network and simulation RPC clients
//! - [`store`]: lockable channel-account pool and advisory lock
//! - [`signing`]: pluggable signature services
//! - [`engine`]: ledger tracking, error classification, processing limiter
//! - [`channel_accounts`]: lifecycle commands

pub mod channel_accounts;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod metrics;
pub mod network;
pub mod observability;
pub mod signing;
pub mod store;
pub mod transaction;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use channel_accounts::{ChannelAccountsService, LifecycleError, LifecycleResult};
pub use config::{Config, ConfigError};
pub use engine::SubmitterEngine;
