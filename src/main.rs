//! tss-channel-accounts
//!
//! Operator CLI for the channel-account pool: create, delete, verify and
//! reconcile channel accounts, and fund new accounts from the host.

#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use tss_engine::channel_accounts::{DeleteChannelAccountsOptions, RetryConfig};
use tss_engine::config::StoreBackend;
use tss_engine::engine::DefaultLedgerNumberTracker;
use tss_engine::network::HorizonHttpClient;
use tss_engine::observability::init_tracing;
use tss_engine::signing::{new_signature_service, HttpCustodyClient, SignatureServiceOptions};
use tss_engine::store::{
    AdvisoryLocker, ChannelAccountStore, InMemoryChannelAccountStore, SledChannelAccountStore,
};
use tss_engine::{ChannelAccountsService, Config, SubmitterEngine};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file; defaults plus environment otherwise
    #[arg(short, long, env = "TSS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create sponsored channel accounts
    Create {
        #[arg(long)]
        count: usize,
    },
    /// Merge channel accounts back into the host and remove them
    Delete {
        #[arg(long, conflicts_with = "all")]
        id: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Check stored channel accounts against the network
    Verify {
        #[arg(long)]
        delete_invalid: bool,
    },
    /// Create or delete channel accounts until exactly `count` exist
    Ensure {
        #[arg(long)]
        count: usize,
    },
    /// List stored channel accounts
    List,
    /// Create and fund an account from the host distribution account
    Fund {
        #[arg(long)]
        amount: String,
        #[arg(long)]
        destination: String,
        /// Submit once instead of retrying transient failures
        #[arg(long)]
        no_retry: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_env_overrides(args.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging).context("initializing tracing")?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting tss-channel-accounts");

    let service = build_service(&config)?;
    run(&service, args.command).await
}

fn open_store(config: &Config) -> Result<(Arc<dyn ChannelAccountStore>, Arc<dyn AdvisoryLocker>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryChannelAccountStore::new());
            let locker: Arc<dyn AdvisoryLocker> = store.clone();
            let store: Arc<dyn ChannelAccountStore> = store;
            Ok((store, locker))
        }
        StoreBackend::Sled => {
            let store = Arc::new(
                SledChannelAccountStore::open(&config.store.path)
                    .with_context(|| format!("opening channel account store at {}", config.store.path.display()))?
                    .with_advisory_ttl(config.advisory_lock_ttl()),
            );
            let locker: Arc<dyn AdvisoryLocker> = store.clone();
            let store: Arc<dyn ChannelAccountStore> = store;
            Ok((store, locker))
        }
    }
}

fn build_service(config: &Config) -> Result<ChannelAccountsService> {
    let network_client = Arc::new(
        HorizonHttpClient::new(&config.network.horizon_url, config.request_timeout())
            .context("creating network client")?,
    );
    let ledger_tracker = Arc::new(
        DefaultLedgerNumberTracker::new(network_client.clone(), config.max_ledger_age())
            .context("creating ledger tracker")?,
    );
    let (store, advisory_locker) = open_store(config)?;

    let mut opts = SignatureServiceOptions::new(
        config.signing.signature_service_type,
        &config.network.network_passphrase,
    );
    opts.distribution_seed = config.signing.distribution_seed.clone();
    opts.encryption_passphrase = config.signing.encryption_passphrase.clone();
    opts.store = Some(store.clone());
    opts.ledger_tracker = Some(ledger_tracker.clone());
    if let Some(url) = &config.signing.custody_url {
        let mut client = HttpCustodyClient::new(url.as_str(), config.request_timeout())
            .context("creating custody client")?;
        if let Some(token) = &config.signing.custody_token {
            client = client.with_token(token.as_str());
        }
        opts.custody_client = Some(Arc::new(client));
    }
    let signature_service = new_signature_service(opts).context("creating signature service")?;

    let engine = SubmitterEngine::new(
        network_client,
        ledger_tracker,
        signature_service,
        config.engine.max_base_fee,
    )
    .context("creating submitter engine")?
    .with_error_classifier(config.error_classifier())
    .with_limiter_settings(config.limiter_settings());
    Ok(ChannelAccountsService::new(engine, store, advisory_locker))
}

async fn run(service: &ChannelAccountsService, command: Command) -> Result<()> {
    match command {
        Command::Create { count } => {
            let keys = service.create_channel_accounts(count).await?;
            for key in keys {
                println!("{}", key);
            }
        }
        Command::Delete { id, all } => {
            let deleted = service
                .delete_channel_account(DeleteChannelAccountsOptions {
                    channel_account_id: id,
                    delete_all: all,
                })
                .await?;
            println!("deleted {} channel accounts", deleted);
        }
        Command::Verify { delete_invalid } => {
            let report = service.verify_channel_accounts(delete_invalid).await?;
            println!(
                "total: {}, invalid: {}, deleted: {}",
                report.total, report.invalid, report.deleted
            );
        }
        Command::Ensure { count } => {
            service.ensure_channel_accounts_count(count).await?;
        }
        Command::List => {
            for account in service.list_channel_accounts().await? {
                match account.locked_until_ledger {
                    Some(until) => println!("{}\tlocked until {}", account.public_key, until),
                    None => println!("{}", account.public_key),
                }
            }
        }
        Command::Fund {
            amount,
            destination,
            no_retry,
        } => {
            let retry = if no_retry {
                RetryConfig::none()
            } else {
                RetryConfig::default()
            };
            service
                .create_and_fund_account(&amount, &destination, &retry)
                .await?;
            println!("funded {} with {}", destination, amount);
        }
    }
    Ok(())
}
