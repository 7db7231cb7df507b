//! Metrics collection and export module

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Channel account lifecycle
    pub channel_accounts_created: IntCounter,
    pub channel_accounts_deleted: IntCounter,
    pub channel_account_rollbacks: IntCounter,

    // Submission path
    pub ledger_fetches: IntCounter,
    pub indeterminate_responses: IntCounter,
    pub transactions_submitted: IntCounter,

    pub limiter_limit_value: IntGauge,

    pub sign_duration: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let channel_accounts_created = IntCounter::with_opts(Opts::new(
            "tss_channel_accounts_created_total",
            "Channel accounts created on chain",
        ))?;

        let channel_accounts_deleted = IntCounter::with_opts(Opts::new(
            "tss_channel_accounts_deleted_total",
            "Channel accounts removed from the pool",
        ))?;

        let channel_account_rollbacks = IntCounter::with_opts(Opts::new(
            "tss_channel_account_rollbacks_total",
            "Channel account rows removed by compensating rollback",
        ))?;

        let ledger_fetches = IntCounter::with_opts(Opts::new(
            "tss_ledger_fetches_total",
            "Ledger number fetches that reached the network",
        ))?;

        let indeterminate_responses = IntCounter::with_opts(Opts::new(
            "tss_indeterminate_responses_total",
            "Indeterminate submission or simulation responses seen by the limiter",
        ))?;

        let transactions_submitted = IntCounter::with_opts(Opts::new(
            "tss_transactions_submitted_total",
            "Transactions accepted by the network",
        ))?;

        let limiter_limit_value = IntGauge::with_opts(Opts::new(
            "tss_limiter_limit_value",
            "Channel accounts the limiter currently allows per round",
        ))?;

        let sign_duration = Histogram::with_opts(
            HistogramOpts::new("tss_sign_duration_seconds", "Transaction signing latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(channel_accounts_created.clone()))?;
        registry.register(Box::new(channel_accounts_deleted.clone()))?;
        registry.register(Box::new(channel_account_rollbacks.clone()))?;
        registry.register(Box::new(ledger_fetches.clone()))?;
        registry.register(Box::new(indeterminate_responses.clone()))?;
        registry.register(Box::new(transactions_submitted.clone()))?;
        registry.register(Box::new(limiter_limit_value.clone()))?;
        registry.register(Box::new(sign_duration.clone()))?;

        Ok(Self {
            registry,
            channel_accounts_created,
            channel_accounts_deleted,
            channel_account_rollbacks,
            ledger_fetches,
            indeterminate_responses,
            transactions_submitted,
            limiter_limit_value,
            sign_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every registered metric
    pub fn gather_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text_exposes_named_metrics() {
        metrics().ledger_fetches.inc();
        let text = metrics().gather_text().unwrap();
        assert!(text.contains("tss_ledger_fetches_total"));
        assert!(text.contains("tss_limiter_limit_value"));
    }

    #[test]
    fn test_private_registries_are_independent() {
        let local = Metrics::new().unwrap();
        local.channel_accounts_created.inc_by(3);
        assert_eq!(local.channel_accounts_created.get(), 3);
        assert!(local.gather_text().unwrap().contains("tss_channel_accounts_created_total 3"));
    }
}
