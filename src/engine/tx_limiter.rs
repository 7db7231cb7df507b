//! Adaptive ceiling on how many channel accounts a submission round may use.
//!
//! Indeterminate responses (timeouts, throttling, fee pressure, retryable
//! simulation failures) push the ceiling down once they pile up inside the
//! window. The ceiling recovers to the full pool size lazily, on the first
//! read after the window has passed since the last forced adjustment.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::tx_errors::TransactionError;
use crate::metrics::metrics;

pub const DEFAULT_BUNDLES_SELECTION_LIMIT: u32 = 8;
pub const INDETERMINATE_RESPONSES_TOLERANCE_LIMIT: u32 = 10;
pub const LIMITER_WINDOW: Duration = Duration::from_secs(3 * 60);

pub trait TransactionProcessingLimiter: Send + Sync {
    fn adjust_limit_if_needed(&self, err: &TransactionError);

    /// Current ceiling; resets it first if the window has elapsed.
    fn limit_value(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSettings {
    pub tolerance: u32,
    pub window: Duration,
    pub bundles_selection_limit: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            tolerance: INDETERMINATE_RESPONSES_TOLERANCE_LIMIT,
            window: LIMITER_WINDOW,
            bundles_selection_limit: DEFAULT_BUNDLES_SELECTION_LIMIT,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    current_channel_account_count: u32,
    limit_value: u32,
    indeterminate_responses_counter: u32,
    window_start: Instant,
}

#[derive(Debug)]
pub struct DefaultTransactionProcessingLimiter {
    settings: LimiterSettings,
    state: Mutex<LimiterState>,
}

impl DefaultTransactionProcessingLimiter {
    /// A non-positive count falls back to the bundles selection limit.
    pub fn new(current_channel_account_count: i64) -> Self {
        Self::with_settings(current_channel_account_count, LimiterSettings::default())
    }

    pub fn with_settings(current_channel_account_count: i64, settings: LimiterSettings) -> Self {
        let count = if current_channel_account_count > 0 {
            u32::try_from(current_channel_account_count).unwrap_or(u32::MAX)
        } else {
            warn!(
                count = current_channel_account_count,
                fallback = settings.bundles_selection_limit,
                "invalid channel account count, using default selection limit"
            );
            settings.bundles_selection_limit
        };
        metrics().limiter_limit_value.set(i64::from(count));
        Self {
            settings,
            state: Mutex::new(LimiterState {
                current_channel_account_count: count,
                limit_value: count,
                indeterminate_responses_counter: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn indeterminate_responses_counter(&self) -> u32 {
        self.state.lock().indeterminate_responses_counter
    }

    pub fn current_channel_account_count(&self) -> u32 {
        self.state.lock().current_channel_account_count
    }

    fn reduce_limit(&self, state: &mut LimiterState) {
        let default = self.settings.bundles_selection_limit;
        let floor = default.min(state.current_channel_account_count);
        let reduced = (state.limit_value / 2).min(default).max(floor);

        info!(
            previous = state.limit_value,
            limit = reduced,
            counter = state.indeterminate_responses_counter,
            "indeterminate responses reached tolerance, reducing processing limit"
        );
        state.limit_value = reduced;
        state.indeterminate_responses_counter = self.settings.tolerance;
        state.window_start = Instant::now();
        metrics().limiter_limit_value.set(i64::from(reduced));
    }
}

impl TransactionProcessingLimiter for DefaultTransactionProcessingLimiter {
    fn adjust_limit_if_needed(&self, err: &TransactionError) {
        let mut state = self.state.lock();

        if err.is_indeterminate() {
            metrics().indeterminate_responses.inc();
            state.indeterminate_responses_counter = state.indeterminate_responses_counter.saturating_add(1);
            debug!(
                kind = %err.kind(),
                counter = state.indeterminate_responses_counter,
                "indeterminate response"
            );
            if state.indeterminate_responses_counter >= self.settings.tolerance {
                self.reduce_limit(&mut state);
            }
        } else {
            state.indeterminate_responses_counter = state.indeterminate_responses_counter.saturating_sub(1);
        }
    }

    fn limit_value(&self) -> u32 {
        let mut state = self.state.lock();
        if state.window_start.elapsed() >= self.settings.window {
            if state.limit_value != state.current_channel_account_count {
                info!(
                    limit = state.current_channel_account_count,
                    "processing limit window elapsed, restoring full limit"
                );
            }
            state.limit_value = state.current_channel_account_count;
            state.indeterminate_responses_counter = 0;
            state.window_start = Instant::now();
            metrics().limiter_limit_value.set(i64::from(state.limit_value));
        }
        state.limit_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tx_errors::{ResultCodes, SubmissionError, TransportFailure};

    fn timeout() -> TransactionError {
        SubmissionError::transport(TransportFailure::Timeout, "deadline exceeded").into()
    }

    fn bad_seq() -> TransactionError {
        SubmissionError::with_result_codes(
            400,
            ResultCodes {
                transaction: "tx_bad_seq".into(),
                ..ResultCodes::default()
            },
        )
        .into()
    }

    #[test]
    fn test_non_positive_count_falls_back() {
        assert_eq!(DefaultTransactionProcessingLimiter::new(0).limit_value(), 8);
        assert_eq!(DefaultTransactionProcessingLimiter::new(-5).limit_value(), 8);
        assert_eq!(DefaultTransactionProcessingLimiter::new(3).limit_value(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reduces_after_tolerance_and_recovers_after_window() {
        let limiter = DefaultTransactionProcessingLimiter::new(50);

        for _ in 0..INDETERMINATE_RESPONSES_TOLERANCE_LIMIT - 1 {
            limiter.adjust_limit_if_needed(&timeout());
        }
        assert_eq!(limiter.limit_value(), 50);

        limiter.adjust_limit_if_needed(&timeout());
        assert_eq!(limiter.limit_value(), 8);
        assert_eq!(limiter.indeterminate_responses_counter(), 10);

        tokio::time::advance(LIMITER_WINDOW).await;
        assert_eq!(limiter.limit_value(), 50);
        assert_eq!(limiter.indeterminate_responses_counter(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_pressure_halves_down_to_floor() {
        let limiter = DefaultTransactionProcessingLimiter::new(50);
        for _ in 0..10 {
            limiter.adjust_limit_if_needed(&timeout());
        }
        assert_eq!(limiter.limit_value(), 8);

        // counter sits at the tolerance, so one more pushes another reduction
        limiter.adjust_limit_if_needed(&timeout());
        assert_eq!(limiter.limit_value(), 8);

        let small = DefaultTransactionProcessingLimiter::new(5);
        for _ in 0..30 {
            small.adjust_limit_if_needed(&timeout());
        }
        assert_eq!(small.limit_value(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_determinate_errors_decrement_counter() {
        let limiter = DefaultTransactionProcessingLimiter::new(50);
        limiter.adjust_limit_if_needed(&bad_seq());
        assert_eq!(limiter.indeterminate_responses_counter(), 0);

        for _ in 0..3 {
            limiter.adjust_limit_if_needed(&timeout());
        }
        limiter.adjust_limit_if_needed(&bad_seq());
        assert_eq!(limiter.indeterminate_responses_counter(), 2);
        assert_eq!(limiter.limit_value(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_restarts_on_each_forced_adjustment() {
        let limiter = DefaultTransactionProcessingLimiter::new(50);
        for _ in 0..10 {
            limiter.adjust_limit_if_needed(&timeout());
        }
        tokio::time::advance(LIMITER_WINDOW / 2).await;
        limiter.adjust_limit_if_needed(&timeout());

        tokio::time::advance(LIMITER_WINDOW / 2 + Duration::from_secs(1)).await;
        assert_eq!(limiter.limit_value(), 8);

        tokio::time::advance(LIMITER_WINDOW / 2).await;
        assert_eq!(limiter.limit_value(), 50);
    }
}
