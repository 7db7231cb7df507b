//! Processing limiter fed by classified simulation and submission failures

use std::time::Duration;

use tss_engine::engine::{
    DefaultTransactionProcessingLimiter, ErrorKind, LimiterSettings, SubmissionError,
    TransactionError, TransactionProcessingLimiter, LIMITER_WINDOW,
};
use tss_engine::network::{simulate_transaction, SimulationClientError, SimulationRequest, SimulationResponse};
use tss_engine::test_utils::{MockSimulationClient, TestHarness};
use tss_engine::Config;

fn request() -> SimulationRequest {
    SimulationRequest {
        transaction: "AAAA".to_string(),
        resource_config: None,
    }
}

fn failed_response(message: &str) -> SimulationResponse {
    SimulationResponse {
        error: message.to_string(),
        ..SimulationResponse::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_resource_simulation_failures_shrink_the_limit() {
    let client = MockSimulationClient::new();
    for _ in 0..10 {
        client.push_response(failed_response("HostError: Error(Budget, ExceededLimit) cpu limit exceeded"));
    }
    let limiter = DefaultTransactionProcessingLimiter::new(50);

    for _ in 0..10 {
        let err = simulate_transaction(&client, request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        limiter.adjust_limit_if_needed(&TransactionError::from(err));
    }
    assert_eq!(limiter.limit_value(), 8);
    assert_eq!(limiter.indeterminate_responses_counter(), 10);
    assert_eq!(client.requests().len(), 10);

    tokio::time::advance(LIMITER_WINDOW).await;
    assert_eq!(limiter.limit_value(), 50);
    assert_eq!(limiter.indeterminate_responses_counter(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_contract_failures_are_determinate() {
    let client = MockSimulationClient::new();
    client.push_response(failed_response("contract execution failed: cpu limit"));
    client.push_error(SimulationClientError::Transport("connection reset".to_string()));
    let limiter = DefaultTransactionProcessingLimiter::with_settings(
        20,
        LimiterSettings {
            tolerance: 2,
            window: Duration::from_secs(60),
            bundles_selection_limit: 8,
        },
    );

    // transport failure counts, contract failure walks the counter back
    let contract = simulate_transaction(&client, request()).await.unwrap_err();
    assert_eq!(contract.kind(), ErrorKind::ContractExecution);
    let transport = simulate_transaction(&client, request()).await.unwrap_err();
    assert_eq!(transport.kind(), ErrorKind::Network);

    limiter.adjust_limit_if_needed(&transport.into());
    assert_eq!(limiter.indeterminate_responses_counter(), 1);
    limiter.adjust_limit_if_needed(&contract.into());
    assert_eq!(limiter.indeterminate_responses_counter(), 0);
    assert_eq!(limiter.limit_value(), 20);

    assert!(simulate_transaction(&client, request()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limits_and_gateway_timeouts_count() {
    let limiter = DefaultTransactionProcessingLimiter::with_settings(
        6,
        LimiterSettings {
            tolerance: 3,
            ..LimiterSettings::default()
        },
    );
    limiter.adjust_limit_if_needed(&SubmissionError::status(429, "Too Many Requests").into());
    limiter.adjust_limit_if_needed(&SubmissionError::status(504, "Timeout").into());
    limiter.adjust_limit_if_needed(&SubmissionError::status(429, "Too Many Requests").into());

    // floor is min(default, count) so a small pool keeps its size
    assert_eq!(limiter.limit_value(), 6);
    assert_eq!(limiter.indeterminate_responses_counter(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_classifier_and_limiter_follow_configuration() {
    let config = Config::from_toml_str(
        r#"
[limiter]
tolerance = 3
bundles_selection_limit = 5

[[classifier.overrides]]
kind = "resource"
keywords = ["custom-kw"]
"#,
    )
    .unwrap();
    let engine = TestHarness::new(100)
        .engine()
        .with_error_classifier(config.error_classifier())
        .with_limiter_settings(config.limiter_settings());

    let client = MockSimulationClient::new();
    let limiter = engine.processing_limiter(30);
    for _ in 0..3 {
        client.push_response(failed_response("custom-kw threshold hit"));
        let err = engine.simulate(&client, request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        limiter.adjust_limit_if_needed(&err.into());
    }
    assert_eq!(limiter.limit_value(), 5);
    assert_eq!(limiter.indeterminate_responses_counter(), 3);
}
