//! Resilience scenarios: rate-limit backoff and the circuit breaker trip.

mod common;

use common::{aligned_now, candle, harness, harness_with};
use gecko_harvester::api::mock::MockClient;
use gecko_harvester::api::{Endpoint, PoolDataApi};
use gecko_harvester::collectors::historical_ohlcv::BackfillQueue;
use gecko_harvester::collectors::ohlcv::OhlcvCollector;
use gecko_harvester::error::HarvestError;
use gecko_harvester::models::Timeframe;
use std::sync::Arc;
use std::time::Duration;

const POOL_ID: &str = "solana_res1";
const POOL_ADDR: &str = "res1";

fn ohlcv_collector(
    h: &common::Harness,
    backfill: Arc<BackfillQueue>,
) -> OhlcvCollector {
    OhlcvCollector::new(
        h.api.clone(),
        h.storage.clone(),
        backfill,
        "solana",
        vec![Timeframe::H1],
        100,
        48,
        180,
        2,
    )
}

fn server_error() -> HarvestError {
    HarvestError::ServerError {
        status: 500,
        message: "upstream down".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limit_backoff_waits_out_retry_after() {
    let h = harness().await;
    h.watch(POOL_ID, POOL_ADDR).await;

    let t = aligned_now();
    h.mock
        .add_ohlcv(POOL_ADDR, Timeframe::H1, vec![candle(t - 3_600, 1.0, 100.0)]);
    // First two calls are rejected with Retry-After: 2.
    for _ in 0..2 {
        h.mock.script_failure(
            Endpoint::Ohlcv,
            HarvestError::RateLimit {
                retry_after: Some(Duration::from_secs(2)),
            },
        );
    }

    let started = tokio::time::Instant::now();
    let collector = ohlcv_collector(&h, Arc::new(BackfillQueue::new()));
    let result = h.run(&collector).await;

    assert!(result.success);
    assert!(result.records_stored >= 1);
    assert_eq!(h.mock.call_count(Endpoint::Ohlcv), 3);
    // Two Retry-After waits of two seconds each.
    assert!(started.elapsed() >= Duration::from_secs(4));

    h.storage.close().await;
}

#[tokio::test]
async fn circuit_breaker_trips_and_recovers() {
    let h = harness_with(|settings| {
        // One outbound attempt per pass; short recovery window so the
        // probe can be exercised in-test.
        settings.retry.max_retries = 0;
        settings.circuit_breaker.failure_threshold = 5;
        settings.circuit_breaker.recovery_timeout_secs = 1;
    })
    .await;
    h.watch(POOL_ID, POOL_ADDR).await;

    let t = aligned_now();
    h.mock
        .add_ohlcv(POOL_ADDR, Timeframe::H1, vec![candle(t - 3_600, 1.0, 100.0)]);

    let backfill = Arc::new(BackfillQueue::new());
    let collector = ohlcv_collector(&h, backfill);

    // Five consecutive server errors open the circuit.
    for run in 1..=5 {
        h.mock.script_failure(Endpoint::Ohlcv, server_error());
        let result = h.run(&collector).await;
        assert!(!result.success, "run {run} should fail");
        assert_eq!(result.error_kind, Some("server_error"));
    }
    assert_eq!(h.mock.call_count(Endpoint::Ohlcv), 5);

    // Inside the recovery window: fail fast, zero outbound calls.
    let result = h.run(&collector).await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some("circuit_open"));
    assert_eq!(h.mock.call_count(Endpoint::Ohlcv), 5);

    // Metadata counted every wrapped invocation.
    let metadata = h
        .storage
        .get_collector_metadata("ohlcv_collector")
        .await
        .unwrap();
    assert_eq!(metadata.run_count, 6);
    assert_eq!(metadata.error_count, 6);

    // After the recovery timeout a probe goes out and closes the breaker.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let result = h.run(&collector).await;
    assert!(result.success);
    assert_eq!(h.mock.call_count(Endpoint::Ohlcv), 6);

    h.storage.close().await;
}

#[tokio::test]
async fn scripted_failures_exhaust_in_order() {
    // The mock consumes its scripted failures before serving fixtures.
    let mock = MockClient::empty();
    mock.script_failure(Endpoint::Trades, server_error());
    let first = mock.trades("solana", "p", 0.0).await;
    assert!(first.is_err());
    let second = mock.trades("solana", "p", 0.0).await;
    assert!(second.is_ok());
}
