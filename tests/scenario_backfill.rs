//! Gap detection and historical backfill: a hole in the hourly series is
//! found, enqueued, and closed via `before_timestamp` pagination.

mod common;

use common::{aligned_now, candle, dec, harness};
use gecko_harvester::collectors::historical_ohlcv::{BackfillQueue, HistoricalOhlcvCollector};
use gecko_harvester::collectors::ohlcv::OhlcvCollector;
use gecko_harvester::models::{OhlcvCandle, Timeframe};
use std::sync::Arc;

const POOL_ID: &str = "solana_gap1";
const POOL_ADDR: &str = "gap1";
const H: i64 = 3_600;

fn hourly(ts: i64) -> OhlcvCandle {
    OhlcvCandle::new(
        POOL_ID,
        Timeframe::H1,
        ts,
        dec(1.0),
        dec(1.1),
        dec(0.9),
        dec(1.0),
        dec(250.0),
    )
}

#[tokio::test]
async fn gap_is_detected_enqueued_and_backfilled() {
    let h = harness().await;
    h.watch(POOL_ID, POOL_ADDR).await;
    let t = aligned_now();

    // Persisted coverage: [T-48h, T-24h) and [T-12h, T); the middle twelve
    // hours are missing.
    let mut preloaded = Vec::new();
    for i in 25..=48 {
        preloaded.push(hourly(t - i * H));
    }
    for i in 1..=12 {
        preloaded.push(hourly(t - i * H));
    }
    h.storage.insert_candles(&preloaded).await.unwrap();

    // The gap query sees exactly one hole.
    let gaps = h
        .storage
        .find_candle_gaps(POOL_ID, Timeframe::H1, t - 48 * H, t)
        .await
        .unwrap();
    assert_eq!(gaps, vec![(t - 24 * H, t - 12 * H)]);

    // Upstream has the full series; the live fetch window is small enough
    // that only the backfill loop can close the hole.
    h.mock.add_ohlcv(
        POOL_ADDR,
        Timeframe::H1,
        (1..=48).map(|i| candle(t - i * H, 1.0, 250.0)).collect(),
    );

    let backfill = Arc::new(BackfillQueue::new());
    let ohlcv = OhlcvCollector::new(
        h.api.clone(),
        h.storage.clone(),
        backfill.clone(),
        "solana",
        vec![Timeframe::H1],
        5, // live fetch covers only the newest five hours
        48,
        180,
        2,
    );
    let result = h.run(&ohlcv).await;
    eprintln!("DEBUG errors: {:?}", result.errors);
    assert!(result.success);
    assert_eq!(backfill.len(), 1);

    let historical = HistoricalOhlcvCollector::new(
        h.api.clone(),
        h.storage.clone(),
        backfill.clone(),
        "solana",
        5,
        180,
    );
    let result = h.run(&historical).await;
    assert!(result.success);
    assert!(result.records_stored >= 12);
    assert!(backfill.is_empty());

    // The hole is closed end to end.
    let gaps = h
        .storage
        .find_candle_gaps(POOL_ID, Timeframe::H1, t - 48 * H, t)
        .await
        .unwrap();
    assert!(gaps.is_empty());

    let rows = h
        .storage
        .candles_in_range(POOL_ID, Timeframe::H1, t - 48 * H, t - H)
        .await
        .unwrap();
    assert_eq!(rows.len(), 48);

    h.storage.close().await;
}

#[tokio::test]
async fn backfill_respects_the_horizon() {
    let h = harness().await;
    let t = aligned_now();

    // A gap entirely older than the horizon is never enqueued.
    h.watch(POOL_ID, POOL_ADDR).await;
    h.storage
        .insert_candles(&[hourly(t - 2 * H), hourly(t - H)])
        .await
        .unwrap();
    h.mock.add_ohlcv(
        POOL_ADDR,
        Timeframe::H1,
        vec![candle(t - H, 1.0, 250.0)],
    );

    let backfill = Arc::new(BackfillQueue::new());
    let ohlcv = OhlcvCollector::new(
        h.api.clone(),
        h.storage.clone(),
        backfill.clone(),
        "solana",
        vec![Timeframe::H1],
        5,
        48,
        // Horizon of zero days: every gap is too old to serve.
        0,
        2,
    );
    let result = h.run(&ohlcv).await;
    eprintln!("DEBUG errors: {:?}", result.errors);
    assert!(result.success);
    assert!(backfill.is_empty());

    h.storage.close().await;
}
