//! Shared harness for the end-to-end scenarios: an in-memory store, the
//! fixture-backed mock transport, and the full resilience stack in front
//! of it, wired exactly as the service binary wires them.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use gecko_harvester::api::mock::MockClient;
use gecko_harvester::api::models::{ApiPool, RawCandle};
use gecko_harvester::api::resilient::ResilientApi;
use gecko_harvester::circuit_breaker::CircuitBreaker;
use gecko_harvester::collectors::{run_collector, CollectionResult, Collector};
use gecko_harvester::error_handler::ErrorHandler;
use gecko_harvester::models::{Timeframe, WatchlistEntry};
use gecko_harvester::rate_limiter::ApiRateLimiter;
use gecko_harvester::retry::RetryPolicy;
use gecko_harvester::settings::Settings;
use gecko_harvester::storage::Storage;
use gecko_harvester::watchlist::WatchlistManager;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub settings: Arc<Settings>,
    pub storage: Arc<Storage>,
    pub mock: Arc<MockClient>,
    pub api: Arc<ResilientApi>,
    pub error_handler: Arc<ErrorHandler>,
    pub watchlist: Arc<WatchlistManager>,
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut Settings)) -> Harness {
    let mut settings = Settings::default();
    settings.database.url = "sqlite::memory:".to_string();
    // Fast pacing so scenarios exercise ordering, not wall-clock budgets.
    settings.rate_limit.per_endpoint_min_delay_ms = 1;
    settings.rate_limit.requests_per_minute = 60_000;
    settings.retry.base_delay_ms = 1;
    settings.retry.jitter = 0.0;
    settings.collectors.timeframes = vec![Timeframe::H1];
    tweak(&mut settings);

    let storage = Arc::new(Storage::connect(&settings).await.expect("storage"));
    let mock = Arc::new(MockClient::empty());
    let limiter = Arc::new(ApiRateLimiter::new(&settings.rate_limit));
    let breaker = Arc::new(CircuitBreaker::new(&settings.circuit_breaker));
    let api = Arc::new(ResilientApi::new(
        mock.clone(),
        limiter,
        breaker,
        RetryPolicy::from_settings(&settings.retry),
    ));
    let error_handler = Arc::new(ErrorHandler::new(storage.clone()));
    let watchlist = Arc::new(WatchlistManager::new(
        settings.watchlist.clone(),
        storage.clone(),
    ));

    Harness {
        settings: Arc::new(settings),
        storage,
        mock,
        api,
        error_handler,
        watchlist,
    }
}

impl Harness {
    /// Run one pass through the wrapped execution path, the way the
    /// scheduler does.
    pub async fn run(&self, collector: &dyn Collector) -> CollectionResult {
        run_collector(
            collector,
            &self.storage,
            &self.error_handler,
            Duration::from_secs(self.settings.collectors.run_timeout_secs),
            self.settings.health.validation_reject_ratio,
            &CancellationToken::new(),
        )
        .await
    }

    /// Put a pool on the active watchlist with a minimal pool row behind it.
    pub async fn watch(&self, pool_id: &str, address: &str) {
        self.storage
            .ensure_minimal_pool(pool_id, address)
            .await
            .expect("minimal pool");
        let now = Utc::now();
        self.storage
            .add_watchlist_entry(&WatchlistEntry {
                pool_id: pool_id.to_string(),
                token_symbol: None,
                token_name: None,
                network_address: Some(address.to_string()),
                is_active: true,
                created_at: now,
                updated_at: now,
                metadata: serde_json::json!({}),
            })
            .await
            .expect("watchlist entry");
    }
}

pub fn dec(v: f64) -> Decimal {
    Decimal::from_f64(v).expect("finite decimal")
}

pub fn candle(ts: i64, price: f64, volume: f64) -> RawCandle {
    RawCandle {
        timestamp: ts,
        open: dec(price),
        high: dec(price * 1.05),
        low: dec(price * 0.95),
        close: dec(price),
        volume_usd: dec(volume),
    }
}

pub fn api_pool(id: &str, address: &str, name: &str, dex: &str, reserve: f64) -> ApiPool {
    ApiPool {
        id: id.to_string(),
        address: address.to_string(),
        name: Some(name.to_string()),
        dex_id: Some(dex.to_string()),
        base_token_id: Some(format!("solana_{address}base")),
        quote_token_id: Some("solana_So11111111111111111111111111111111111111112".to_string()),
        base_token_price_usd: Some(dec(1.0)),
        reserve_usd: Some(dec(reserve)),
        volume_h24_usd: Some(dec(10_000.0)),
        price_change_h24_pct: None,
        buys_h24: Some(25),
        sells_h24: Some(20),
        pool_created_at: Some(Utc::now() - chrono::Duration::days(30)),
    }
}

/// Latest closed hourly grid point.
pub fn aligned_now() -> i64 {
    Timeframe::H1.align(Utc::now().timestamp())
}

pub fn to_utc(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).expect("valid timestamp")
}
