//! # Harvester Service
//!
//! Continuous service that schedules every collector against the
//! configured network and persists results into the relational store.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin harvester
//! ```
//!
//! Configuration loads from `Config.toml` (with `DATABASE_URL` and
//! `HARVESTER_API_BASE_URL` environment overrides). Press Ctrl+C to stop
//! gracefully; in-flight collectors get the configured grace period and
//! the database close always runs.

use anyhow::{Context, Result};
use gecko_harvester::api::http::GeckoTerminalClient;
use gecko_harvester::api::mock::MockClient;
use gecko_harvester::api::resilient::ResilientApi;
use gecko_harvester::api::PoolDataApi;
use gecko_harvester::circuit_breaker::CircuitBreaker;
use gecko_harvester::collectors::dex_list::DexListCollector;
use gecko_harvester::collectors::historical_ohlcv::{BackfillQueue, HistoricalOhlcvCollector};
use gecko_harvester::collectors::new_pools::NewPoolsCollector;
use gecko_harvester::collectors::ohlcv::OhlcvCollector;
use gecko_harvester::collectors::top_pools::TopPoolsCollector;
use gecko_harvester::collectors::trades::TradeCollector;
use gecko_harvester::collectors::watchlist_monitor::WatchlistMonitorCollector;
use gecko_harvester::collectors::watchlist_pools::WatchlistPoolsCollector;
use gecko_harvester::error_handler::ErrorHandler;
use gecko_harvester::health::HealthTracker;
use gecko_harvester::rate_limiter::ApiRateLimiter;
use gecko_harvester::retry::RetryPolicy;
use gecko_harvester::scheduler::Scheduler;
use gecko_harvester::settings::{LogFormat, Settings};
use gecko_harvester::signal::SignalAnalyzer;
use gecko_harvester::storage::Storage;
use gecko_harvester::watchlist::WatchlistManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log.level.clone()));
    match settings.log.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // 1. Load and validate settings
    let settings = Settings::new().context("failed to load Config.toml")?;
    init_tracing(&settings);
    settings.validate().context("invalid configuration")?;
    let settings = Arc::new(settings);
    info!(
        network = %settings.targets.network,
        dexes = ?settings.targets.dexes,
        "settings loaded"
    );

    // 2. Connect storage
    let storage = Arc::new(
        Storage::connect(&settings)
            .await
            .context("database connection failed")?,
    );
    info!("database ready");

    // 3. Select transport and build the resilience stack around it
    let transport: Arc<dyn PoolDataApi> = if settings.api.use_mock {
        info!(fixtures = %settings.api.fixtures_dir, "using mock client");
        Arc::new(MockClient::from_dir(&settings.api.fixtures_dir)?)
    } else {
        Arc::new(GeckoTerminalClient::new(&settings.api)?)
    };
    let limiter = Arc::new(ApiRateLimiter::new(&settings.rate_limit));
    let breaker = Arc::new(CircuitBreaker::new(&settings.circuit_breaker));
    let retry = RetryPolicy::from_settings(&settings.retry);
    let api = Arc::new(ResilientApi::new(
        transport,
        limiter,
        breaker,
        retry,
    ));
    info!("api client ready");

    // 4. Shared services
    let error_handler = Arc::new(ErrorHandler::new(storage.clone()));
    let health = Arc::new(HealthTracker::new(storage.clone(), settings.health.clone()));
    let watchlist = Arc::new(WatchlistManager::new(
        settings.watchlist.clone(),
        storage.clone(),
    ));
    let analyzer = SignalAnalyzer::new(settings.signals.clone());
    let backfill = Arc::new(BackfillQueue::new());

    // 5. Collectors
    let network = settings.targets.network.as_str();
    let c = &settings.collectors;
    let api_dyn: Arc<dyn PoolDataApi> = api.clone();

    let mut scheduler = Scheduler::new(
        storage.clone(),
        error_handler.clone(),
        health.clone(),
        &settings,
    );
    scheduler.register(
        Arc::new(DexListCollector::new(api_dyn.clone(), storage.clone(), network)),
        Duration::from_secs(c.dex_list_interval_secs),
    );
    scheduler.register(
        Arc::new(TopPoolsCollector::new(
            api_dyn.clone(),
            storage.clone(),
            network,
            settings.targets.dexes.clone(),
        )),
        Duration::from_secs(c.top_pools_interval_secs),
    );
    scheduler.register(
        Arc::new(WatchlistMonitorCollector::new(watchlist.clone())),
        Duration::from_secs(c.watchlist_monitor_interval_secs),
    );
    scheduler.register(
        Arc::new(WatchlistPoolsCollector::new(
            api_dyn.clone(),
            storage.clone(),
            network,
            c.multi_pool_batch_size,
        )),
        Duration::from_secs(c.watchlist_collector_interval_secs),
    );
    scheduler.register(
        Arc::new(OhlcvCollector::new(
            api_dyn.clone(),
            storage.clone(),
            backfill.clone(),
            network,
            c.timeframes.clone(),
            c.ohlcv_limit,
            c.gap_lookback_hours,
            c.backfill_horizon_days,
            c.max_concurrent_pools,
        )),
        Duration::from_secs(c.ohlcv_interval_secs),
    );
    scheduler.register(
        Arc::new(HistoricalOhlcvCollector::new(
            api_dyn.clone(),
            storage.clone(),
            backfill.clone(),
            network,
            c.ohlcv_limit,
            c.backfill_horizon_days,
        )),
        Duration::from_secs(c.historical_ohlcv_interval_secs),
    );
    scheduler.register(
        Arc::new(TradeCollector::new(
            api_dyn.clone(),
            storage.clone(),
            network,
            c.min_trade_volume_usd,
            c.max_concurrent_pools,
        )),
        Duration::from_secs(c.trade_interval_secs),
    );
    scheduler.register(
        Arc::new(NewPoolsCollector::new(
            api_dyn.clone(),
            storage.clone(),
            watchlist.clone(),
            analyzer,
            network,
            c.new_pools_max_pages,
            settings.signals.momentum_lookback as u32 + 1,
        )),
        Duration::from_secs(c.new_pools_interval_secs),
    );
    info!(collectors = ?scheduler.collector_keys(), "collectors registered");

    // 6. Rate-limit pressure watcher
    let cancel = CancellationToken::new();
    let pressure_api = api.clone();
    let pressure_health = health.clone();
    let pressure_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = pressure_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    pressure_health
                        .on_rate_limit_retries(pressure_api.rate_limit_retries())
                        .await;
                }
            }
        }
    });

    // 7. Run until Ctrl+C
    let scheduler_cancel = cancel.clone();
    let scheduler_handle = tokio::spawn(scheduler.run(scheduler_cancel));

    info!("harvester running, press Ctrl+C to stop");
    signal::ctrl_c().await.context("failed to listen for ctrl_c")?;
    info!("shutdown signal received");

    cancel.cancel();
    scheduler_handle.await.context("scheduler task failed")?;

    // The database close runs on every exit path.
    storage.close().await;
    info!("shutdown complete");
    Ok(())
}
