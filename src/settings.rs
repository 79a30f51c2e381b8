//! Configuration management.
//!
//! One typed [`Settings`] struct covers every tunable in the harvester.
//! Values load from `Config.toml` (or an explicit path) with serde defaults
//! per field; unknown keys are rejected at load time. A small set of
//! environment overrides covers deployment-provided secrets.

use crate::error::HarvestError;
use crate::models::Timeframe;
use arc_swap::ArcSwap;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;

fn default_false() -> bool {
    false
}

// === Upstream API ===

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ApiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Serve responses from on-disk fixtures instead of the live API.
    #[serde(default = "default_false")]
    pub use_mock: bool,
    #[serde(default = "default_fixtures_dir")]
    pub fixtures_dir: String,
}

fn default_base_url() -> String {
    "https://api.geckoterminal.com/api/v2".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_fixtures_dir() -> String {
    "fixtures".to_string()
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            use_mock: false,
            fixtures_dir: default_fixtures_dir(),
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// === Rate limiting ===

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Minimum delay between two requests to the same endpoint.
    #[serde(default = "default_per_endpoint_min_delay_ms")]
    pub per_endpoint_min_delay_ms: u64,
    /// Rolling-window cap shared by every collector. The upstream free tier
    /// allows 30 calls per minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Monthly call budget; a soft warning fires at 80% consumption.
    #[serde(default = "default_monthly_budget")]
    pub monthly_budget: u64,
}

fn default_per_endpoint_min_delay_ms() -> u64 {
    1_000
}
fn default_requests_per_minute() -> u32 {
    30
}
fn default_monthly_budget() -> u64 {
    10_000
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            per_endpoint_min_delay_ms: default_per_endpoint_min_delay_ms(),
            requests_per_minute: default_requests_per_minute(),
            monthly_budget: default_monthly_budget(),
        }
    }
}

// === Circuit breaker ===

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> u64 {
    300
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

// === Retry/backoff ===

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    /// Fraction of the computed delay added as uniform random jitter.
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_retry_jitter() -> f64 {
    0.1
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_retry_base_delay_ms(),
            multiplier: default_retry_multiplier(),
            jitter: default_retry_jitter(),
        }
    }
}

// === Database ===

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct WriteQueueSettings {
    #[serde(default = "default_wq_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_wq_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_wq_max_batch() -> usize {
    64
}
fn default_wq_max_wait_ms() -> u64 {
    200
}

impl Default for WriteQueueSettings {
    fn default() -> Self {
        Self {
            max_batch: default_wq_max_batch(),
            max_wait_ms: default_wq_max_wait_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    /// Connection string. `sqlite:` URLs select the embedded single-file
    /// store; `postgres:` URLs select the server database.
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Busy timeout applied at open for the embedded store.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    #[serde(default = "default_lock_retry_base_delay_ms")]
    pub lock_retry_base_delay_ms: u64,
    #[serde(default)]
    pub write_queue: WriteQueueSettings,
}

fn default_database_url() -> String {
    "sqlite:harvester.db?mode=rwc".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_acquire_timeout_secs() -> u64 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_lock_retry_attempts() -> u32 {
    5
}
fn default_lock_retry_base_delay_ms() -> u64 {
    50
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            busy_timeout_ms: default_busy_timeout_ms(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_base_delay_ms: default_lock_retry_base_delay_ms(),
            write_queue: WriteQueueSettings::default(),
        }
    }
}

impl DatabaseSettings {
    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:")
    }
}

// === Collection targets ===

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct NetworkSettings {
    #[serde(default = "default_network")]
    pub network: String,
    /// DEX identifiers to monitor on the network.
    #[serde(default)]
    pub dexes: Vec<String>,
}

fn default_network() -> String {
    "solana".to_string()
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            network: default_network(),
            dexes: Vec::new(),
        }
    }
}

/// How the scheduler treats a tick that would overlap a still-running pass.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the tick; the next interval will fire normally.
    #[default]
    Skip,
    /// Remember one pending tick and run it as soon as the current pass ends.
    Queue,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CollectorSettings {
    #[serde(default = "default_dex_list_interval_secs")]
    pub dex_list_interval_secs: u64,
    #[serde(default = "default_top_pools_interval_secs")]
    pub top_pools_interval_secs: u64,
    #[serde(default = "default_watchlist_monitor_interval_secs")]
    pub watchlist_monitor_interval_secs: u64,
    #[serde(default = "default_watchlist_collector_interval_secs")]
    pub watchlist_collector_interval_secs: u64,
    #[serde(default = "default_ohlcv_interval_secs")]
    pub ohlcv_interval_secs: u64,
    #[serde(default = "default_historical_ohlcv_interval_secs")]
    pub historical_ohlcv_interval_secs: u64,
    #[serde(default = "default_trade_interval_secs")]
    pub trade_interval_secs: u64,
    #[serde(default = "default_new_pools_interval_secs")]
    pub new_pools_interval_secs: u64,

    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    /// Outer wall-clock timeout for one collection pass.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_collectors")]
    pub max_concurrent_collectors: usize,
    /// Per-collector fan-out ceiling across pools.
    #[serde(default = "default_max_concurrent_pools")]
    pub max_concurrent_pools: usize,
    /// Grace period granted to in-flight collectors at shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,
    #[serde(default = "default_ohlcv_limit")]
    pub ohlcv_limit: u32,
    /// Bounded lookback window scanned for candle gaps after each pass.
    #[serde(default = "default_gap_lookback_hours")]
    pub gap_lookback_hours: u64,
    /// Maximum candle age the upstream serves; backfill never reaches past it.
    #[serde(default = "default_backfill_horizon_days")]
    pub backfill_horizon_days: u64,
    #[serde(default = "default_min_trade_volume_usd")]
    pub min_trade_volume_usd: f64,
    #[serde(default = "default_new_pools_max_pages")]
    pub new_pools_max_pages: u32,
    /// Pool ids per multi-pool request batch.
    #[serde(default = "default_multi_pool_batch_size")]
    pub multi_pool_batch_size: usize,
}

fn default_dex_list_interval_secs() -> u64 {
    86_400
}
fn default_top_pools_interval_secs() -> u64 {
    900
}
fn default_watchlist_monitor_interval_secs() -> u64 {
    60
}
fn default_watchlist_collector_interval_secs() -> u64 {
    600
}
fn default_ohlcv_interval_secs() -> u64 {
    300
}
fn default_historical_ohlcv_interval_secs() -> u64 {
    600
}
fn default_trade_interval_secs() -> u64 {
    300
}
fn default_new_pools_interval_secs() -> u64 {
    120
}
fn default_run_timeout_secs() -> u64 {
    600
}
fn default_max_concurrent_collectors() -> usize {
    4
}
fn default_max_concurrent_pools() -> usize {
    5
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1]
}
fn default_ohlcv_limit() -> u32 {
    100
}
fn default_gap_lookback_hours() -> u64 {
    48
}
fn default_backfill_horizon_days() -> u64 {
    180
}
fn default_min_trade_volume_usd() -> f64 {
    100.0
}
fn default_new_pools_max_pages() -> u32 {
    10
}
fn default_multi_pool_batch_size() -> usize {
    30
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            dex_list_interval_secs: default_dex_list_interval_secs(),
            top_pools_interval_secs: default_top_pools_interval_secs(),
            watchlist_monitor_interval_secs: default_watchlist_monitor_interval_secs(),
            watchlist_collector_interval_secs: default_watchlist_collector_interval_secs(),
            ohlcv_interval_secs: default_ohlcv_interval_secs(),
            historical_ohlcv_interval_secs: default_historical_ohlcv_interval_secs(),
            trade_interval_secs: default_trade_interval_secs(),
            new_pools_interval_secs: default_new_pools_interval_secs(),
            overlap_policy: OverlapPolicy::default(),
            run_timeout_secs: default_run_timeout_secs(),
            max_concurrent_collectors: default_max_concurrent_collectors(),
            max_concurrent_pools: default_max_concurrent_pools(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            timeframes: default_timeframes(),
            ohlcv_limit: default_ohlcv_limit(),
            gap_lookback_hours: default_gap_lookback_hours(),
            backfill_horizon_days: default_backfill_horizon_days(),
            min_trade_volume_usd: default_min_trade_volume_usd(),
            new_pools_max_pages: default_new_pools_max_pages(),
            multi_pool_batch_size: default_multi_pool_batch_size(),
        }
    }
}

// === Watchlist ===

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct WatchlistSettings {
    /// Operator-editable CSV reconciled into the database every monitor tick.
    #[serde(default)]
    pub csv_path: Option<String>,
    /// Mirror programmatic additions back to the CSV.
    #[serde(default = "default_false")]
    pub export_csv: bool,
}

// === Signal analysis ===

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SignalWeights {
    #[serde(default = "default_weight_volume")]
    pub volume: f64,
    #[serde(default = "default_weight_liquidity")]
    pub liquidity: f64,
    #[serde(default = "default_weight_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_activity")]
    pub activity: f64,
    #[serde(default = "default_weight_volatility")]
    pub volatility: f64,
}

fn default_weight_volume() -> f64 {
    0.30
}
fn default_weight_liquidity() -> f64 {
    0.20
}
fn default_weight_momentum() -> f64 {
    0.20
}
fn default_weight_activity() -> f64 {
    0.15
}
fn default_weight_volatility() -> f64 {
    0.15
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            volume: default_weight_volume(),
            liquidity: default_weight_liquidity(),
            momentum: default_weight_momentum(),
            activity: default_weight_activity(),
            volatility: default_weight_volatility(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SignalSettings {
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    #[serde(default = "default_auto_watchlist_threshold")]
    pub auto_watchlist_threshold: f64,
    /// Volume above this multiple of baseline tags as a spike.
    #[serde(default = "default_volume_spike_ratio")]
    pub volume_spike_ratio: f64,
    /// Liquidity growth above this multiple tags as strong growth.
    #[serde(default = "default_liquidity_growth_ratio")]
    pub liquidity_growth_ratio: f64,
    #[serde(default = "default_momentum_lookback")]
    pub momentum_lookback: usize,
    /// Auto-watchlist gates.
    #[serde(default = "default_max_pool_age_hours")]
    pub max_pool_age_hours: u64,
    #[serde(default = "default_min_volume_24h_usd")]
    pub min_volume_24h_usd: f64,
    #[serde(default = "default_min_liquidity_usd")]
    pub min_liquidity_usd: f64,
    #[serde(default)]
    pub weights: SignalWeights,
}

fn default_alert_threshold() -> f64 {
    60.0
}
fn default_auto_watchlist_threshold() -> f64 {
    75.0
}
fn default_volume_spike_ratio() -> f64 {
    2.0
}
fn default_liquidity_growth_ratio() -> f64 {
    1.5
}
fn default_momentum_lookback() -> usize {
    5
}
fn default_max_pool_age_hours() -> u64 {
    24
}
fn default_min_volume_24h_usd() -> f64 {
    1_000.0
}
fn default_min_liquidity_usd() -> f64 {
    1_000.0
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            alert_threshold: default_alert_threshold(),
            auto_watchlist_threshold: default_auto_watchlist_threshold(),
            volume_spike_ratio: default_volume_spike_ratio(),
            liquidity_growth_ratio: default_liquidity_growth_ratio(),
            momentum_lookback: default_momentum_lookback(),
            max_pool_age_hours: default_max_pool_age_hours(),
            min_volume_24h_usd: default_min_volume_24h_usd(),
            min_liquidity_usd: default_min_liquidity_usd(),
            weights: SignalWeights::default(),
        }
    }
}

// === Health/alerting ===

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HealthSettings {
    /// Error-count growth without an intervening success that raises an alert.
    #[serde(default = "default_error_burst_threshold")]
    pub error_burst_threshold: i64,
    #[serde(default = "default_rate_limit_retry_threshold")]
    pub rate_limit_retry_threshold: u32,
    /// Fraction of a batch rejected by validation that raises an alert.
    #[serde(default = "default_validation_reject_ratio")]
    pub validation_reject_ratio: f64,
}

fn default_error_burst_threshold() -> i64 {
    5
}
fn default_rate_limit_retry_threshold() -> u32 {
    3
}
fn default_validation_reject_ratio() -> f64 {
    0.10
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            error_burst_threshold: default_error_burst_threshold(),
            rate_limit_retry_threshold: default_rate_limit_retry_threshold(),
            validation_reject_ratio: default_validation_reject_ratio(),
        }
    }
}

// === Logging ===

#[derive(Debug, Deserialize, Clone, Default)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[default]
    #[serde(rename = "pretty")]
    Pretty,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// === Root ===

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub targets: NetworkSettings,
    #[serde(default)]
    pub collectors: CollectorSettings,
    #[serde(default)]
    pub watchlist: WatchlistSettings,
    #[serde(default)]
    pub signals: SignalSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder().add_source(File::with_name(path)).build()?;
        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Deployment-provided secrets override file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.database.url = url;
            }
        }
        if let Ok(base) = env::var("HARVESTER_API_BASE_URL") {
            if !base.trim().is_empty() {
                self.api.base_url = base;
            }
        }
    }

    /// Reject configurations that cannot drive a correct harvester. Called
    /// once at startup; a failure here aborts the process.
    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.rate_limit.requests_per_minute == 0 {
            return Err(HarvestError::Configuration(
                "rate_limit.requests_per_minute must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(HarvestError::Configuration(
                "retry.jitter must be within [0, 1]".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(HarvestError::Configuration(
                "retry.multiplier must be >= 1".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(HarvestError::Configuration(
                "circuit_breaker.failure_threshold must be positive".into(),
            ));
        }
        if self.collectors.timeframes.is_empty() {
            return Err(HarvestError::Configuration(
                "collectors.timeframes must not be empty".into(),
            ));
        }
        if self.collectors.max_concurrent_pools == 0
            || self.collectors.max_concurrent_collectors == 0
        {
            return Err(HarvestError::Configuration(
                "collector concurrency ceilings must be positive".into(),
            ));
        }
        if self.signals.auto_watchlist_threshold < self.signals.alert_threshold {
            return Err(HarvestError::Configuration(
                "signals.auto_watchlist_threshold must be >= alert_threshold".into(),
            ));
        }
        if self.targets.network.trim().is_empty() {
            return Err(HarvestError::Configuration(
                "targets.network must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Read-mostly snapshot handle. Live references keep the snapshot they
/// started with; a reload publishes a new one atomically.
pub struct ConfigHandle {
    inner: ArcSwap<Settings>,
}

impl ConfigHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: ArcSwap::from_pointee(settings),
        }
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.inner.load_full()
    }

    pub fn publish(&self, settings: Settings) {
        self.inner.store(Arc::new(settings));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.rate_limit.requests_per_minute, 30);
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.circuit_breaker.recovery_timeout_secs, 300);
        assert_eq!(settings.signals.auto_watchlist_threshold, 75.0);
        assert!(settings.database.is_sqlite());
    }

    #[test]
    fn bad_jitter_rejected() {
        let mut settings = Settings::default();
        settings.retry.jitter = 1.5;
        assert!(matches!(
            settings.validate(),
            Err(HarvestError::Configuration(_))
        ));
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut settings = Settings::default();
        settings.signals.auto_watchlist_threshold = 50.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn snapshot_handle_publishes_atomically() {
        let handle = ConfigHandle::new(Settings::default());
        let before = handle.snapshot();
        let mut updated = Settings::default();
        updated.rate_limit.requests_per_minute = 10;
        handle.publish(updated);
        assert_eq!(before.rate_limit.requests_per_minute, 30);
        assert_eq!(handle.snapshot().rate_limit.requests_per_minute, 10);
    }
}
