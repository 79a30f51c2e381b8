//! Upstream data API: transports and the capability set collectors use.
//!
//! Two transports implement [`PoolDataApi`]: the live HTTP client and a
//! fixture-backed mock. Collectors never see either directly; they talk to
//! [`resilient::ResilientApi`], which layers rate limiting, the circuit
//! breaker and the retry engine over whichever transport configuration
//! selected.

pub mod http;
pub mod mock;
pub mod models;
pub mod resilient;

use crate::error::Result;
use crate::models::Timeframe;
use async_trait::async_trait;
use models::{ApiDex, ApiPool, ApiToken, ApiTrade, OhlcvSeries};

/// Upstream endpoint identity; the key for rate-limit gates and breaker
/// cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    DexList,
    TopPools,
    MultiPools,
    PoolByAddress,
    Ohlcv,
    Trades,
    TokenInfo,
    NewPools,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::DexList => "dex_list",
            Endpoint::TopPools => "top_pools",
            Endpoint::MultiPools => "multi_pools",
            Endpoint::PoolByAddress => "pool_by_address",
            Endpoint::Ohlcv => "ohlcv",
            Endpoint::Trades => "trades",
            Endpoint::TokenInfo => "token_info",
            Endpoint::NewPools => "new_pools",
        }
    }
}

/// Parameters of one OHLCV request.
#[derive(Debug, Clone)]
pub struct OhlcvRequest {
    pub network: String,
    pub pool_address: String,
    pub timeframe: Timeframe,
    /// Return candles strictly before this unix timestamp.
    pub before_timestamp: Option<i64>,
    pub limit: u32,
    pub include_empty_intervals: bool,
}

impl OhlcvRequest {
    pub fn latest(network: &str, pool_address: &str, timeframe: Timeframe, limit: u32) -> Self {
        Self {
            network: network.to_string(),
            pool_address: pool_address.to_string(),
            timeframe,
            before_timestamp: None,
            limit,
            include_empty_intervals: true,
        }
    }

    pub fn before(mut self, timestamp: i64) -> Self {
        self.before_timestamp = Some(timestamp);
        self
    }
}

/// The capability set every collector is polymorphic over. One method per
/// upstream endpoint; implementations return parsed typed values or a
/// classified error, and never leak URLs or transport details.
#[async_trait]
pub trait PoolDataApi: Send + Sync {
    async fn list_dexes(&self, network: &str) -> Result<Vec<ApiDex>>;

    /// Top-ranked pools for a network, optionally narrowed to one DEX.
    async fn top_pools(&self, network: &str, dex: Option<&str>, page: u32) -> Result<Vec<ApiPool>>;

    async fn pools_by_ids(&self, network: &str, pool_ids: &[String]) -> Result<Vec<ApiPool>>;

    async fn pool_by_address(&self, network: &str, address: &str) -> Result<ApiPool>;

    async fn ohlcv(&self, request: &OhlcvRequest) -> Result<OhlcvSeries>;

    /// Trades for a pool, filtered server-side to `volume_usd >= min_volume`.
    /// The upstream serves at most 300 rows covering the last 24 hours.
    async fn trades(&self, network: &str, pool_address: &str, min_volume_usd: f64)
        -> Result<Vec<ApiTrade>>;

    async fn token_info(&self, network: &str, address: &str) -> Result<ApiToken>;

    /// Newly listed pools, pages 1 through 10.
    async fn new_pools(&self, network: &str, page: u32) -> Result<Vec<ApiPool>>;
}
