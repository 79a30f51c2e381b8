//! Fixture-backed transport.
//!
//! Serves the same capability set as the live client from on-disk CSV
//! fixtures keyed by method name (`dexes.csv`, `top_pools.csv`,
//! `ohlcv.csv`, ...). Missing files mean empty responses, not errors.
//!
//! Tests can also prime data programmatically and script per-endpoint
//! failure sequences, which the resilience stack consumes exactly as it
//! would live transport failures.

use crate::api::models::{ApiDex, ApiPool, ApiToken, ApiTrade, OhlcvSeries, RawCandle};
use crate::api::{Endpoint, OhlcvRequest, PoolDataApi};
use crate::error::{HarvestError, Result};
use crate::models::{Timeframe, TradeSide};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::debug;

// === Fixture rows ===

#[derive(Debug, Deserialize)]
struct DexRow {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PoolRow {
    /// Which top-pools target serves this row; empty rows appear for every
    /// target. Ignored by the multi-pool and by-address lookups.
    #[serde(default)]
    dex_target: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    id: String,
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    dex_id: Option<String>,
    #[serde(default)]
    base_token_id: Option<String>,
    #[serde(default)]
    quote_token_id: Option<String>,
    #[serde(default)]
    base_token_price_usd: Option<Decimal>,
    #[serde(default)]
    reserve_usd: Option<Decimal>,
    #[serde(default)]
    volume_h24_usd: Option<Decimal>,
    #[serde(default)]
    price_change_h24_pct: Option<Decimal>,
    #[serde(default)]
    buys_h24: Option<i64>,
    #[serde(default)]
    sells_h24: Option<i64>,
    #[serde(default)]
    pool_created_at: Option<DateTime<Utc>>,
}

impl PoolRow {
    fn to_api_pool(&self) -> ApiPool {
        ApiPool {
            id: self.id.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
            dex_id: self.dex_id.clone(),
            base_token_id: self.base_token_id.clone(),
            quote_token_id: self.quote_token_id.clone(),
            base_token_price_usd: self.base_token_price_usd,
            reserve_usd: self.reserve_usd,
            volume_h24_usd: self.volume_h24_usd,
            price_change_h24_pct: self.price_change_h24_pct,
            buys_h24: self.buys_h24,
            sells_h24: self.sells_h24,
            pool_created_at: self.pool_created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OhlcvRow {
    pool_address: String,
    timeframe: Timeframe,
    timestamp: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume_usd: Decimal,
}

#[derive(Debug, Deserialize)]
struct TradeRow {
    pool_address: String,
    id: String,
    block_number: i64,
    tx_hash: String,
    from_token_amount: Decimal,
    to_token_amount: Decimal,
    price_usd: Decimal,
    volume_usd: Decimal,
    side: TradeSide,
    block_timestamp_unix: i64,
}

#[derive(Debug, Deserialize)]
struct TokenRow {
    id: String,
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    decimals: Option<i32>,
    #[serde(default)]
    price_usd: Option<Decimal>,
}

#[derive(Debug, Default)]
struct MockData {
    dexes: Vec<ApiDex>,
    /// Top-pools responses per DEX target.
    top_by_dex: HashMap<String, Vec<ApiPool>>,
    /// Union store backing multi-pool and by-address lookups.
    pools: Vec<ApiPool>,
    ohlcv: Vec<(String, Timeframe, RawCandle)>,
    trades: Vec<(String, ApiTrade)>,
    tokens: Vec<ApiToken>,
    new_pools: Vec<(u32, ApiPool)>,
}

/// Fixture-backed [`PoolDataApi`] implementation.
pub struct MockClient {
    data: RwLock<MockData>,
    scripted: DashMap<Endpoint, Mutex<VecDeque<HarvestError>>>,
    calls: DashMap<Endpoint, AtomicU64>,
}

impl MockClient {
    pub fn empty() -> Self {
        Self {
            data: RwLock::new(MockData::default()),
            scripted: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    /// Load every fixture file found under `dir`. Files that are absent
    /// leave the corresponding method serving empty responses.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let client = Self::empty();
        {
            let mut data = client.data.write().expect("mock data lock poisoned");

            for row in read_rows::<DexRow>(&dir.join("dexes.csv"))? {
                data.dexes.push(ApiDex {
                    id: row.id,
                    name: row.name,
                });
            }
            for row in read_rows::<PoolRow>(&dir.join("top_pools.csv"))? {
                let pool = row.to_api_pool();
                if let Some(target) = &row.dex_target {
                    data.top_by_dex
                        .entry(target.clone())
                        .or_default()
                        .push(pool.clone());
                }
                data.pools.push(pool);
            }
            for row in read_rows::<PoolRow>(&dir.join("pools.csv"))? {
                data.pools.push(row.to_api_pool());
            }
            for row in read_rows::<PoolRow>(&dir.join("new_pools.csv"))? {
                let page = row.page.unwrap_or(1);
                let pool = row.to_api_pool();
                data.pools.push(pool.clone());
                data.new_pools.push((page, pool));
            }
            for row in read_rows::<OhlcvRow>(&dir.join("ohlcv.csv"))? {
                data.ohlcv.push((
                    row.pool_address,
                    row.timeframe,
                    RawCandle {
                        timestamp: row.timestamp,
                        open: row.open,
                        high: row.high,
                        low: row.low,
                        close: row.close,
                        volume_usd: row.volume_usd,
                    },
                ));
            }
            for row in read_rows::<TradeRow>(&dir.join("trades.csv"))? {
                let block_timestamp = Utc
                    .timestamp_opt(row.block_timestamp_unix, 0)
                    .single()
                    .ok_or_else(|| {
                        HarvestError::Parsing(format!(
                            "trades.csv: bad timestamp {}",
                            row.block_timestamp_unix
                        ))
                    })?;
                data.trades.push((
                    row.pool_address,
                    ApiTrade {
                        id: row.id,
                        block_number: row.block_number,
                        tx_hash: row.tx_hash,
                        from_token_amount: row.from_token_amount,
                        to_token_amount: row.to_token_amount,
                        price_usd: row.price_usd,
                        volume_usd: row.volume_usd,
                        side: row.side,
                        block_timestamp,
                    },
                ));
            }
            for row in read_rows::<TokenRow>(&dir.join("token_info.csv"))? {
                data.tokens.push(ApiToken {
                    id: row.id,
                    address: row.address,
                    name: row.name,
                    symbol: row.symbol,
                    decimals: row.decimals,
                    price_usd: row.price_usd,
                });
            }
        }
        Ok(client)
    }

    // === Programmatic priming (tests) ===

    pub fn add_dexes(&self, dexes: Vec<ApiDex>) {
        self.data.write().unwrap().dexes.extend(dexes);
    }

    pub fn add_top_pools(&self, dex: &str, pools: Vec<ApiPool>) {
        let mut data = self.data.write().unwrap();
        data.pools.extend(pools.iter().cloned());
        data.top_by_dex
            .entry(dex.to_string())
            .or_default()
            .extend(pools);
    }

    pub fn add_pools(&self, pools: Vec<ApiPool>) {
        self.data.write().unwrap().pools.extend(pools);
    }

    pub fn add_ohlcv(&self, pool_address: &str, timeframe: Timeframe, candles: Vec<RawCandle>) {
        let mut data = self.data.write().unwrap();
        for candle in candles {
            data.ohlcv
                .push((pool_address.to_string(), timeframe, candle));
        }
    }

    pub fn add_trades(&self, pool_address: &str, trades: Vec<ApiTrade>) {
        let mut data = self.data.write().unwrap();
        for trade in trades {
            data.trades.push((pool_address.to_string(), trade));
        }
    }

    pub fn add_tokens(&self, tokens: Vec<ApiToken>) {
        self.data.write().unwrap().tokens.extend(tokens);
    }

    pub fn add_new_pools(&self, page: u32, pools: Vec<ApiPool>) {
        let mut data = self.data.write().unwrap();
        data.pools.extend(pools.iter().cloned());
        for pool in pools {
            data.new_pools.push((page, pool));
        }
    }

    /// Queue a failure the next call to `endpoint` returns instead of data.
    pub fn script_failure(&self, endpoint: Endpoint, error: HarvestError) {
        self.scripted
            .entry(endpoint)
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .unwrap()
            .push_back(error);
    }

    /// Outbound calls observed for one endpoint (scripted failures count;
    /// they model requests the upstream rejected).
    pub fn call_count(&self, endpoint: Endpoint) -> u64 {
        self.calls
            .get(&endpoint)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn record_call(&self, endpoint: Endpoint) -> Result<()> {
        self.calls
            .entry(endpoint)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        if let Some(queue) = self.scripted.get(&endpoint) {
            if let Some(err) = queue.lock().unwrap().pop_front() {
                debug!(
                    endpoint = endpoint.as_str(),
                    error_type = err.kind(),
                    "serving scripted failure"
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| HarvestError::Configuration(format!("fixture {}: {e}", path.display())))?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: T = record
            .map_err(|e| HarvestError::Parsing(format!("fixture {}: {e}", path.display())))?;
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl PoolDataApi for MockClient {
    async fn list_dexes(&self, _network: &str) -> Result<Vec<ApiDex>> {
        self.record_call(Endpoint::DexList)?;
        Ok(self.data.read().unwrap().dexes.clone())
    }

    async fn top_pools(&self, _network: &str, dex: Option<&str>, page: u32) -> Result<Vec<ApiPool>> {
        self.record_call(Endpoint::TopPools)?;
        if page > 1 {
            return Ok(Vec::new());
        }
        let data = self.data.read().unwrap();
        Ok(match dex {
            Some(dex) => data.top_by_dex.get(dex).cloned().unwrap_or_default(),
            None => data.pools.clone(),
        })
    }

    async fn pools_by_ids(&self, _network: &str, pool_ids: &[String]) -> Result<Vec<ApiPool>> {
        self.record_call(Endpoint::MultiPools)?;
        let data = self.data.read().unwrap();
        let mut seen = std::collections::HashSet::new();
        Ok(data
            .pools
            .iter()
            .filter(|p| pool_ids.iter().any(|id| *id == p.id || *id == p.address))
            .filter(|p| seen.insert(p.id.clone()))
            .cloned()
            .collect())
    }

    async fn pool_by_address(&self, _network: &str, address: &str) -> Result<ApiPool> {
        self.record_call(Endpoint::PoolByAddress)?;
        let data = self.data.read().unwrap();
        data.pools
            .iter()
            .find(|p| p.address == address || p.id == address)
            .cloned()
            .ok_or_else(|| HarvestError::Unknown(format!("no fixture pool for {address}")))
    }

    async fn ohlcv(&self, request: &OhlcvRequest) -> Result<OhlcvSeries> {
        self.record_call(Endpoint::Ohlcv)?;
        let data = self.data.read().unwrap();
        let mut candles: Vec<RawCandle> = data
            .ohlcv
            .iter()
            .filter(|(address, timeframe, candle)| {
                *address == request.pool_address
                    && *timeframe == request.timeframe
                    && request
                        .before_timestamp
                        .map(|before| candle.timestamp < before)
                        .unwrap_or(true)
            })
            .map(|(_, _, candle)| candle.clone())
            .collect();
        // Newest first, as the upstream serves them.
        candles.sort_by_key(|c| std::cmp::Reverse(c.timestamp));
        candles.truncate(request.limit as usize);
        Ok(OhlcvSeries { candles })
    }

    async fn trades(
        &self,
        _network: &str,
        pool_address: &str,
        min_volume_usd: f64,
    ) -> Result<Vec<ApiTrade>> {
        self.record_call(Endpoint::Trades)?;
        let min = Decimal::try_from(min_volume_usd).unwrap_or(Decimal::ZERO);
        let data = self.data.read().unwrap();
        let mut trades: Vec<ApiTrade> = data
            .trades
            .iter()
            .filter(|(address, trade)| *address == pool_address && trade.volume_usd >= min)
            .map(|(_, trade)| trade.clone())
            .collect();
        trades.sort_by_key(|t| std::cmp::Reverse(t.block_timestamp));
        trades.truncate(300);
        Ok(trades)
    }

    async fn token_info(&self, _network: &str, address: &str) -> Result<ApiToken> {
        self.record_call(Endpoint::TokenInfo)?;
        let data = self.data.read().unwrap();
        data.tokens
            .iter()
            .find(|t| t.address == address || t.id == address)
            .cloned()
            .ok_or_else(|| HarvestError::Unknown(format!("no fixture token for {address}")))
    }

    async fn new_pools(&self, _network: &str, page: u32) -> Result<Vec<ApiPool>> {
        self.record_call(Endpoint::NewPools)?;
        let data = self.data.read().unwrap();
        Ok(data
            .new_pools
            .iter()
            .filter(|(p, _)| *p == page)
            .map(|(_, pool)| pool.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;
    use std::io::Write;

    fn pool(id: &str, address: &str) -> ApiPool {
        ApiPool {
            id: id.into(),
            address: address.into(),
            name: None,
            dex_id: None,
            base_token_id: None,
            quote_token_id: None,
            base_token_price_usd: None,
            reserve_usd: None,
            volume_h24_usd: None,
            price_change_h24_pct: None,
            buys_h24: None,
            sells_h24: None,
            pool_created_at: None,
        }
    }

    fn candle(ts: i64) -> RawCandle {
        let one = Decimal::from_f64(1.0).unwrap();
        RawCandle {
            timestamp: ts,
            open: one,
            high: one,
            low: one,
            close: one,
            volume_usd: one,
        }
    }

    #[tokio::test]
    async fn ohlcv_respects_before_timestamp_and_limit() {
        let mock = MockClient::empty();
        mock.add_ohlcv(
            "addr1",
            Timeframe::H1,
            (1..=10).map(|i| candle(i * 3_600)).collect(),
        );

        let request = OhlcvRequest::latest("solana", "addr1", Timeframe::H1, 3).before(8 * 3_600);
        let series = mock.ohlcv(&request).await.unwrap();
        let timestamps: Vec<i64> = series.candles.iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![7 * 3_600, 6 * 3_600, 5 * 3_600]);
    }

    #[tokio::test]
    async fn scripted_failures_pop_in_order() {
        let mock = MockClient::empty();
        mock.script_failure(Endpoint::Ohlcv, HarvestError::RateLimit { retry_after: None });
        let request = OhlcvRequest::latest("solana", "addr1", Timeframe::H1, 10);
        assert!(matches!(
            mock.ohlcv(&request).await,
            Err(HarvestError::RateLimit { .. })
        ));
        assert!(mock.ohlcv(&request).await.is_ok());
        assert_eq!(mock.call_count(Endpoint::Ohlcv), 2);
    }

    #[tokio::test]
    async fn pools_by_ids_deduplicates() {
        let mock = MockClient::empty();
        mock.add_top_pools("heaven", vec![pool("solana_p1", "p1")]);
        mock.add_top_pools("pumpswap", vec![pool("solana_p1", "p1")]);
        let found = mock
            .pools_by_ids("solana", &["solana_p1".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn loads_fixture_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("dexes.csv")).unwrap();
        writeln!(f, "id,name").unwrap();
        writeln!(f, "heaven,Heaven").unwrap();
        writeln!(f, "pumpswap,PumpSwap").unwrap();
        drop(f);

        let mut f = std::fs::File::create(dir.path().join("ohlcv.csv")).unwrap();
        writeln!(
            f,
            "pool_address,timeframe,timestamp,open,high,low,close,volume_usd"
        )
        .unwrap();
        writeln!(f, "p1,1h,3600,1.0,2.0,0.5,1.5,100.0").unwrap();
        drop(f);

        let mock = MockClient::from_dir(dir.path()).unwrap();
        assert_eq!(mock.list_dexes("solana").await.unwrap().len(), 2);
        let series = mock
            .ohlcv(&OhlcvRequest::latest("solana", "p1", Timeframe::H1, 10))
            .await
            .unwrap();
        assert_eq!(series.candles.len(), 1);
    }
}
