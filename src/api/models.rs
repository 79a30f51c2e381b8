//! Wire models for the upstream JSON:API payloads and the parsed values
//! handed to collectors.
//!
//! The raw `wire` types mirror the envelope exactly as served
//! (`data` / `attributes` / `relationships`, with numeric fields encoded as
//! strings); the public `Api*` types are what the client methods return
//! after parsing. Decimal strings parse into [`Decimal`] so precision never
//! narrows on the way in.

use crate::error::{HarvestError, Result};
use crate::models::{Pool, Timeframe, Token, Trade, TradeSide};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

// === Raw envelope ===

pub(crate) mod wire {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct Document<T> {
        pub data: T,
    }

    #[derive(Debug, Deserialize)]
    pub struct Resource<A> {
        pub id: String,
        #[serde(default)]
        pub relationships: Option<Relationships>,
        pub attributes: A,
    }

    #[derive(Debug, Deserialize)]
    pub struct Relationships {
        pub dex: Option<Relationship>,
        pub base_token: Option<Relationship>,
        pub quote_token: Option<Relationship>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Relationship {
        pub data: RelationshipData,
    }

    #[derive(Debug, Deserialize)]
    pub struct RelationshipData {
        pub id: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct DexAttributes {
        pub name: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct PoolAttributes {
        pub address: String,
        pub name: Option<String>,
        pub base_token_price_usd: Option<String>,
        pub reserve_in_usd: Option<String>,
        pub pool_created_at: Option<String>,
        #[serde(default)]
        pub volume_usd: Option<PeriodStrings>,
        #[serde(default)]
        pub price_change_percentage: Option<PeriodStrings>,
        #[serde(default)]
        pub transactions: Option<PeriodCounts>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct PeriodStrings {
        pub h1: Option<String>,
        pub h24: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct PeriodCounts {
        pub h1: Option<TxnCounts>,
        pub h24: Option<TxnCounts>,
    }

    #[derive(Debug, Deserialize)]
    pub struct TxnCounts {
        pub buys: Option<i64>,
        pub sells: Option<i64>,
    }

    #[derive(Debug, Deserialize)]
    pub struct TokenAttributes {
        pub address: String,
        pub name: Option<String>,
        pub symbol: Option<String>,
        pub decimals: Option<i32>,
        pub price_usd: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct TradeAttributes {
        pub block_number: i64,
        pub tx_hash: String,
        pub from_token_amount: Option<String>,
        pub to_token_amount: Option<String>,
        pub price_to_in_usd: Option<String>,
        pub volume_in_usd: Option<String>,
        pub kind: String,
        pub block_timestamp: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct OhlcvDocument {
        pub data: OhlcvData,
    }

    #[derive(Debug, Deserialize)]
    pub struct OhlcvData {
        pub attributes: OhlcvAttributes,
    }

    #[derive(Debug, Deserialize)]
    pub struct OhlcvAttributes {
        /// `[timestamp, open, high, low, close, volume]` per entry.
        pub ohlcv_list: Vec<Vec<serde_json::Number>>,
    }
}

// === Parsed values ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiDex {
    pub id: String,
    pub name: String,
}

/// One pool as served by the top-pools, multi-pool, pool-by-address and
/// new-pools endpoints, with the aggregates the signal analyzer consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiPool {
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub dex_id: Option<String>,
    pub base_token_id: Option<String>,
    pub quote_token_id: Option<String>,
    pub base_token_price_usd: Option<Decimal>,
    pub reserve_usd: Option<Decimal>,
    pub volume_h24_usd: Option<Decimal>,
    pub price_change_h24_pct: Option<Decimal>,
    pub buys_h24: Option<i64>,
    pub sells_h24: Option<i64>,
    pub pool_created_at: Option<DateTime<Utc>>,
}

impl ApiPool {
    pub fn to_pool(&self) -> Pool {
        Pool {
            id: self.id.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
            dex_id: self.dex_id.clone(),
            base_token_id: self.base_token_id.clone(),
            quote_token_id: self.quote_token_id.clone(),
            reserve_usd: self.reserve_usd,
            created_at: self.pool_created_at,
            last_updated: Utc::now(),
        }
    }

    /// Minimal token rows for the referenced base/quote ids. Symbols and
    /// decimals arrive later via the token-info endpoint.
    pub fn token_stubs(&self, network: &str) -> Vec<Token> {
        [&self.base_token_id, &self.quote_token_id]
            .into_iter()
            .flatten()
            .map(|id| Token {
                id: id.clone(),
                address: address_from_id(id, network),
                name: None,
                symbol: None,
                decimals: None,
                network: network.to_string(),
                price_usd: None,
                last_updated: Utc::now(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiToken {
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i32>,
    pub price_usd: Option<Decimal>,
}

impl ApiToken {
    pub fn to_token(&self, network: &str) -> Token {
        Token {
            id: self.id.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
            symbol: self.symbol.clone(),
            decimals: self.decimals,
            network: network.to_string(),
            price_usd: self.price_usd,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiTrade {
    pub id: String,
    pub block_number: i64,
    pub tx_hash: String,
    pub from_token_amount: Decimal,
    pub to_token_amount: Decimal,
    pub price_usd: Decimal,
    pub volume_usd: Decimal,
    pub side: TradeSide,
    pub block_timestamp: DateTime<Utc>,
}

impl ApiTrade {
    pub fn to_trade(&self, pool_id: &str) -> Trade {
        Trade {
            id: self.id.clone(),
            pool_id: pool_id.to_string(),
            block_number: self.block_number,
            tx_hash: self.tx_hash.clone(),
            from_token_amount: self.from_token_amount,
            to_token_amount: self.to_token_amount,
            price_usd: self.price_usd,
            volume_usd: self.volume_usd,
            side: self.side,
            block_timestamp: self.block_timestamp,
        }
    }
}

/// One raw OHLCV entry, newest first as the upstream serves them.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCandle {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume_usd: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OhlcvSeries {
    pub candles: Vec<RawCandle>,
}

impl OhlcvSeries {
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Oldest timestamp in the series, if any.
    pub fn earliest_timestamp(&self) -> Option<i64> {
        self.candles.iter().map(|c| c.timestamp).min()
    }
}

// === Parsing helpers ===

/// Strip the canonical `{network}_` prefix from an API id to recover the
/// on-chain address; ids without the prefix pass through unchanged.
pub fn address_from_id(id: &str, network: &str) -> String {
    id.strip_prefix(&format!("{network}_"))
        .unwrap_or(id)
        .to_string()
}

pub(crate) fn parse_decimal(value: Option<&str>) -> Option<Decimal> {
    value.and_then(|s| Decimal::from_str(s.trim()).ok())
}

pub(crate) fn parse_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    value.and_then(|s| DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)))
}

fn number_to_decimal(n: &serde_json::Number) -> Result<Decimal> {
    Decimal::from_str(&n.to_string())
        .map_err(|e| HarvestError::Parsing(format!("bad ohlcv number {n}: {e}")))
}

impl OhlcvSeries {
    pub(crate) fn from_wire(attrs: wire::OhlcvAttributes) -> Result<Self> {
        let mut candles = Vec::with_capacity(attrs.ohlcv_list.len());
        for entry in &attrs.ohlcv_list {
            if entry.len() != 6 {
                return Err(HarvestError::Parsing(format!(
                    "ohlcv entry has {} elements, expected 6",
                    entry.len()
                )));
            }
            let timestamp = entry[0].as_i64().ok_or_else(|| {
                HarvestError::Parsing(format!("ohlcv timestamp is not an integer: {}", entry[0]))
            })?;
            candles.push(RawCandle {
                timestamp,
                open: number_to_decimal(&entry[1])?,
                high: number_to_decimal(&entry[2])?,
                low: number_to_decimal(&entry[3])?,
                close: number_to_decimal(&entry[4])?,
                volume_usd: number_to_decimal(&entry[5])?,
            });
        }
        Ok(Self { candles })
    }
}

impl ApiPool {
    pub(crate) fn from_wire(resource: wire::Resource<wire::PoolAttributes>) -> Self {
        let rels = resource.relationships.as_ref();
        let attrs = &resource.attributes;
        Self {
            id: resource.id.clone(),
            address: attrs.address.clone(),
            name: attrs.name.clone(),
            dex_id: rels
                .and_then(|r| r.dex.as_ref())
                .map(|r| r.data.id.clone()),
            base_token_id: rels
                .and_then(|r| r.base_token.as_ref())
                .map(|r| r.data.id.clone()),
            quote_token_id: rels
                .and_then(|r| r.quote_token.as_ref())
                .map(|r| r.data.id.clone()),
            base_token_price_usd: parse_decimal(attrs.base_token_price_usd.as_deref()),
            reserve_usd: parse_decimal(attrs.reserve_in_usd.as_deref()),
            volume_h24_usd: attrs
                .volume_usd
                .as_ref()
                .and_then(|v| parse_decimal(v.h24.as_deref())),
            price_change_h24_pct: attrs
                .price_change_percentage
                .as_ref()
                .and_then(|v| parse_decimal(v.h24.as_deref())),
            buys_h24: attrs
                .transactions
                .as_ref()
                .and_then(|t| t.h24.as_ref())
                .and_then(|c| c.buys),
            sells_h24: attrs
                .transactions
                .as_ref()
                .and_then(|t| t.h24.as_ref())
                .and_then(|c| c.sells),
            pool_created_at: parse_datetime(attrs.pool_created_at.as_deref()),
        }
    }
}

impl ApiToken {
    pub(crate) fn from_wire(resource: wire::Resource<wire::TokenAttributes>) -> Self {
        let attrs = &resource.attributes;
        Self {
            id: resource.id.clone(),
            address: attrs.address.clone(),
            name: attrs.name.clone(),
            symbol: attrs.symbol.clone(),
            decimals: attrs.decimals,
            price_usd: parse_decimal(attrs.price_usd.as_deref()),
        }
    }
}

impl ApiTrade {
    pub(crate) fn from_wire(resource: wire::Resource<wire::TradeAttributes>) -> Result<Self> {
        let attrs = &resource.attributes;
        let side = TradeSide::from_str(&attrs.kind)
            .map_err(|e| HarvestError::Parsing(format!("trade {}: {e}", resource.id)))?;
        let block_timestamp = parse_datetime(Some(attrs.block_timestamp.as_str()))
            .or_else(|| {
                // Some payloads carry a bare unix timestamp instead.
                attrs
                    .block_timestamp
                    .parse::<i64>()
                    .ok()
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            })
            .ok_or_else(|| {
                HarvestError::Parsing(format!(
                    "trade {}: bad block_timestamp {}",
                    resource.id, attrs.block_timestamp
                ))
            })?;
        Ok(Self {
            id: resource.id.clone(),
            block_number: attrs.block_number,
            tx_hash: attrs.tx_hash.clone(),
            from_token_amount: parse_decimal(attrs.from_token_amount.as_deref())
                .unwrap_or(Decimal::ZERO),
            to_token_amount: parse_decimal(attrs.to_token_amount.as_deref())
                .unwrap_or(Decimal::ZERO),
            price_usd: parse_decimal(attrs.price_to_in_usd.as_deref()).unwrap_or(Decimal::ZERO),
            volume_usd: parse_decimal(attrs.volume_in_usd.as_deref()).unwrap_or(Decimal::ZERO),
            side,
            block_timestamp,
        })
    }
}

/// Candle conversion shared by the OHLCV collectors: raw series entries
/// become domain candles on the timeframe grid.
pub fn series_to_candles(
    pool_id: &str,
    timeframe: Timeframe,
    series: &OhlcvSeries,
) -> Vec<crate::models::OhlcvCandle> {
    series
        .candles
        .iter()
        .map(|c| {
            crate::models::OhlcvCandle::new(
                pool_id,
                timeframe,
                c.timestamp,
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume_usd,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_document_parses() {
        let raw = serde_json::json!({
            "data": [{
                "id": "solana_7bqJG2ZdMKbEkgSmfuqNVBvqEvWavgL8UEo33ZqdL3NP",
                "type": "pool",
                "attributes": {
                    "address": "7bqJG2ZdMKbEkgSmfuqNVBvqEvWavgL8UEo33ZqdL3NP",
                    "name": "CBRL / SOL",
                    "base_token_price_usd": "0.0012",
                    "reserve_in_usd": "30879.5689",
                    "pool_created_at": "2024-06-01T12:00:00Z",
                    "volume_usd": {"h1": "120.5", "h24": "2500.75"},
                    "price_change_percentage": {"h24": "14.2"},
                    "transactions": {"h24": {"buys": 42, "sells": 17}}
                },
                "relationships": {
                    "dex": {"data": {"id": "heaven", "type": "dex"}},
                    "base_token": {"data": {"id": "solana_CBRLbase111", "type": "token"}},
                    "quote_token": {"data": {"id": "solana_So11111111111111111111111111111111111111112", "type": "token"}}
                }
            }]
        });
        let doc: wire::Document<Vec<wire::Resource<wire::PoolAttributes>>> =
            serde_json::from_value(raw).unwrap();
        let pool = ApiPool::from_wire(doc.data.into_iter().next().unwrap());

        assert_eq!(pool.id, "solana_7bqJG2ZdMKbEkgSmfuqNVBvqEvWavgL8UEo33ZqdL3NP");
        assert_eq!(pool.name.as_deref(), Some("CBRL / SOL"));
        assert_eq!(pool.dex_id.as_deref(), Some("heaven"));
        assert_eq!(
            pool.reserve_usd,
            Some(Decimal::from_str("30879.5689").unwrap())
        );
        assert_eq!(pool.buys_h24, Some(42));

        let stubs = pool.token_stubs("solana");
        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[0].address, "CBRLbase111");
        assert_eq!(stubs[0].network, "solana");
    }

    #[test]
    fn ohlcv_document_parses() {
        let raw = serde_json::json!({
            "data": {
                "id": "x",
                "type": "ohlcv_request_response",
                "attributes": {
                    "ohlcv_list": [
                        [1717243200, 1.01, 1.20, 0.99, 1.15, 5000.5],
                        [1717239600, 0.95, 1.05, 0.94, 1.01, 4200.0]
                    ]
                }
            }
        });
        let doc: wire::OhlcvDocument = serde_json::from_value(raw).unwrap();
        let series = OhlcvSeries::from_wire(doc.data.attributes).unwrap();
        assert_eq!(series.candles.len(), 2);
        assert_eq!(series.earliest_timestamp(), Some(1717239600));
        assert_eq!(series.candles[0].timestamp, 1717243200);
        assert_eq!(series.candles[0].volume_usd, Decimal::from_str("5000.5").unwrap());
    }

    #[test]
    fn malformed_ohlcv_entry_is_a_parsing_error() {
        let attrs = wire::OhlcvAttributes {
            ohlcv_list: vec![vec![serde_json::Number::from(1717243200)]],
        };
        assert!(matches!(
            OhlcvSeries::from_wire(attrs),
            Err(HarvestError::Parsing(_))
        ));
    }

    #[test]
    fn trade_parses_both_timestamp_forms() {
        let make = |ts: &str| wire::Resource::<wire::TradeAttributes> {
            id: "t1".into(),
            relationships: None,
            attributes: wire::TradeAttributes {
                block_number: 100,
                tx_hash: "0xabc".into(),
                from_token_amount: Some("1.5".into()),
                to_token_amount: Some("300".into()),
                price_to_in_usd: Some("200".into()),
                volume_in_usd: Some("300".into()),
                kind: "buy".into(),
                block_timestamp: ts.into(),
            },
        };
        let rfc = ApiTrade::from_wire(make("2024-06-01T12:00:00Z")).unwrap();
        let unix = ApiTrade::from_wire(make("1717243200")).unwrap();
        assert_eq!(rfc.block_timestamp, unix.block_timestamp);
        assert_eq!(rfc.side, TradeSide::Buy);
    }

    #[test]
    fn address_prefix_stripping() {
        assert_eq!(address_from_id("solana_abc123", "solana"), "abc123");
        assert_eq!(address_from_id("abc123", "solana"), "abc123");
        // Case preserved.
        assert_eq!(address_from_id("solana_AbC", "solana"), "AbC");
    }
}
