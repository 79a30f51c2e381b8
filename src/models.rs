//! Domain entities persisted by the harvester.
//!
//! All identifiers follow the upstream API's canonical form: a pool or token
//! id is the `"{network}_{address}"` string the API reports, while `address`
//! keeps the raw case-sensitive on-chain identifier. Monetary fields are
//! arbitrary-precision [`Decimal`]s end to end.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Candle timeframe supported by the harvester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::H12,
        Timeframe::D1,
    ];

    /// Candle period in seconds; the expected grid spacing of `timestamp_unix`.
    pub fn period_secs(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::H12 => 43_200,
            Timeframe::D1 => 86_400,
        }
    }

    /// Upstream path segment + `aggregate` parameter for this timeframe.
    pub fn api_params(&self) -> (&'static str, u32) {
        match self {
            Timeframe::M1 => ("minute", 1),
            Timeframe::M5 => ("minute", 5),
            Timeframe::M15 => ("minute", 15),
            Timeframe::H1 => ("hour", 1),
            Timeframe::H4 => ("hour", 4),
            Timeframe::H12 => ("hour", 12),
            Timeframe::D1 => ("day", 1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }

    /// Truncate a unix timestamp down to this timeframe's grid.
    pub fn align(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.period_secs())
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "12h" => Ok(Timeframe::H12),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// Trade direction as reported by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side: {other}")),
        }
    }
}

/// An exchange venue on a network. Created by the DEX-list collector,
/// never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dex {
    pub id: String,
    pub name: String,
    pub network_id: String,
}

/// A token on a network, keyed by the API's canonical `network_address` id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i32>,
    pub network: String,
    pub price_usd: Option<Decimal>,
    pub last_updated: DateTime<Utc>,
}

/// A liquidity pair on a DEX.
///
/// Foreign keys may be `None` for minimal rows created by watchlist
/// additions; they are filled by the next top-pools or multi-pool fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub dex_id: Option<String>,
    pub base_token_id: Option<String>,
    pub quote_token_id: Option<String>,
    pub reserve_usd: Option<Decimal>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl Pool {
    /// Minimal row carrying only identity, used when a watchlist entry
    /// references a pool the harvester has not seen yet.
    pub fn minimal(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            name: None,
            dex_id: None,
            base_token_id: None,
            quote_token_id: None,
            reserve_usd: None,
            created_at: None,
            last_updated: Utc::now(),
        }
    }
}

/// One OHLCV candle. Unique per `(pool_id, timeframe, timestamp_unix)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvCandle {
    pub pool_id: String,
    pub timeframe: Timeframe,
    pub timestamp_unix: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume_usd: Decimal,
    pub datetime: DateTime<Utc>,
}

impl OhlcvCandle {
    pub fn new(
        pool_id: impl Into<String>,
        timeframe: Timeframe,
        timestamp_unix: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume_usd: Decimal,
    ) -> Self {
        let datetime = Utc
            .timestamp_opt(timestamp_unix, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            pool_id: pool_id.into(),
            timeframe,
            timestamp_unix,
            open,
            high,
            low,
            close,
            volume_usd,
            datetime,
        }
    }

    /// Structural validity: `low <= open,close <= high`, non-negative volume,
    /// timestamp aligned to the timeframe grid.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume_usd >= Decimal::ZERO
            && self.timestamp_unix == self.timeframe.align(self.timestamp_unix)
            && self.timestamp_unix > 0
    }
}

/// One swap, unique by the upstream trade id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub pool_id: String,
    pub block_number: i64,
    pub tx_hash: String,
    pub from_token_amount: Decimal,
    pub to_token_amount: Decimal,
    pub price_usd: Decimal,
    pub volume_usd: Decimal,
    pub side: TradeSide,
    pub block_timestamp: DateTime<Utc>,
}

/// One watchlist row. Exactly one per `pool_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub pool_id: String,
    pub token_symbol: Option<String>,
    pub token_name: Option<String>,
    pub network_address: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Records `auto_added` and `signal_score` for entries the analyzer
    /// promoted on its own.
    pub metadata: serde_json::Value,
}

impl WatchlistEntry {
    pub fn manual(pool_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pool_id: pool_id.into(),
            token_symbol: None,
            token_name: None,
            network_address: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({}),
        }
    }

    pub fn auto_added(&self) -> bool {
        self.metadata
            .get("auto_added")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Append-only metrics snapshot taken on every new-pools collection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPoolSnapshot {
    pub pool_id: String,
    pub collected_at: DateTime<Utc>,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub price_usd: Option<Decimal>,
    pub volume_h24_usd: Option<Decimal>,
    pub reserve_usd: Option<Decimal>,
    pub buys_h24: Option<i64>,
    pub sells_h24: Option<i64>,
    pub signal_score: Option<f64>,
    pub volume_trend: Option<String>,
    pub liquidity_trend: Option<String>,
    pub pool_created_at: Option<DateTime<Utc>>,
}

/// Per-collector run bookkeeping. One row per collection key; `run_count`
/// and `error_count` only ever grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorMetadata {
    pub collector_key: String,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub metadata: serde_json::Value,
}

impl CollectorMetadata {
    pub fn empty(collector_key: impl Into<String>) -> Self {
        Self {
            collector_key: collector_key.into(),
            last_run: None,
            last_success: None,
            run_count: 0,
            error_count: 0,
            last_error: None,
            metadata: serde_json::json!({}),
        }
    }
}

/// Operator-facing alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(AlertLevel::Warning),
            "error" => Ok(AlertLevel::Error),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(format!("unknown alert level: {other}")),
        }
    }
}

/// Append-only operator alert, later acknowledged/resolved out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub id: Uuid,
    pub level: AlertLevel,
    pub collector_key: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
    pub metadata: serde_json::Value,
}

impl SystemAlert {
    pub fn new(level: AlertLevel, collector_key: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            collector_key: collector_key.map(String::from),
            message: message.into(),
            timestamp: Utc::now(),
            acknowledged: false,
            resolved: false,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    #[test]
    fn timeframe_alignment() {
        assert_eq!(Timeframe::H1.align(3_700), 3_600);
        assert_eq!(Timeframe::H1.align(3_600), 3_600);
        assert_eq!(Timeframe::M5.align(301), 300);
        assert_eq!(Timeframe::D1.align(100_000), 86_400);
    }

    #[test]
    fn timeframe_round_trips_str() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn candle_validity() {
        let good = OhlcvCandle::new(
            "solana_p1",
            Timeframe::H1,
            3_600,
            dec(1.0),
            dec(2.0),
            dec(0.5),
            dec(1.5),
            dec(100.0),
        );
        assert!(good.is_valid());

        let high_below_low = OhlcvCandle {
            high: dec(0.1),
            ..good.clone()
        };
        assert!(!high_below_low.is_valid());

        let misaligned = OhlcvCandle {
            timestamp_unix: 3_601,
            ..good.clone()
        };
        assert!(!misaligned.is_valid());

        let negative_volume = OhlcvCandle {
            volume_usd: dec(-1.0),
            ..good
        };
        assert!(!negative_volume.is_valid());
    }

    #[test]
    fn watchlist_auto_added_flag() {
        let mut entry = WatchlistEntry::manual("solana_p1");
        assert!(!entry.auto_added());
        entry.metadata = serde_json::json!({"auto_added": true, "signal_score": 80.0});
        assert!(entry.auto_added());
    }
}
