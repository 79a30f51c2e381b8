//! Collector framework: the capability set every collector satisfies and
//! the error-wrapped execution path.
//!
//! A collector is a concrete value implementing [`Collector`]; the
//! scheduler holds them as trait objects without any inheritance. All call
//! sites, production dispatch and tests alike, run passes through
//! [`run_collector`], never raw `collect()`: the wrapper is the unit of
//! metadata truth (it increments `run_count`, stamps `last_run`, and
//! conditionally `last_success`/`error_count` on every invocation) and is
//! where failures meet the error handler.

pub mod dex_list;
pub mod historical_ohlcv;
pub mod new_pools;
pub mod ohlcv;
pub mod top_pools;
pub mod trades;
pub mod watchlist_monitor;
pub mod watchlist_pools;

use crate::error::{HarvestError, Result};
use crate::error_handler::{ErrorContext, ErrorHandler};
use crate::models::{AlertLevel, OhlcvCandle, SystemAlert, Trade};
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What one `collect()` pass produced.
#[derive(Debug, Default, Clone)]
pub struct CollectionOutcome {
    /// Every row the pass fetched, including rows validation later
    /// dropped; the reject ratio is measured against this total.
    pub records_collected: u64,
    pub records_stored: u64,
    /// Rows dropped by structural validation (partial success).
    pub records_rejected: u64,
    /// Rows skipped on uniqueness conflicts; expected under dedup.
    pub duplicates: u64,
    /// Non-fatal per-item failures the pass tolerated.
    pub errors: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Result record for one wrapped execution.
#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub collector_key: String,
    pub success: bool,
    pub records_collected: u64,
    pub records_stored: u64,
    pub records_rejected: u64,
    pub errors: Vec<String>,
    /// Kind of the fatal error when `success` is false.
    pub error_kind: Option<&'static str>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Capability set the scheduler is polymorphic over.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Globally unique key (e.g. `top_pools_solana`) used for metadata and
    /// scheduling de-duplication.
    fn collection_key(&self) -> String;

    /// One collection pass. Implementations check `cancel` at loop
    /// boundaries so a shutdown unwinds promptly.
    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectionOutcome>;
}

// === Structural validation (partial success) ===

/// Surviving rows plus the count dropped.
#[derive(Debug)]
pub struct Validated<T> {
    pub rows: Vec<T>,
    pub rejected: u64,
}

impl<T> Default for Validated<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: 0,
        }
    }
}

/// Drop candles violating the OHLC envelope, the non-negative volume rule,
/// or the timeframe grid.
pub fn validate_candles(candles: Vec<OhlcvCandle>) -> Validated<OhlcvCandle> {
    let mut out = Validated::default();
    for candle in candles {
        if candle.is_valid() {
            out.rows.push(candle);
        } else {
            warn!(
                pool_id = %candle.pool_id,
                timeframe = %candle.timeframe,
                timestamp = candle.timestamp_unix,
                "dropping invalid candle"
            );
            out.rejected += 1;
        }
    }
    out
}

/// Drop trades below the configured volume floor or missing identity.
pub fn validate_trades(trades: Vec<Trade>, min_volume_usd: Decimal) -> Validated<Trade> {
    let mut out = Validated::default();
    for trade in trades {
        if trade.id.is_empty() || trade.tx_hash.is_empty() {
            warn!(pool_id = %trade.pool_id, "dropping trade without identity");
            out.rejected += 1;
        } else if trade.volume_usd < min_volume_usd {
            out.rejected += 1;
        } else {
            out.rows.push(trade);
        }
    }
    out
}

/// Run one collection pass through the full error-handling stack.
///
/// Metadata updates happen on every invocation regardless of outcome; a
/// fatal error routes through the handler (which logs it and may write an
/// alert row), and a validation reject ratio above the configured fraction
/// raises its own alert.
pub async fn run_collector(
    collector: &dyn Collector,
    storage: &Arc<Storage>,
    error_handler: &ErrorHandler,
    run_timeout: Duration,
    validation_reject_ratio: f64,
    cancel: &CancellationToken,
) -> CollectionResult {
    let key = collector.collection_key();
    let started_at = Utc::now();
    let timer = Instant::now();

    if let Err(e) = storage.record_run_start(&key, started_at).await {
        warn!(collector = %key, error = %e, "failed to record run start");
    }

    let outcome = match tokio::time::timeout(run_timeout, collector.collect(cancel)).await {
        Ok(result) => result,
        Err(_) => Err(HarvestError::Timeout(format!(
            "collection pass exceeded {}s",
            run_timeout.as_secs()
        ))),
    };

    match outcome {
        Ok(outcome) => {
            if let Err(e) = storage.record_run_success(&key, Utc::now()).await {
                warn!(collector = %key, error = %e, "failed to record run success");
            }

            // records_collected already counts every fetched row,
            // including the ones validation later dropped.
            let considered = outcome.records_collected;
            if considered > 0 {
                let ratio = outcome.records_rejected as f64 / considered as f64;
                if ratio > validation_reject_ratio {
                    let alert = SystemAlert::new(
                        AlertLevel::Warning,
                        Some(&key),
                        format!(
                            "validation rejected {:.0}% of batch ({} of {})",
                            ratio * 100.0,
                            outcome.records_rejected,
                            considered
                        ),
                    )
                    .with_metadata(json!({"reject_ratio": ratio}));
                    if let Err(e) = storage.insert_alert(&alert).await {
                        warn!(collector = %key, error = %e, "failed to persist validation alert");
                    }
                }
            }

            let duration = timer.elapsed();
            info!(
                collector = %key,
                collected = outcome.records_collected,
                stored = outcome.records_stored,
                rejected = outcome.records_rejected,
                duplicates = outcome.duplicates,
                duration_ms = duration.as_millis() as u64,
                "collection pass complete"
            );
            crate::metrics::record_collection_pass(&key, true, outcome.records_stored, duration);
            CollectionResult {
                collector_key: key,
                success: true,
                records_collected: outcome.records_collected,
                records_stored: outcome.records_stored,
                records_rejected: outcome.records_rejected,
                errors: outcome.errors,
                error_kind: None,
                duration,
                timestamp: started_at,
                metadata: outcome.metadata,
            }
        }
        Err(error) => {
            let cx = ErrorContext::new(&key, "collect").collector(&key);
            let decision = error_handler.handle(&error, &cx).await;
            if let Err(e) = storage.record_run_error(&key, &decision.message).await {
                warn!(collector = %key, error = %e, "failed to record run error");
            }
            crate::metrics::record_collection_pass(&key, false, 0, timer.elapsed());
            CollectionResult {
                collector_key: key,
                success: false,
                records_collected: 0,
                records_stored: 0,
                records_rejected: 0,
                errors: vec![error.to_string()],
                error_kind: Some(error.kind()),
                duration: timer.elapsed(),
                timestamp: started_at,
                metadata: json!({"strategy": decision.strategy}),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Timeframe, TradeSide};
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    fn candle(ts: i64, low: f64, high: f64) -> OhlcvCandle {
        OhlcvCandle::new(
            "solana_p1",
            Timeframe::H1,
            ts,
            dec((low + high) / 2.0),
            dec(high),
            dec(low),
            dec((low + high) / 2.0),
            dec(10.0),
        )
    }

    #[test]
    fn candle_validation_partitions_batch() {
        let good = candle(3_600, 1.0, 2.0);
        let bad = candle(3_600 * 2, 2.0, 1.0); // high below low
        let misaligned = candle(3_601, 1.0, 2.0);
        let validated = validate_candles(vec![good.clone(), bad, misaligned]);
        assert_eq!(validated.rows, vec![good]);
        assert_eq!(validated.rejected, 2);
    }

    #[test]
    fn trade_validation_enforces_volume_floor() {
        let trade = |id: &str, volume: f64| Trade {
            id: id.into(),
            pool_id: "solana_p1".into(),
            block_number: 1,
            tx_hash: "0xabc".into(),
            from_token_amount: dec(1.0),
            to_token_amount: dec(1.0),
            price_usd: dec(1.0),
            volume_usd: dec(volume),
            side: TradeSide::Buy,
            block_timestamp: Utc::now(),
        };
        let validated = validate_trades(
            vec![trade("t1", 150.0), trade("t2", 50.0), trade("", 500.0)],
            dec(100.0),
        );
        assert_eq!(validated.rows.len(), 1);
        assert_eq!(validated.rows[0].id, "t1");
        assert_eq!(validated.rejected, 2);
    }
}
