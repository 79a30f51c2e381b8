//! OHLCV collector: recent candles for every active watchlist pool and
//! configured timeframe, followed by a bounded-lookback gap scan.
//!
//! Pools fan out concurrently up to the configured ceiling; timeframes for
//! one pool run sequentially inside its task. Gaps younger than the
//! backfill horizon become [`BackfillJob`]s for the historical collector.

use crate::api::models::{address_from_id, series_to_candles};
use crate::api::{OhlcvRequest, PoolDataApi};
use crate::collectors::historical_ohlcv::{BackfillJob, BackfillQueue};
use crate::collectors::{validate_candles, CollectionOutcome, Collector};
use crate::error::{HarvestError, Result};
use crate::models::Timeframe;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PoolStats {
    collected: u64,
    stored: u64,
    rejected: u64,
    duplicates: u64,
    gaps_enqueued: u64,
}

pub struct OhlcvCollector {
    api: Arc<dyn PoolDataApi>,
    storage: Arc<Storage>,
    backfill: Arc<BackfillQueue>,
    network: String,
    timeframes: Vec<Timeframe>,
    fetch_limit: u32,
    gap_lookback_hours: u64,
    horizon_days: u64,
    max_concurrent_pools: usize,
}

impl OhlcvCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn PoolDataApi>,
        storage: Arc<Storage>,
        backfill: Arc<BackfillQueue>,
        network: &str,
        timeframes: Vec<Timeframe>,
        fetch_limit: u32,
        gap_lookback_hours: u64,
        horizon_days: u64,
        max_concurrent_pools: usize,
    ) -> Self {
        Self {
            api,
            storage,
            backfill,
            network: network.to_string(),
            timeframes,
            fetch_limit,
            gap_lookback_hours,
            horizon_days,
            max_concurrent_pools: max_concurrent_pools.max(1),
        }
    }

    async fn collect_pool(
        &self,
        pool_id: &str,
        pool_address: &str,
        cancel: &CancellationToken,
    ) -> Result<PoolStats> {
        let mut stats = PoolStats::default();
        let now = Utc::now().timestamp();
        let lookback_start = now - self.gap_lookback_hours as i64 * 3_600;
        let horizon_cutoff = (Utc::now() - ChronoDuration::days(self.horizon_days as i64)).timestamp();

        for timeframe in &self.timeframes {
            if cancel.is_cancelled() {
                break;
            }

            let request =
                OhlcvRequest::latest(&self.network, pool_address, *timeframe, self.fetch_limit);
            let series = self.api.ohlcv(&request).await?;
            stats.collected += series.candles.len() as u64;

            if series.is_empty() {
                // Nothing upstream and nothing stored yet: there is no
                // observed series to have gaps in.
                let known = self
                    .storage
                    .candles_in_range(pool_id, *timeframe, lookback_start, now)
                    .await?;
                if known.is_empty() {
                    continue;
                }
            } else {
                let validated = validate_candles(series_to_candles(pool_id, *timeframe, &series));
                stats.rejected += validated.rejected;
                let inserted = self.storage.insert_candles(&validated.rows).await?;
                stats.stored += inserted.inserted;
                stats.duplicates += inserted.duplicates;
            }

            // Gap scan over the bounded lookback; the grid end stays one
            // period behind now so the still-forming candle never reads as
            // missing.
            let grid_end = timeframe.align(now);
            let gaps = self
                .storage
                .find_candle_gaps(pool_id, *timeframe, lookback_start, grid_end)
                .await?;
            for (gap_start, gap_end) in gaps {
                // Only gaps the upstream can still serve are worth a job.
                if gap_end <= horizon_cutoff {
                    continue;
                }
                if self.backfill.enqueue(BackfillJob {
                    pool_id: pool_id.to_string(),
                    pool_address: pool_address.to_string(),
                    timeframe: *timeframe,
                    gap_start: gap_start.max(horizon_cutoff),
                    gap_end,
                }) {
                    stats.gaps_enqueued += 1;
                }
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl Collector for OhlcvCollector {
    fn collection_key(&self) -> String {
        "ohlcv_collector".to_string()
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectionOutcome> {
        let entries = self.storage.active_watchlist().await?;
        if entries.is_empty() {
            debug!("ohlcv pass with empty watchlist");
            return Ok(CollectionOutcome::default());
        }

        let targets: Vec<(String, String)> = entries
            .iter()
            .map(|e| {
                let address = e
                    .network_address
                    .clone()
                    .unwrap_or_else(|| address_from_id(&e.pool_id, &self.network));
                (e.pool_id.clone(), address)
            })
            .collect();

        let results: Vec<(String, Result<PoolStats>)> = stream::iter(targets)
            .map(|(pool_id, address)| async move {
                let result = self.collect_pool(&pool_id, &address, cancel).await;
                (pool_id, result)
            })
            .buffer_unordered(self.max_concurrent_pools)
            .collect()
            .await;

        let mut outcome = CollectionOutcome::default();
        let mut gaps_enqueued = 0u64;
        let mut pools_succeeded = 0usize;
        let mut first_error: Option<HarvestError> = None;

        for (pool_id, result) in results {
            match result {
                Ok(stats) => {
                    pools_succeeded += 1;
                    outcome.records_collected += stats.collected;
                    outcome.records_stored += stats.stored;
                    outcome.records_rejected += stats.rejected;
                    outcome.duplicates += stats.duplicates;
                    gaps_enqueued += stats.gaps_enqueued;
                }
                Err(e) => {
                    warn!(pool_id = %pool_id, error = %e, "ohlcv pass failed for pool");
                    outcome.errors.push(format!("{pool_id}: {e}"));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        // Partial success across pools; only a pass where nothing worked
        // surfaces as a failure.
        if pools_succeeded == 0 {
            if let Some(error) = first_error {
                return Err(error);
            }
        }

        outcome.metadata = json!({
            "pools": entries.len(),
            "pools_succeeded": pools_succeeded,
            "timeframes": self.timeframes.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            "gaps_enqueued": gaps_enqueued,
        });
        Ok(outcome)
    }
}
