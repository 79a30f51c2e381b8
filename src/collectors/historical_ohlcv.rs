//! Historical OHLCV backfill.
//!
//! The OHLCV collector enqueues [`BackfillJob`]s for gaps it finds; this
//! collector drains the queue and fills each gap with a plain pagination
//! loop over the `before_timestamp` parameter. A job stops when the
//! upstream returns an empty page (no older data), when the earliest
//! returned candle falls behind the backfill horizon, or when the gap span
//! is covered.

use crate::api::models::series_to_candles;
use crate::api::{OhlcvRequest, PoolDataApi};
use crate::collectors::{validate_candles, CollectionOutcome, Collector};
use crate::error::Result;
use crate::models::Timeframe;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One gap to fill: `[gap_start, gap_end)` on the timeframe grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillJob {
    pub pool_id: String,
    pub pool_address: String,
    pub timeframe: Timeframe,
    pub gap_start: i64,
    pub gap_end: i64,
}

/// FIFO queue of pending backfill jobs, deduplicated on
/// `(pool, timeframe, gap_start)` so repeated gap scans cannot pile up
/// duplicate work.
#[derive(Default)]
pub struct BackfillQueue {
    jobs: Mutex<VecDeque<BackfillJob>>,
    pending_keys: DashMap<(String, Timeframe, i64), ()>,
}

impl BackfillQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job unless an identical gap is already pending.
    pub fn enqueue(&self, job: BackfillJob) -> bool {
        let key = (job.pool_id.clone(), job.timeframe, job.gap_start);
        if self.pending_keys.insert(key, ()).is_some() {
            return false;
        }
        debug!(
            pool_id = %job.pool_id,
            timeframe = %job.timeframe,
            gap_start = job.gap_start,
            gap_end = job.gap_end,
            "backfill job enqueued"
        );
        self.jobs.lock().expect("backfill queue poisoned").push_back(job);
        true
    }

    pub fn pop(&self) -> Option<BackfillJob> {
        let job = self.jobs.lock().expect("backfill queue poisoned").pop_front();
        if let Some(job) = &job {
            self.pending_keys
                .remove(&(job.pool_id.clone(), job.timeframe, job.gap_start));
        }
        job
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("backfill queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct HistoricalOhlcvCollector {
    api: Arc<dyn PoolDataApi>,
    storage: Arc<Storage>,
    queue: Arc<BackfillQueue>,
    network: String,
    page_limit: u32,
    horizon_days: u64,
}

impl HistoricalOhlcvCollector {
    pub fn new(
        api: Arc<dyn PoolDataApi>,
        storage: Arc<Storage>,
        queue: Arc<BackfillQueue>,
        network: &str,
        page_limit: u32,
        horizon_days: u64,
    ) -> Self {
        Self {
            api,
            storage,
            queue,
            network: network.to_string(),
            page_limit,
            horizon_days,
        }
    }

    /// Fill one gap. Returns `(collected, stored, rejected, duplicates)`.
    async fn fill_gap(
        &self,
        job: &BackfillJob,
        horizon_cutoff: i64,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64, u64, u64)> {
        let mut collected = 0u64;
        let mut stored = 0u64;
        let mut rejected = 0u64;
        let mut duplicates = 0u64;
        // Candles strictly before gap_end; walk backwards page by page.
        let mut before = job.gap_end;
        let floor = job.gap_start.max(horizon_cutoff);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let request = OhlcvRequest::latest(
                &self.network,
                &job.pool_address,
                job.timeframe,
                self.page_limit,
            )
            .before(before);
            let series = self.api.ohlcv(&request).await?;

            // Empty page means the upstream has nothing older.
            if series.is_empty() {
                break;
            }

            let earliest = series.earliest_timestamp().unwrap_or(before);
            collected += series.candles.len() as u64;

            let validated = validate_candles(series_to_candles(&job.pool_id, job.timeframe, &series));
            rejected += validated.rejected;
            let stats = self.storage.insert_candles(&validated.rows).await?;
            stored += stats.inserted;
            duplicates += stats.duplicates;

            // Target span satisfied, or the page reached past the horizon.
            if earliest <= floor {
                break;
            }
            before = earliest;
        }

        Ok((collected, stored, rejected, duplicates))
    }
}

#[async_trait]
impl Collector for HistoricalOhlcvCollector {
    fn collection_key(&self) -> String {
        "historical_ohlcv_collector".to_string()
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectionOutcome> {
        let horizon_cutoff =
            (Utc::now() - ChronoDuration::days(self.horizon_days as i64)).timestamp();
        let mut outcome = CollectionOutcome::default();
        let mut jobs_done = 0u64;
        let mut first_error = None;
        let mut attempted = 0u64;

        while let Some(job) = self.queue.pop() {
            if cancel.is_cancelled() {
                // Put the job back so shutdown loses no work.
                self.queue.enqueue(job);
                break;
            }
            attempted += 1;
            match self.fill_gap(&job, horizon_cutoff, cancel).await {
                Ok((collected, stored, rejected, duplicates)) => {
                    jobs_done += 1;
                    outcome.records_collected += collected;
                    outcome.records_stored += stored;
                    outcome.records_rejected += rejected;
                    outcome.duplicates += duplicates;
                    info!(
                        pool_id = %job.pool_id,
                        timeframe = %job.timeframe,
                        stored,
                        "backfill job complete"
                    );
                }
                Err(e) => {
                    warn!(pool_id = %job.pool_id, error = %e, "backfill job failed");
                    outcome.errors.push(format!("{}: {e}", job.pool_id));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if jobs_done == 0 && attempted > 0 {
            if let Some(error) = first_error {
                return Err(error);
            }
        }

        crate::metrics::set_backfill_queue_depth(self.queue.len());
        outcome.metadata = json!({
            "jobs_completed": jobs_done,
            "jobs_pending": self.queue.len(),
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(start: i64) -> BackfillJob {
        BackfillJob {
            pool_id: "solana_p1".into(),
            pool_address: "p1".into(),
            timeframe: Timeframe::H1,
            gap_start: start,
            gap_end: start + 12 * 3_600,
        }
    }

    #[test]
    fn queue_deduplicates_identical_gaps() {
        let queue = BackfillQueue::new();
        assert!(queue.enqueue(job(0)));
        assert!(!queue.enqueue(job(0)));
        assert!(queue.enqueue(job(3_600)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn queue_is_fifo_and_allows_requeue_after_pop() {
        let queue = BackfillQueue::new();
        queue.enqueue(job(0));
        queue.enqueue(job(3_600));
        let first = queue.pop().unwrap();
        assert_eq!(first.gap_start, 0);
        // Once popped, the same gap may be enqueued again.
        assert!(queue.enqueue(job(0)));
    }
}
