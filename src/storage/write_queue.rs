//! Ordered batch queue for embedded-database writes.
//!
//! The single-file store tolerates exactly one writer at a time, so
//! high-volume inserts funnel through this queue: producers submit
//! operations and await their individual results, while one flusher task
//! drains submissions in arrival order and applies each batch inside a
//! single transaction. A batch closes when it reaches `max_batch`
//! operations or `max_wait` has elapsed since its first submission.

use crate::error::{HarvestError, Result};
use crate::models::{NewPoolSnapshot, OhlcvCandle, Trade};
use crate::settings::WriteQueueSettings;
use sqlx::AnyPool;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info};

/// Result of one submitted operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    pub inserted: u64,
    /// Rows skipped on a uniqueness conflict; expected under the dedup
    /// contract.
    pub duplicates: u64,
}

impl InsertStats {
    pub fn merge(self, other: InsertStats) -> InsertStats {
        InsertStats {
            inserted: self.inserted + other.inserted,
            duplicates: self.duplicates + other.duplicates,
        }
    }
}

#[derive(Debug)]
pub(crate) enum WriteOp {
    Candles(Vec<OhlcvCandle>),
    Trades(Vec<Trade>),
    Snapshot(Box<NewPoolSnapshot>),
}

struct Submission {
    op: WriteOp,
    reply: oneshot::Sender<Result<InsertStats>>,
}

/// Producer handle. Cloneable; dropping every handle stops the flusher
/// after it drains what was already queued.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Submission>,
}

impl WriteQueue {
    pub fn start(pool: AnyPool, settings: &WriteQueueSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let max_batch = settings.max_batch.max(1);
        let max_wait = Duration::from_millis(settings.max_wait_ms);
        tokio::spawn(flusher_task(pool, rx, max_batch, max_wait));
        Self { tx }
    }

    pub(crate) async fn submit(&self, op: WriteOp) -> Result<InsertStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Submission { op, reply })
            .map_err(|_| HarvestError::DatabaseConnection("write queue stopped".into()))?;
        rx.await
            .map_err(|_| HarvestError::DatabaseConnection("write queue dropped reply".into()))?
    }
}

async fn flusher_task(
    pool: AnyPool,
    mut rx: mpsc::UnboundedReceiver<Submission>,
    max_batch: usize,
    max_wait: Duration,
) {
    info!(max_batch, max_wait_ms = max_wait.as_millis() as u64, "write queue started");
    loop {
        let first = match rx.recv().await {
            Some(submission) => submission,
            None => break,
        };

        let mut batch = vec![first];
        let deadline = Instant::now() + max_wait;
        while batch.len() < max_batch {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(submission)) => batch.push(submission),
                // Channel closed: flush what we have and exit.
                Ok(None) => {
                    flush_batch(&pool, batch).await;
                    info!("write queue draining complete");
                    return;
                }
                // Max-wait elapsed.
                Err(_) => break,
            }
        }
        flush_batch(&pool, batch).await;
    }
    info!("write queue stopped");
}

/// Apply one batch inside a single transaction and answer every submitter
/// individually. A transaction-level failure is reported to each waiter.
async fn flush_batch(pool: &AnyPool, batch: Vec<Submission>) {
    let started = std::time::Instant::now();
    let count = batch.len();

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            let err = HarvestError::from_sqlx(e);
            let message = err.to_string();
            fail_all(batch, &message);
            return;
        }
    };

    let mut results = Vec::with_capacity(batch.len());
    let mut replies = Vec::with_capacity(batch.len());
    let mut failure: Option<String> = None;

    for submission in batch {
        if failure.is_none() {
            let result = match &submission.op {
                WriteOp::Candles(candles) => super::apply_candles(&mut tx, candles).await,
                WriteOp::Trades(trades) => super::apply_trades(&mut tx, trades).await,
                WriteOp::Snapshot(snapshot) => super::apply_snapshot(&mut tx, snapshot).await,
            };
            match result {
                Ok(stats) => results.push(Ok(stats)),
                Err(e) => {
                    failure = Some(e.to_string());
                    results.push(Err(e));
                }
            }
        } else {
            results.push(Err(HarvestError::DatabaseConnection(
                "batch aborted by earlier failure".into(),
            )));
        }
        replies.push(submission.reply);
    }

    if failure.is_none() {
        if let Err(e) = tx.commit().await {
            failure = Some(HarvestError::from_sqlx(e).to_string());
        }
    }

    match failure {
        None => {
            debug!(
                operations = count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "write batch flushed"
            );
            crate::metrics::record_db_batch(count, started.elapsed());
            for (reply, result) in replies.into_iter().zip(results) {
                let _ = reply.send(result);
            }
        }
        Some(message) => {
            error!(operations = count, error = %message, "write batch failed");
            for reply in replies {
                let _ = reply.send(Err(HarvestError::DatabaseLock(message.clone())));
            }
        }
    }
}

fn fail_all(batch: Vec<Submission>, message: &str) {
    for submission in batch {
        let _ = submission
            .reply
            .send(Err(HarvestError::DatabaseConnection(message.to_string())));
    }
}
