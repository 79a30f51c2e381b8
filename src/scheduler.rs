//! Interval-driven collector dispatch.
//!
//! One driver loop wakes at the earliest next-due time and dispatches due
//! collectors onto a bounded set of workers. Invariants:
//!
//! - **No-overlap**: at most one execution per collection key at any
//!   instant. A due tick that would overlap is skipped by default, or (per
//!   config) remembered as one pending tick and run when the pass ends.
//! - **Fair admission**: workers share the global rate limiter through the
//!   resilient client; the scheduler itself never holds admission.
//! - **Deterministic shutdown**: cancellation propagates to in-flight
//!   collectors, which get a bounded grace period before being abandoned
//!   and logged. The caller closes the database afterwards on every path.

use crate::collectors::{run_collector, CollectionResult, Collector};
use crate::error_handler::ErrorHandler;
use crate::health::HealthTracker;
use crate::settings::{OverlapPolicy, Settings};
use crate::storage::Storage;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Entry {
    collector: Arc<dyn Collector>,
    interval: Duration,
    next_due: Instant,
    running: bool,
    /// One remembered tick under the queue overlap policy.
    pending: bool,
}

pub struct Scheduler {
    registry: IndexMap<String, Entry>,
    storage: Arc<Storage>,
    error_handler: Arc<ErrorHandler>,
    health: Arc<HealthTracker>,
    overlap_policy: OverlapPolicy,
    run_timeout: Duration,
    max_concurrent: usize,
    shutdown_grace: Duration,
    validation_reject_ratio: f64,
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        error_handler: Arc<ErrorHandler>,
        health: Arc<HealthTracker>,
        settings: &Settings,
    ) -> Self {
        Self {
            registry: IndexMap::new(),
            storage,
            error_handler,
            health,
            overlap_policy: settings.collectors.overlap_policy,
            run_timeout: Duration::from_secs(settings.collectors.run_timeout_secs),
            max_concurrent: settings.collectors.max_concurrent_collectors.max(1),
            shutdown_grace: Duration::from_secs(settings.collectors.shutdown_grace_secs),
            validation_reject_ratio: settings.health.validation_reject_ratio,
        }
    }

    /// Register a collector at an interval. The collection key
    /// de-duplicates: re-registering a key replaces its entry.
    pub fn register(&mut self, collector: Arc<dyn Collector>, interval: Duration) {
        let key = collector.collection_key();
        debug!(collector = %key, interval_secs = interval.as_secs(), "collector registered");
        self.registry.insert(
            key,
            Entry {
                collector,
                interval,
                next_due: Instant::now(),
                running: false,
                pending: false,
            },
        );
    }

    pub fn collector_keys(&self) -> Vec<String> {
        self.registry.keys().cloned().collect()
    }

    /// Drive registered collectors until `cancel` fires, then wind down
    /// within the grace period.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(collectors = self.registry.len(), "scheduler starting");
        let mut workers: JoinSet<CollectionResult> = JoinSet::new();

        loop {
            let next_due = self
                .registry
                .values()
                .filter(|e| !e.running)
                .map(|e| e.next_due)
                .min();

            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    match finished {
                        Ok(result) => self.on_worker_done(result, &mut workers, &cancel).await,
                        Err(e) => warn!(error = %e, "collector worker panicked"),
                    }
                }

                _ = sleep_until_option(next_due), if next_due.is_some() => {
                    self.dispatch_due(&mut workers, &cancel);
                }
            }
        }

        info!(
            in_flight = workers.len(),
            grace_secs = self.shutdown_grace.as_secs(),
            "scheduler stopping"
        );

        // Cooperative wind-down: in-flight collectors already observe the
        // cancelled token; give them the grace period to finish.
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(finished) = workers.join_next().await {
                if let Ok(result) = finished {
                    self.health.on_result(&result).await;
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = workers.len(),
                "grace period elapsed, abandoning in-flight collectors"
            );
            workers.abort_all();
        }
        info!("scheduler stopped");
    }

    fn dispatch_due(&mut self, workers: &mut JoinSet<CollectionResult>, cancel: &CancellationToken) {
        let now = Instant::now();
        let due_keys: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, e)| e.next_due <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in due_keys {
            let at_capacity = workers.len() >= self.max_concurrent;
            let policy = self.overlap_policy;
            let Some(entry) = self.registry.get_mut(&key) else {
                continue;
            };
            // Every handled tick reschedules the next one.
            entry.next_due = now + entry.interval;

            if entry.running {
                match policy {
                    OverlapPolicy::Skip => {
                        debug!(collector = %key, "pass still running, skipping tick")
                    }
                    OverlapPolicy::Queue => {
                        debug!(collector = %key, "pass still running, queueing tick");
                        entry.pending = true;
                    }
                }
                continue;
            }

            if at_capacity {
                // Capacity pressure defers the tick by one interval.
                debug!(collector = %key, "worker pool full, deferring tick");
                continue;
            }

            entry.running = true;
            let collector = entry.collector.clone();
            self.spawn_run(collector, workers, cancel);
        }
    }

    async fn on_worker_done(
        &mut self,
        result: CollectionResult,
        workers: &mut JoinSet<CollectionResult>,
        cancel: &CancellationToken,
    ) {
        self.health.on_result(&result).await;

        let key = result.collector_key.clone();
        let Some(entry) = self.registry.get_mut(&key) else {
            return;
        };
        entry.running = false;

        // A queued tick runs back-to-back once the pass ends.
        if entry.pending && workers.len() < self.max_concurrent {
            entry.pending = false;
            entry.running = true;
            let collector = entry.collector.clone();
            self.spawn_run(collector, workers, cancel);
        }
    }

    fn spawn_run(
        &self,
        collector: Arc<dyn Collector>,
        workers: &mut JoinSet<CollectionResult>,
        cancel: &CancellationToken,
    ) {
        let storage = self.storage.clone();
        let error_handler = self.error_handler.clone();
        let run_timeout = self.run_timeout;
        let reject_ratio = self.validation_reject_ratio;
        let cancel = cancel.child_token();
        workers.spawn(async move {
            run_collector(
                collector.as_ref(),
                &storage,
                &error_handler,
                run_timeout,
                reject_ratio,
                &cancel,
            )
            .await
        });
    }

}

async fn sleep_until_option(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::CollectionOutcome;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ProbeCollector {
        key: String,
        runs: Arc<AtomicUsize>,
        concurrent: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        hold: Duration,
    }

    #[async_trait]
    impl Collector for ProbeCollector {
        fn collection_key(&self) -> String {
            self.key.clone()
        }

        async fn collect(&self, _cancel: &CancellationToken) -> Result<CollectionOutcome> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(CollectionOutcome::default())
        }
    }

    async fn scheduler_harness() -> (Arc<Storage>, Arc<ErrorHandler>, Arc<HealthTracker>, Settings) {
        let mut settings = Settings::default();
        settings.database.url = "sqlite::memory:".to_string();
        settings.collectors.shutdown_grace_secs = 1;
        let storage = Arc::new(Storage::connect(&settings).await.unwrap());
        let error_handler = Arc::new(ErrorHandler::new(storage.clone()));
        let health = Arc::new(HealthTracker::new(storage.clone(), settings.health.clone()));
        (storage, error_handler, health, settings)
    }

    #[tokio::test]
    async fn no_overlap_per_collection_key() {
        let (storage, error_handler, health, settings) = scheduler_harness().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler::new(storage.clone(), error_handler, health, &settings);
        scheduler.register(
            Arc::new(ProbeCollector {
                key: "probe".into(),
                runs: runs.clone(),
                concurrent: concurrent.clone(),
                max_seen: max_seen.clone(),
                // Holds well past its interval: overlapping ticks must skip.
                hold: Duration::from_millis(80),
            }),
            Duration::from_millis(10),
        );

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = tokio::spawn(scheduler.run(cancel));
        tokio::time::sleep(Duration::from_millis(250)).await;
        stopper.cancel();
        handle.await.unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        storage.close().await;
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let (storage, error_handler, health, settings) = scheduler_harness().await;
        let max_seen = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler::new(storage.clone(), error_handler, health, &settings);
        for key in ["a", "b"] {
            scheduler.register(
                Arc::new(ProbeCollector {
                    key: key.into(),
                    runs: Arc::new(AtomicUsize::new(0)),
                    concurrent: concurrent.clone(),
                    max_seen: max_seen.clone(),
                    hold: Duration::from_millis(100),
                }),
                Duration::from_millis(10),
            );
        }

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = tokio::spawn(scheduler.run(cancel));
        tokio::time::sleep(Duration::from_millis(150)).await;
        stopper.cancel();
        handle.await.unwrap();

        assert!(max_seen.load(Ordering::SeqCst) >= 2);
        storage.close().await;
    }

    #[tokio::test]
    async fn queue_policy_preserves_no_overlap() {
        let (storage, error_handler, health, mut settings) = scheduler_harness().await;
        settings.collectors.overlap_policy = OverlapPolicy::Queue;
        let runs = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut scheduler = Scheduler::new(storage.clone(), error_handler, health, &settings);
        scheduler.register(
            Arc::new(ProbeCollector {
                key: "queued".into(),
                runs: runs.clone(),
                concurrent: concurrent.clone(),
                max_seen: max_seen.clone(),
                hold: Duration::from_millis(60),
            }),
            Duration::from_millis(20),
        );

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = tokio::spawn(scheduler.run(cancel));
        tokio::time::sleep(Duration::from_millis(250)).await;
        stopper.cancel();
        handle.await.unwrap();

        // Queued ticks run back-to-back, never concurrently.
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        storage.close().await;
    }
}
