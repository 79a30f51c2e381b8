//! Per-collector health bookkeeping and alerting policy.
//!
//! Counters and timestamps live in the collector-metadata table (the
//! wrapper keeps them current); this tracker watches the stream of
//! collection results and owns the alert policies: an error burst with no
//! intervening success, a circuit breaker opening, and rate-limit retries
//! crossing their threshold. Validation-reject alerts are raised at the
//! batch site by the collector wrapper.

use crate::collectors::CollectionResult;
use crate::models::{AlertLevel, CollectorMetadata, SystemAlert};
use crate::settings::HealthSettings;
use crate::storage::Storage;
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub struct HealthTracker {
    storage: Arc<Storage>,
    settings: HealthSettings,
    /// Consecutive failures per collector since the last success.
    error_streaks: DashMap<String, i64>,
    /// Collectors currently known to sit behind an open circuit, so the
    /// breaker alert fires once per outage.
    open_circuits: DashMap<String, ()>,
    /// Watermark of rate-limit retries already accounted for.
    rate_limit_seen: AtomicU64,
}

impl HealthTracker {
    pub fn new(storage: Arc<Storage>, settings: HealthSettings) -> Self {
        Self {
            storage,
            settings,
            error_streaks: DashMap::new(),
            open_circuits: DashMap::new(),
            rate_limit_seen: AtomicU64::new(0),
        }
    }

    /// Feed one collection result through the alert policies.
    pub async fn on_result(&self, result: &CollectionResult) {
        let key = &result.collector_key;

        if result.success {
            self.error_streaks.remove(key);
            self.open_circuits.remove(key);
            return;
        }

        let streak = {
            let mut entry = self.error_streaks.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if streak == self.settings.error_burst_threshold {
            self.raise(
                AlertLevel::Error,
                key,
                format!("{streak} consecutive failed passes without a success"),
                json!({"error_streak": streak}),
            )
            .await;
        }

        if result.error_kind == Some("circuit_open")
            && self.open_circuits.insert(key.clone(), ()).is_none()
        {
            self.raise(
                AlertLevel::Error,
                key,
                "circuit breaker opened for upstream endpoint".to_string(),
                json!({"error_kind": "circuit_open"}),
            )
            .await;
        }
    }

    /// Account for the resilient client's cumulative rate-limit retries;
    /// growth beyond the threshold since the last check raises an alert.
    pub async fn on_rate_limit_retries(&self, total: u64) {
        let seen = self.rate_limit_seen.load(Ordering::Relaxed);
        let delta = total.saturating_sub(seen);
        if delta >= self.settings.rate_limit_retry_threshold as u64 && delta > 0 {
            self.rate_limit_seen.store(total, Ordering::Relaxed);
            self.raise(
                AlertLevel::Warning,
                "rate_limiter",
                format!("{delta} rate-limit retries since last health check"),
                json!({"retries": delta}),
            )
            .await;
        }
    }

    /// Readiness/liveness view: the persisted counters for each key.
    pub async fn report(&self, keys: &[String]) -> Vec<CollectorMetadata> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match self.storage.get_collector_metadata(key).await {
                Ok(metadata) => out.push(metadata),
                Err(e) => warn!(collector = %key, error = %e, "failed to load metadata"),
            }
        }
        out
    }

    async fn raise(
        &self,
        level: AlertLevel,
        collector_key: &str,
        message: String,
        metadata: serde_json::Value,
    ) {
        warn!(collector = %collector_key, level = level.as_str(), "{message}");
        let alert =
            SystemAlert::new(level, Some(collector_key), message).with_metadata(metadata);
        if let Err(e) = self.storage.insert_alert(&alert).await {
            warn!(error = %e, "failed to persist health alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use chrono::Utc;
    use std::time::Duration;

    fn result(key: &str, success: bool, error_kind: Option<&'static str>) -> CollectionResult {
        CollectionResult {
            collector_key: key.to_string(),
            success,
            records_collected: 0,
            records_stored: 0,
            records_rejected: 0,
            errors: Vec::new(),
            error_kind,
            duration: Duration::from_millis(1),
            timestamp: Utc::now(),
            metadata: json!({}),
        }
    }

    async fn tracker() -> (Arc<Storage>, HealthTracker) {
        let mut settings = Settings::default();
        settings.database.url = "sqlite::memory:".to_string();
        let storage = Arc::new(Storage::connect(&settings).await.unwrap());
        let tracker = HealthTracker::new(storage.clone(), settings.health.clone());
        (storage, tracker)
    }

    #[tokio::test]
    async fn error_burst_raises_one_alert() {
        let (storage, tracker) = tracker().await;
        for _ in 0..7 {
            tracker.on_result(&result("probe", false, Some("timeout"))).await;
        }
        let alerts = storage.unresolved_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].collector_key.as_deref(), Some("probe"));
        storage.close().await;
    }

    #[tokio::test]
    async fn success_resets_streak() {
        let (storage, tracker) = tracker().await;
        for _ in 0..4 {
            tracker.on_result(&result("probe", false, Some("timeout"))).await;
        }
        tracker.on_result(&result("probe", true, None)).await;
        for _ in 0..4 {
            tracker.on_result(&result("probe", false, Some("timeout"))).await;
        }
        assert!(storage.unresolved_alerts().await.unwrap().is_empty());
        storage.close().await;
    }

    #[tokio::test]
    async fn breaker_open_alerts_once_per_outage() {
        let (storage, tracker) = tracker().await;
        tracker
            .on_result(&result("probe", false, Some("circuit_open")))
            .await;
        tracker
            .on_result(&result("probe", false, Some("circuit_open")))
            .await;
        let alerts = storage.unresolved_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        storage.close().await;
    }

    #[tokio::test]
    async fn rate_limit_pressure_alerts_on_growth() {
        let (storage, tracker) = tracker().await;
        tracker.on_rate_limit_retries(2).await;
        assert!(storage.unresolved_alerts().await.unwrap().is_empty());
        tracker.on_rate_limit_retries(6).await;
        assert_eq!(storage.unresolved_alerts().await.unwrap().len(), 1);
        storage.close().await;
    }
}
