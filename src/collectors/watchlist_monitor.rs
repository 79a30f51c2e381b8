//! Watchlist monitor: re-reads the operator CSV when present and
//! reconciles it into the database table. Idempotent; safe on every
//! interval.

use crate::collectors::{CollectionOutcome, Collector};
use crate::error::Result;
use crate::watchlist::WatchlistManager;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct WatchlistMonitorCollector {
    manager: Arc<WatchlistManager>,
}

impl WatchlistMonitorCollector {
    pub fn new(manager: Arc<WatchlistManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Collector for WatchlistMonitorCollector {
    fn collection_key(&self) -> String {
        "watchlist_monitor".to_string()
    }

    async fn collect(&self, _cancel: &CancellationToken) -> Result<CollectionOutcome> {
        let stats = self.manager.reconcile_csv().await?;
        Ok(CollectionOutcome {
            // Rejected rows count toward the batch total so the reject
            // ratio is measured against everything the CSV served.
            records_collected: stats.added + stats.status_changes + stats.rejected_rows,
            records_stored: stats.added,
            records_rejected: stats.rejected_rows,
            metadata: json!({
                "added": stats.added,
                "status_changes": stats.status_changes,
            }),
            ..Default::default()
        })
    }
}
