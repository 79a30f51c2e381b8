//! Watchlist source of truth: an operator-editable CSV plus the database
//! table.
//!
//! Reconciliation is one-way: CSV changes propagate into the database on
//! every monitor tick (new rows insert, `is_active` flips apply), while
//! programmatic additions (auto-watchlist) write to the database only and
//! may optionally be mirrored back out to the CSV. Uniqueness holds on
//! `pool_id`; adding an unknown pool first creates a minimal pool row so
//! the foreign reference always resolves.

use crate::error::{HarvestError, Result};
use crate::models::WatchlistEntry;
use crate::storage::Storage;
use crate::settings::WatchlistSettings;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One CSV row; header `pool_id,symbol,name,network_address,is_active`.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct CsvRow {
    pool_id: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    network_address: Option<String>,
    is_active: String,
}

impl CsvRow {
    fn active(&self) -> Result<bool> {
        match self.is_active.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(HarvestError::Validation(format!(
                "watchlist row {}: bad is_active value {other:?}",
                self.pool_id
            ))),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: u64,
    pub status_changes: u64,
    pub rejected_rows: u64,
}

pub struct WatchlistManager {
    settings: WatchlistSettings,
    storage: Arc<Storage>,
}

impl WatchlistManager {
    pub fn new(settings: WatchlistSettings, storage: Arc<Storage>) -> Self {
        Self { settings, storage }
    }

    /// Re-read the CSV (when configured and present) and reconcile it into
    /// the database. Safe to run on every interval.
    pub async fn reconcile_csv(&self) -> Result<ReconcileStats> {
        let Some(path) = &self.settings.csv_path else {
            return Ok(ReconcileStats::default());
        };
        let path = Path::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "watchlist csv not present, skipping");
            return Ok(ReconcileStats::default());
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| HarvestError::Configuration(format!("watchlist csv: {e}")))?;

        let mut stats = ReconcileStats::default();
        for record in reader.deserialize::<CsvRow>() {
            let row = match record {
                Ok(row) => row,
                Err(e) => {
                    debug!(error = %e, "rejecting malformed watchlist row");
                    stats.rejected_rows += 1;
                    continue;
                }
            };
            let is_active = match row.active() {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "rejecting watchlist row");
                    stats.rejected_rows += 1;
                    continue;
                }
            };

            match self.storage.get_watchlist_entry(&row.pool_id).await? {
                None => {
                    let address = row
                        .network_address
                        .clone()
                        .unwrap_or_else(|| row.pool_id.clone());
                    self.storage.ensure_minimal_pool(&row.pool_id, &address).await?;
                    let now = Utc::now();
                    let inserted = self
                        .storage
                        .add_watchlist_entry(&WatchlistEntry {
                            pool_id: row.pool_id.clone(),
                            token_symbol: row.symbol.clone(),
                            token_name: row.name.clone(),
                            network_address: row.network_address.clone(),
                            is_active,
                            created_at: now,
                            updated_at: now,
                            metadata: serde_json::json!({"source": "csv"}),
                        })
                        .await?;
                    if inserted {
                        stats.added += 1;
                    }
                }
                Some(existing) if existing.is_active != is_active => {
                    self.storage
                        .set_watchlist_active(&row.pool_id, is_active)
                        .await?;
                    stats.status_changes += 1;
                }
                Some(_) => {}
            }
        }

        if stats.added > 0 || stats.status_changes > 0 || stats.rejected_rows > 0 {
            info!(
                added = stats.added,
                status_changes = stats.status_changes,
                rejected = stats.rejected_rows,
                "watchlist csv reconciled"
            );
        }
        Ok(stats)
    }

    /// Auto-add a pool the signal analyzer promoted. Returns whether a new
    /// entry was created; an existing entry is never overwritten, so
    /// re-running a collection pass cannot duplicate or demote rows.
    pub async fn auto_add(
        &self,
        pool_id: &str,
        address: &str,
        token_symbol: Option<String>,
        token_name: Option<String>,
        signal_score: f64,
    ) -> Result<bool> {
        self.storage.ensure_minimal_pool(pool_id, address).await?;
        let now = Utc::now();
        let inserted = self
            .storage
            .add_watchlist_entry(&WatchlistEntry {
                pool_id: pool_id.to_string(),
                token_symbol,
                token_name,
                network_address: Some(address.to_string()),
                is_active: true,
                created_at: now,
                updated_at: now,
                metadata: serde_json::json!({
                    "auto_added": true,
                    "signal_score": signal_score,
                }),
            })
            .await?;
        if inserted {
            info!(pool_id, signal_score, "pool auto-added to watchlist");
            if self.settings.export_csv {
                self.export_csv().await?;
            }
        }
        Ok(inserted)
    }

    /// Mirror the database watchlist back out to the CSV.
    pub async fn export_csv(&self) -> Result<()> {
        let Some(path) = &self.settings.csv_path else {
            return Ok(());
        };
        let entries = self.storage.all_watchlist().await?;
        let mut writer = csv::WriterBuilder::new()
            .from_path(path)
            .map_err(|e| HarvestError::Configuration(format!("watchlist csv: {e}")))?;
        for entry in entries {
            writer
                .serialize(CsvRow {
                    pool_id: entry.pool_id.clone(),
                    symbol: entry.token_symbol.clone(),
                    name: entry.token_name.clone(),
                    network_address: entry.network_address.clone(),
                    is_active: entry.is_active.to_string(),
                })
                .map_err(|e| HarvestError::Configuration(format!("watchlist csv: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| HarvestError::Configuration(format!("watchlist csv: {e}")))?;
        Ok(())
    }
}
