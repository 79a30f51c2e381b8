//! New-pools collector: paginates the newly-listed endpoint, appends a
//! history snapshot per pool per pass, scores each pool inline, and
//! promotes high scorers onto the watchlist.

use crate::api::models::{address_from_id, ApiPool};
use crate::api::PoolDataApi;
use crate::collectors::{CollectionOutcome, Collector};
use crate::error::{HarvestError, Result};
use crate::models::{AlertLevel, NewPoolSnapshot, SystemAlert};
use crate::signal::{PoolObservation, SignalAnalyzer};
use crate::storage::Storage;
use crate::watchlist::WatchlistManager;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct NewPoolsCollector {
    api: Arc<dyn PoolDataApi>,
    storage: Arc<Storage>,
    watchlist: Arc<WatchlistManager>,
    analyzer: SignalAnalyzer,
    network: String,
    max_pages: u32,
    /// Snapshot history rows consulted per pool when scoring.
    history_limit: u32,
}

impl NewPoolsCollector {
    pub fn new(
        api: Arc<dyn PoolDataApi>,
        storage: Arc<Storage>,
        watchlist: Arc<WatchlistManager>,
        analyzer: SignalAnalyzer,
        network: &str,
        max_pages: u32,
        history_limit: u32,
    ) -> Self {
        Self {
            api,
            storage,
            watchlist,
            analyzer,
            network: network.to_string(),
            max_pages: max_pages.clamp(1, 10),
            history_limit: history_limit.max(2),
        }
    }

    async fn process_pool(&self, pool: &ApiPool) -> Result<bool> {
        self.storage
            .upsert_tokens(&pool.token_stubs(&self.network))
            .await?;
        self.storage.upsert_pools(&[pool.to_pool()]).await?;

        let history = self
            .storage
            .snapshots_for_pool(&pool.id, self.history_limit)
            .await?;
        let previous_score = history.last().and_then(|s| s.signal_score);

        let mut observations: Vec<PoolObservation> =
            history.iter().map(observation_from_snapshot).collect();
        let latest = observation_from_pool(pool);
        observations.push(latest.clone());

        let score = self.analyzer.analyze(&observations);
        let now = Utc::now();

        self.storage
            .insert_new_pool_snapshot(&NewPoolSnapshot {
                pool_id: pool.id.clone(),
                collected_at: now,
                open: None,
                high: None,
                low: None,
                close: pool.base_token_price_usd,
                price_usd: pool.base_token_price_usd,
                volume_h24_usd: pool.volume_h24_usd,
                reserve_usd: pool.reserve_usd,
                buys_h24: pool.buys_h24,
                sells_h24: pool.sells_h24,
                signal_score: Some(score.composite),
                volume_trend: Some(score.volume_trend.volume_label().to_string()),
                liquidity_trend: Some(score.liquidity_trend.liquidity_label().to_string()),
                pool_created_at: pool.pool_created_at,
            })
            .await?;

        let mut auto_added = false;
        if self.analyzer.recommends_watchlist(&score, &latest, now) {
            let (symbol, name) = symbol_and_name(pool);
            auto_added = self
                .watchlist
                .auto_add(
                    &pool.id,
                    &address_from_id(&pool.id, &self.network),
                    symbol,
                    name,
                    score.composite,
                )
                .await?;
        } else if self.analyzer.is_alert(&score) {
            // Alert only on an upward crossing so repeated passes over a
            // hot pool do not pile up rows.
            let crossed = previous_score
                .map(|prev| !self
                    .analyzer
                    .is_alert(&crate::signal::SignalScore { composite: prev, ..score.clone() }))
                .unwrap_or(true);
            if crossed {
                let alert = SystemAlert::new(
                    AlertLevel::Warning,
                    Some(&self.collection_key()),
                    format!(
                        "pool {} signal score {:.1} crossed alert threshold",
                        pool.id, score.composite
                    ),
                )
                .with_metadata(json!({
                    "pool_id": pool.id,
                    "signal_score": score.composite,
                    "volume_trend": score.volume_trend.volume_label(),
                    "liquidity_trend": score.liquidity_trend.liquidity_label(),
                }));
                self.storage.insert_alert(&alert).await?;
            }
        }

        Ok(auto_added)
    }
}

#[async_trait]
impl Collector for NewPoolsCollector {
    fn collection_key(&self) -> String {
        format!("new_pools_{}", self.network)
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectionOutcome> {
        let mut outcome = CollectionOutcome::default();
        let mut auto_added = 0u64;
        let mut pages_fetched = 0u32;
        let mut first_error: Option<HarvestError> = None;

        for page in 1..=self.max_pages {
            if cancel.is_cancelled() {
                break;
            }
            let pools = match self.api.new_pools(&self.network, page).await {
                Ok(pools) => pools,
                Err(e) => {
                    warn!(page, error = %e, "new pools page fetch failed");
                    outcome.errors.push(format!("page {page}: {e}"));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    break;
                }
            };
            pages_fetched += 1;
            if pools.is_empty() {
                debug!(page, "new pools pagination exhausted");
                break;
            }

            outcome.records_collected += pools.len() as u64;
            for pool in &pools {
                if cancel.is_cancelled() {
                    break;
                }
                match self.process_pool(pool).await {
                    Ok(added) => {
                        outcome.records_stored += 1;
                        if added {
                            auto_added += 1;
                        }
                    }
                    Err(e) => {
                        warn!(pool_id = %pool.id, error = %e, "new pool processing failed");
                        outcome.errors.push(format!("{}: {e}", pool.id));
                    }
                }
            }
        }

        if pages_fetched == 0 {
            if let Some(error) = first_error {
                return Err(error);
            }
        }

        outcome.metadata = json!({
            "network": self.network,
            "pages_fetched": pages_fetched,
            "auto_added": auto_added,
        });
        Ok(outcome)
    }
}

fn observation_from_snapshot(snapshot: &NewPoolSnapshot) -> PoolObservation {
    PoolObservation {
        price_usd: snapshot.price_usd.or(snapshot.close),
        volume_h24_usd: snapshot.volume_h24_usd,
        reserve_usd: snapshot.reserve_usd,
        buys_h24: snapshot.buys_h24,
        sells_h24: snapshot.sells_h24,
        pool_created_at: snapshot.pool_created_at,
    }
}

fn observation_from_pool(pool: &ApiPool) -> PoolObservation {
    PoolObservation {
        price_usd: pool.base_token_price_usd,
        volume_h24_usd: pool.volume_h24_usd,
        reserve_usd: pool.reserve_usd,
        buys_h24: pool.buys_h24,
        sells_h24: pool.sells_h24,
        pool_created_at: pool.pool_created_at,
    }
}

/// Derive `(symbol, name)` from a `"BASE / QUOTE"` pool name.
fn symbol_and_name(pool: &ApiPool) -> (Option<String>, Option<String>) {
    let name = pool.name.clone();
    let symbol = pool
        .name
        .as_deref()
        .and_then(|n| n.split('/').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    (symbol, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_parses_from_pair_name() {
        let mut pool = ApiPool {
            id: "solana_p1".into(),
            address: "p1".into(),
            name: Some("CBRL / SOL".into()),
            dex_id: None,
            base_token_id: None,
            quote_token_id: None,
            base_token_price_usd: None,
            reserve_usd: None,
            volume_h24_usd: None,
            price_change_h24_pct: None,
            buys_h24: None,
            sells_h24: None,
            pool_created_at: None,
        };
        let (symbol, name) = symbol_and_name(&pool);
        assert_eq!(symbol.as_deref(), Some("CBRL"));
        assert_eq!(name.as_deref(), Some("CBRL / SOL"));

        pool.name = None;
        let (symbol, name) = symbol_and_name(&pool);
        assert!(symbol.is_none());
        assert!(name.is_none());
    }
}
