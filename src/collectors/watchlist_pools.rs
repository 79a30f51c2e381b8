//! Watchlist collector: keeps pool metadata fresh for every active
//! watchlist entry. Minimal rows created by watchlist additions fill in
//! here via the multi-pool endpoint, batched to bound request counts.

use crate::api::models::address_from_id;
use crate::api::PoolDataApi;
use crate::collectors::{CollectionOutcome, Collector};
use crate::error::Result;
use crate::storage::Storage;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Token-info lookups per pass; enrichment trickles in across passes
/// instead of bursting the budget.
const ENRICH_BUDGET: usize = 10;

pub struct WatchlistPoolsCollector {
    api: Arc<dyn PoolDataApi>,
    storage: Arc<Storage>,
    network: String,
    batch_size: usize,
}

impl WatchlistPoolsCollector {
    pub fn new(
        api: Arc<dyn PoolDataApi>,
        storage: Arc<Storage>,
        network: &str,
        batch_size: usize,
    ) -> Self {
        Self {
            api,
            storage,
            network: network.to_string(),
            batch_size: batch_size.max(1),
        }
    }
}

impl WatchlistPoolsCollector {
    /// Fill in symbol/decimals for referenced tokens that are still bare
    /// stubs, a bounded number per pass.
    async fn enrich_tokens(
        &self,
        token_ids: std::collections::HashSet<String>,
        cancel: &CancellationToken,
    ) -> u64 {
        let mut enriched = 0u64;
        for token_id in token_ids {
            if enriched as usize >= ENRICH_BUDGET || cancel.is_cancelled() {
                break;
            }
            let needs_info = match self.storage.get_token(&token_id).await {
                Ok(Some(token)) => token.symbol.is_none(),
                Ok(None) => false,
                Err(e) => {
                    warn!(token_id = %token_id, error = %e, "token lookup failed");
                    false
                }
            };
            if !needs_info {
                continue;
            }
            let address = address_from_id(&token_id, &self.network);
            match self.api.token_info(&self.network, &address).await {
                Ok(info) => {
                    let token = info.to_token(&self.network);
                    if self.storage.upsert_tokens(&[token]).await.is_ok() {
                        enriched += 1;
                    }
                }
                Err(e) => {
                    debug!(token_id = %token_id, error = %e, "token info fetch failed");
                }
            }
        }
        enriched
    }
}

#[async_trait]
impl Collector for WatchlistPoolsCollector {
    fn collection_key(&self) -> String {
        "watchlist_collector".to_string()
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectionOutcome> {
        let entries = self.storage.active_watchlist().await?;
        let mut outcome = CollectionOutcome::default();

        // Every active entry must reference an existing pool row, even
        // before the upstream has served its metadata.
        for entry in &entries {
            let address = entry
                .network_address
                .clone()
                .unwrap_or_else(|| address_from_id(&entry.pool_id, &self.network));
            self.storage.ensure_minimal_pool(&entry.pool_id, &address).await?;
        }

        let ids: Vec<String> = entries.iter().map(|e| e.pool_id.clone()).collect();
        let mut token_ids: HashSet<String> = HashSet::new();
        for batch in ids.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                break;
            }
            match self.api.pools_by_ids(&self.network, batch).await {
                Ok(pools) => {
                    outcome.records_collected += pools.len() as u64;
                    let tokens: Vec<_> = pools
                        .iter()
                        .flat_map(|p| p.token_stubs(&self.network))
                        .collect();
                    token_ids.extend(tokens.iter().map(|t| t.id.clone()));
                    let rows: Vec<_> = pools.iter().map(|p| p.to_pool()).collect();
                    self.storage.upsert_tokens(&tokens).await?;
                    outcome.records_stored += self.storage.upsert_pools(&rows).await?;
                }
                Err(e) => {
                    warn!(batch_len = batch.len(), error = %e, "multi-pool refresh failed");
                    outcome.errors.push(e.to_string());
                }
            }
        }

        let enriched = self.enrich_tokens(token_ids, cancel).await;

        outcome.metadata = json!({
            "active_entries": entries.len(),
            "tokens_enriched": enriched,
        });
        Ok(outcome)
    }
}
