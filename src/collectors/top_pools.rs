//! Top-pools collector: for every configured DEX target, fetches the
//! top-ranked pools and upserts pools plus referenced token stubs.
//! Fresh payloads refresh `reserve_usd` and `last_updated`; a pool shared
//! between targets simply upserts once per target, last ingest winning the
//! timestamp.

use crate::api::PoolDataApi;
use crate::collectors::{CollectionOutcome, Collector};
use crate::error::Result;
use crate::storage::Storage;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct TopPoolsCollector {
    api: Arc<dyn PoolDataApi>,
    storage: Arc<Storage>,
    network: String,
    dexes: Vec<String>,
}

impl TopPoolsCollector {
    pub fn new(
        api: Arc<dyn PoolDataApi>,
        storage: Arc<Storage>,
        network: &str,
        dexes: Vec<String>,
    ) -> Self {
        Self {
            api,
            storage,
            network: network.to_string(),
            dexes,
        }
    }
}

#[async_trait]
impl Collector for TopPoolsCollector {
    fn collection_key(&self) -> String {
        format!("top_pools_{}", self.network)
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectionOutcome> {
        let mut outcome = CollectionOutcome::default();
        let mut first_error = None;
        let mut targets_succeeded = 0usize;

        for dex in &self.dexes {
            if cancel.is_cancelled() {
                break;
            }
            match self.api.top_pools(&self.network, Some(dex), 1).await {
                Ok(pools) => {
                    targets_succeeded += 1;
                    outcome.records_collected += pools.len() as u64;

                    let tokens: Vec<_> = pools
                        .iter()
                        .flat_map(|p| p.token_stubs(&self.network))
                        .collect();
                    let rows: Vec<_> = pools.iter().map(|p| p.to_pool()).collect();

                    self.storage.upsert_tokens(&tokens).await?;
                    outcome.records_stored += self.storage.upsert_pools(&rows).await?;
                }
                // One failing target must not sink the others.
                Err(e) => {
                    warn!(dex = %dex, error = %e, "top pools fetch failed for target");
                    outcome.errors.push(format!("{dex}: {e}"));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if targets_succeeded == 0 {
            if let Some(error) = first_error {
                return Err(error);
            }
        }

        outcome.metadata = json!({
            "network": self.network,
            "targets": self.dexes,
            "targets_succeeded": targets_succeeded,
        });
        Ok(outcome)
    }
}
