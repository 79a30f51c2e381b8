//! Trade collector: recent swaps for every active watchlist pool.
//!
//! The upstream serves at most 300 trades covering the last 24 hours; the
//! volume floor filters server-side, with client-side validation as the
//! backstop before the dedup insert.

use crate::api::models::address_from_id;
use crate::api::PoolDataApi;
use crate::collectors::{validate_trades, CollectionOutcome, Collector};
use crate::error::{HarvestError, Result};
use crate::storage::Storage;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct TradeCollector {
    api: Arc<dyn PoolDataApi>,
    storage: Arc<Storage>,
    network: String,
    min_volume_usd: f64,
    max_concurrent_pools: usize,
}

impl TradeCollector {
    pub fn new(
        api: Arc<dyn PoolDataApi>,
        storage: Arc<Storage>,
        network: &str,
        min_volume_usd: f64,
        max_concurrent_pools: usize,
    ) -> Self {
        Self {
            api,
            storage,
            network: network.to_string(),
            min_volume_usd,
            max_concurrent_pools: max_concurrent_pools.max(1),
        }
    }
}

#[async_trait]
impl Collector for TradeCollector {
    fn collection_key(&self) -> String {
        "trade_collector".to_string()
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<CollectionOutcome> {
        let entries = self.storage.active_watchlist().await?;
        if entries.is_empty() {
            debug!("trade pass with empty watchlist");
            return Ok(CollectionOutcome::default());
        }

        let min_volume = Decimal::from_f64(self.min_volume_usd).unwrap_or(Decimal::ZERO);
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

        let results: Vec<(String, Result<(u64, u64, u64, u64)>)> = stream::iter(targets)
            .map(|(pool_id, address)| {
                let min_volume = min_volume;
                async move {
                    if cancel.is_cancelled() {
                        return (pool_id, Ok((0, 0, 0, 0)));
                    }
                    let result = async {
                        let fetched = self
                            .api
                            .trades(&self.network, &address, self.min_volume_usd)
                            .await?;
                        let collected = fetched.len() as u64;
                        let trades: Vec<_> =
                            fetched.iter().map(|t| t.to_trade(&pool_id)).collect();
                        let validated = validate_trades(trades, min_volume);
                        let rejected = validated.rejected;
                        let stats = self.storage.insert_trades(&validated.rows).await?;
                        Ok((collected, stats.inserted, rejected, stats.duplicates))
                    }
                    .await;
                    (pool_id, result)
                }
            })
            .buffer_unordered(self.max_concurrent_pools)
            .collect()
            .await;

        let mut outcome = CollectionOutcome::default();
        let mut pools_succeeded = 0usize;
        let mut first_error: Option<HarvestError> = None;

        for (pool_id, result) in results {
            match result {
                Ok((collected, stored, rejected, duplicates)) => {
                    pools_succeeded += 1;
                    outcome.records_collected += collected;
                    outcome.records_stored += stored;
                    outcome.records_rejected += rejected;
                    outcome.duplicates += duplicates;
                }
                Err(e) => {
                    warn!(pool_id = %pool_id, error = %e, "trade pass failed for pool");
                    outcome.errors.push(format!("{pool_id}: {e}"));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if pools_succeeded == 0 {
            if let Some(error) = first_error {
                return Err(error);
            }
        }

        outcome.metadata = json!({
            "pools": entries.len(),
            "pools_succeeded": pools_succeeded,
            "min_volume_usd": self.min_volume_usd,
        });
        Ok(outcome)
    }
}
