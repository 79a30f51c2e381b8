//! DEX-list collector: refreshes the venue table for the configured
//! network. Scheduled but infrequent; venues are upserted and never
//! deleted.

use crate::api::PoolDataApi;
use crate::collectors::{CollectionOutcome, Collector};
use crate::error::Result;
use crate::models::Dex;
use crate::storage::Storage;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct DexListCollector {
    api: Arc<dyn PoolDataApi>,
    storage: Arc<Storage>,
    network: String,
}

impl DexListCollector {
    pub fn new(api: Arc<dyn PoolDataApi>, storage: Arc<Storage>, network: &str) -> Self {
        Self {
            api,
            storage,
            network: network.to_string(),
        }
    }
}

#[async_trait]
impl Collector for DexListCollector {
    fn collection_key(&self) -> String {
        format!("dex_monitoring_{}", self.network)
    }

    async fn collect(&self, _cancel: &CancellationToken) -> Result<CollectionOutcome> {
        let listed = self.api.list_dexes(&self.network).await?;
        let dexes: Vec<Dex> = listed
            .into_iter()
            .map(|d| Dex {
                id: d.id,
                name: d.name,
                network_id: self.network.clone(),
            })
            .collect();

        let stored = self.storage.upsert_dexes(&dexes).await?;
        Ok(CollectionOutcome {
            records_collected: dexes.len() as u64,
            records_stored: stored,
            metadata: json!({"network": self.network}),
            ..Default::default()
        })
    }
}
