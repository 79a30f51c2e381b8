//! Live HTTP transport for the upstream data API.
//!
//! Holds the single long-lived `reqwest` session the whole process shares;
//! the connection pool inside it is acquired at startup and released when
//! the client drops on shutdown. This is the only module that constructs
//! URLs.

use crate::api::models::{wire, ApiDex, ApiPool, ApiToken, ApiTrade, OhlcvSeries};
use crate::api::{Endpoint, OhlcvRequest, PoolDataApi};
use crate::error::{HarvestError, Result};
use crate::settings::ApiSettings;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub struct GeckoTerminalClient {
    client: reqwest::Client,
    base_url: String,
}

impl GeckoTerminalClient {
    pub fn new(settings: &ApiSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| HarvestError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: Endpoint, url: String) -> Result<T> {
        debug!(endpoint = endpoint.as_str(), %url, "api request");

        let response = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(HarvestError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(HarvestError::from_status(status.as_u16(), body, retry_after));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| HarvestError::Parsing(e.to_string()))
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl PoolDataApi for GeckoTerminalClient {
    async fn list_dexes(&self, network: &str) -> Result<Vec<ApiDex>> {
        let url = format!("{}/networks/{network}/dexes", self.base_url);
        let doc: wire::Document<Vec<wire::Resource<wire::DexAttributes>>> =
            self.get_json(Endpoint::DexList, url).await?;
        Ok(doc
            .data
            .into_iter()
            .map(|r| ApiDex {
                id: r.id,
                name: r.attributes.name,
            })
            .collect())
    }

    async fn top_pools(&self, network: &str, dex: Option<&str>, page: u32) -> Result<Vec<ApiPool>> {
        let url = match dex {
            Some(dex) => format!(
                "{}/networks/{network}/dexes/{dex}/pools?page={page}",
                self.base_url
            ),
            None => format!("{}/networks/{network}/pools?page={page}", self.base_url),
        };
        let doc: wire::Document<Vec<wire::Resource<wire::PoolAttributes>>> =
            self.get_json(Endpoint::TopPools, url).await?;
        Ok(doc.data.into_iter().map(ApiPool::from_wire).collect())
    }

    async fn pools_by_ids(&self, network: &str, pool_ids: &[String]) -> Result<Vec<ApiPool>> {
        if pool_ids.is_empty() {
            return Ok(Vec::new());
        }
        // The multi endpoint takes bare addresses; canonical ids carry the
        // network prefix, so strip it before joining.
        let addresses: Vec<String> = pool_ids
            .iter()
            .map(|id| super::models::address_from_id(id, network))
            .collect();
        let url = format!(
            "{}/networks/{network}/pools/multi/{}",
            self.base_url,
            addresses.join(",")
        );
        let doc: wire::Document<Vec<wire::Resource<wire::PoolAttributes>>> =
            self.get_json(Endpoint::MultiPools, url).await?;
        Ok(doc.data.into_iter().map(ApiPool::from_wire).collect())
    }

    async fn pool_by_address(&self, network: &str, address: &str) -> Result<ApiPool> {
        let url = format!("{}/networks/{network}/pools/{address}", self.base_url);
        let doc: wire::Document<wire::Resource<wire::PoolAttributes>> =
            self.get_json(Endpoint::PoolByAddress, url).await?;
        Ok(ApiPool::from_wire(doc.data))
    }

    async fn ohlcv(&self, request: &OhlcvRequest) -> Result<OhlcvSeries> {
        let (timeframe, aggregate) = request.timeframe.api_params();
        let mut url = format!(
            "{}/networks/{}/pools/{}/ohlcv/{timeframe}?aggregate={aggregate}&limit={}&currency=usd&token=base",
            self.base_url,
            request.network,
            request.pool_address,
            request.limit.min(1_000),
        );
        if request.include_empty_intervals {
            url.push_str("&include_empty_intervals=true");
        }
        if let Some(before) = request.before_timestamp {
            url.push_str(&format!("&before_timestamp={before}"));
        }
        let doc: wire::OhlcvDocument = self.get_json(Endpoint::Ohlcv, url).await?;
        OhlcvSeries::from_wire(doc.data.attributes)
    }

    async fn trades(
        &self,
        network: &str,
        pool_address: &str,
        min_volume_usd: f64,
    ) -> Result<Vec<ApiTrade>> {
        let url = format!(
            "{}/networks/{network}/pools/{pool_address}/trades?trade_volume_in_usd_greater_than={min_volume_usd}",
            self.base_url
        );
        let doc: wire::Document<Vec<wire::Resource<wire::TradeAttributes>>> =
            self.get_json(Endpoint::Trades, url).await?;
        // Malformed rows drop individually; one bad trade must not discard
        // the rest of the page.
        let mut trades = Vec::with_capacity(doc.data.len());
        for resource in doc.data {
            match ApiTrade::from_wire(resource) {
                Ok(trade) => trades.push(trade),
                Err(e) => debug!(error = %e, "dropping malformed trade row"),
            }
        }
        Ok(trades)
    }

    async fn token_info(&self, network: &str, address: &str) -> Result<ApiToken> {
        let url = format!("{}/networks/{network}/tokens/{address}/info", self.base_url);
        let doc: wire::Document<wire::Resource<wire::TokenAttributes>> =
            self.get_json(Endpoint::TokenInfo, url).await?;
        Ok(ApiToken::from_wire(doc.data))
    }

    async fn new_pools(&self, network: &str, page: u32) -> Result<Vec<ApiPool>> {
        let url = format!(
            "{}/networks/{network}/new_pools?page={}",
            self.base_url,
            page.clamp(1, 10)
        );
        let doc: wire::Document<Vec<wire::Resource<wire::PoolAttributes>>> =
            self.get_json(Endpoint::NewPools, url).await?;
        Ok(doc.data.into_iter().map(ApiPool::from_wire).collect())
    }
}
