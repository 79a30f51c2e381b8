//! Resilience stack over any [`PoolDataApi`] transport.
//!
//! Every call runs through the same pipeline: circuit-breaker gate (fail
//! fast, no limiter wait while open), rate-limiter admission, the transport
//! call, then breaker bookkeeping. The retry engine wraps the whole
//! pipeline per call so each re-attempt re-acquires admission. A `429`
//! additionally pushes the endpoint's next admission out by its
//! `Retry-After`.

use crate::api::models::{ApiDex, ApiPool, ApiToken, ApiTrade, OhlcvSeries};
use crate::api::{Endpoint, OhlcvRequest, PoolDataApi};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{HarvestError, Result};
use crate::rate_limiter::ApiRateLimiter;
use crate::retry::{run_with_retry, RetryPolicy};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct ResilientApi {
    inner: Arc<dyn PoolDataApi>,
    limiter: Arc<ApiRateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    rate_limit_retries: AtomicU64,
}

impl ResilientApi {
    pub fn new(
        inner: Arc<dyn PoolDataApi>,
        limiter: Arc<ApiRateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            limiter,
            breaker,
            retry,
            rate_limit_retries: AtomicU64::new(0),
        }
    }

    /// Cumulative retries spent on rate-limit responses; the health tracker
    /// alerts when growth crosses its threshold.
    pub fn rate_limit_retries(&self) -> u64 {
        self.rate_limit_retries.load(Ordering::Relaxed)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn call<T, Fut>(&self, endpoint: Endpoint, op: impl Fn() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let outcome = run_with_retry(&self.retry, || async {
            self.breaker.check(endpoint.as_str())?;
            self.limiter.acquire(endpoint).await;
            match op().await {
                Ok(value) => {
                    self.breaker.record_success(endpoint.as_str());
                    Ok(value)
                }
                Err(err) => {
                    if let HarvestError::RateLimit { retry_after } = &err {
                        self.limiter.penalize(endpoint, *retry_after);
                    }
                    self.breaker.record_failure(endpoint.as_str(), &err);
                    Err(err)
                }
            }
        })
        .await;

        if outcome.rate_limit_hits > 0 {
            self.rate_limit_retries
                .fetch_add(outcome.rate_limit_hits as u64, Ordering::Relaxed);
        }
        outcome.result
    }
}

#[async_trait]
impl PoolDataApi for ResilientApi {
    async fn list_dexes(&self, network: &str) -> Result<Vec<ApiDex>> {
        self.call(Endpoint::DexList, || self.inner.list_dexes(network))
            .await
    }

    async fn top_pools(&self, network: &str, dex: Option<&str>, page: u32) -> Result<Vec<ApiPool>> {
        self.call(Endpoint::TopPools, || self.inner.top_pools(network, dex, page))
            .await
    }

    async fn pools_by_ids(&self, network: &str, pool_ids: &[String]) -> Result<Vec<ApiPool>> {
        self.call(Endpoint::MultiPools, || {
            self.inner.pools_by_ids(network, pool_ids)
        })
        .await
    }

    async fn pool_by_address(&self, network: &str, address: &str) -> Result<ApiPool> {
        self.call(Endpoint::PoolByAddress, || {
            self.inner.pool_by_address(network, address)
        })
        .await
    }

    async fn ohlcv(&self, request: &OhlcvRequest) -> Result<OhlcvSeries> {
        self.call(Endpoint::Ohlcv, || self.inner.ohlcv(request)).await
    }

    async fn trades(
        &self,
        network: &str,
        pool_address: &str,
        min_volume_usd: f64,
    ) -> Result<Vec<ApiTrade>> {
        self.call(Endpoint::Trades, || {
            self.inner.trades(network, pool_address, min_volume_usd)
        })
        .await
    }

    async fn token_info(&self, network: &str, address: &str) -> Result<ApiToken> {
        self.call(Endpoint::TokenInfo, || self.inner.token_info(network, address))
            .await
    }

    async fn new_pools(&self, network: &str, page: u32) -> Result<Vec<ApiPool>> {
        self.call(Endpoint::NewPools, || self.inner.new_pools(network, page))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockClient;
    use crate::settings::{CircuitBreakerSettings, RateLimitSettings};
    use std::time::Duration;

    fn harness(max_retries: u32, threshold: u32) -> (Arc<MockClient>, ResilientApi) {
        let mock = Arc::new(MockClient::empty());
        let limiter = Arc::new(ApiRateLimiter::new(&RateLimitSettings {
            per_endpoint_min_delay_ms: 1,
            requests_per_minute: 60_000,
            monthly_budget: 1_000_000,
        }));
        let breaker = Arc::new(CircuitBreaker::new(&CircuitBreakerSettings {
            failure_threshold: threshold,
            recovery_timeout_secs: 300,
        }));
        let retry = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let api = ResilientApi::new(mock.clone(), limiter, breaker, retry);
        (mock, api)
    }

    #[tokio::test]
    async fn retries_through_rate_limits() {
        let (mock, api) = harness(3, 5);
        mock.script_failure(Endpoint::DexList, HarvestError::RateLimit { retry_after: None });
        mock.script_failure(Endpoint::DexList, HarvestError::RateLimit { retry_after: None });

        let dexes = api.list_dexes("solana").await.unwrap();
        assert!(dexes.is_empty());
        assert_eq!(mock.call_count(Endpoint::DexList), 3);
        assert_eq!(api.rate_limit_retries(), 2);
    }

    #[tokio::test]
    async fn open_breaker_blocks_outbound_calls() {
        let (mock, api) = harness(0, 2);
        for _ in 0..2 {
            mock.script_failure(
                Endpoint::DexList,
                HarvestError::ServerError {
                    status: 500,
                    message: "down".into(),
                },
            );
            let _ = api.list_dexes("solana").await;
        }
        assert_eq!(mock.call_count(Endpoint::DexList), 2);

        // Breaker is open: the next call fails fast with no transport call.
        let err = api.list_dexes("solana").await.unwrap_err();
        assert!(matches!(err, HarvestError::CircuitOpen { .. }));
        assert_eq!(mock.call_count(Endpoint::DexList), 2);
    }

    #[tokio::test]
    async fn auth_failures_surface_without_retry() {
        let (mock, api) = harness(5, 5);
        mock.script_failure(Endpoint::TokenInfo, HarvestError::Authentication { status: 401 });
        let err = api.token_info("solana", "addr").await.unwrap_err();
        assert!(matches!(err, HarvestError::Authentication { .. }));
        assert_eq!(mock.call_count(Endpoint::TokenInfo), 1);
    }
}
