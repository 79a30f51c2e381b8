//! Upstream request pacing.
//!
//! Two admission tiers gate every outbound call: a per-endpoint minimum
//! inter-request delay and a global pacing quota sized to the upstream
//! per-minute cap. A monthly call budget is tracked alongside with a soft
//! warning at 80% consumption. The limiter is constructed once at startup
//! and shared by every collector; admission is FIFO per endpoint key.

use crate::api::Endpoint;
use crate::settings::RateLimitSettings;
use chrono::{Datelike, Utc};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug)]
struct EndpointGate {
    next_allowed: Instant,
}

/// Process-global request pacer shared across all collectors.
pub struct ApiRateLimiter {
    global: DirectRateLimiter,
    /// One gate per endpoint; the tokio mutex queues waiters in FIFO order.
    gates: DashMap<Endpoint, Arc<Mutex<EndpointGate>>>,
    min_delay: Duration,
    monthly_budget: u64,
    monthly_used: AtomicU64,
    budget_month: AtomicU32,
    budget_warned: AtomicBool,
}

impl ApiRateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        // Evenly spaced admissions keep any 60-second window at or below the
        // per-minute cap; a bursty quota could double up across window edges.
        let spacing = Duration::from_secs(60) / settings.requests_per_minute.max(1);
        let quota = Quota::with_period(spacing)
            .expect("spacing is non-zero")
            .allow_burst(NonZeroU32::new(1).expect("non-zero burst"));
        Self {
            global: RateLimiter::direct(quota),
            gates: DashMap::new(),
            min_delay: Duration::from_millis(settings.per_endpoint_min_delay_ms),
            monthly_budget: settings.monthly_budget,
            monthly_used: AtomicU64::new(0),
            budget_month: AtomicU32::new(Utc::now().month()),
            budget_warned: AtomicBool::new(false),
        }
    }

    fn gate(&self, endpoint: Endpoint) -> Arc<Mutex<EndpointGate>> {
        self.gates
            .entry(endpoint)
            .or_insert_with(|| {
                Arc::new(Mutex::new(EndpointGate {
                    next_allowed: Instant::now(),
                }))
            })
            .clone()
    }

    /// Block until both tiers admit a call to `endpoint`.
    ///
    /// The endpoint gate is held across the global wait so the min-delay is
    /// measured from actual admission, not from when the caller arrived.
    pub async fn acquire(&self, endpoint: Endpoint) {
        let gate = self.gate(endpoint);
        let mut gate = gate.lock().await;

        let now = Instant::now();
        if gate.next_allowed > now {
            tokio::time::sleep_until(gate.next_allowed).await;
        }

        self.global.until_ready().await;

        gate.next_allowed = Instant::now() + self.min_delay;
        drop(gate);

        self.consume_budget(endpoint);
    }

    /// Note an upstream `429`. The next admission for the endpoint is pushed
    /// out by at least `retry_after` (or the min delay when absent).
    pub fn penalize(&self, endpoint: Endpoint, retry_after: Option<Duration>) {
        let penalty = retry_after.unwrap_or(self.min_delay);
        let gate = self.gate(endpoint);
        // Synchronous best-effort update; an in-flight waiter re-reads the
        // deadline after it acquires the gate.
        if let Ok(mut gate) = gate.try_lock() {
            let candidate = Instant::now() + penalty;
            if candidate > gate.next_allowed {
                gate.next_allowed = candidate;
            }
        }
        warn!(
            endpoint = endpoint.as_str(),
            penalty_secs = penalty.as_secs(),
            "upstream rate limit observed, delaying next admission"
        );
    }

    fn consume_budget(&self, endpoint: Endpoint) {
        let month = Utc::now().month();
        let tracked = self.budget_month.load(Ordering::Relaxed);
        if month != tracked
            && self
                .budget_month
                .compare_exchange(tracked, month, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.monthly_used.store(0, Ordering::Relaxed);
            self.budget_warned.store(false, Ordering::Relaxed);
        }

        let used = self.monthly_used.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(endpoint = endpoint.as_str(), used, "api call admitted");

        let warn_at = self.monthly_budget * 8 / 10;
        if used >= warn_at && !self.budget_warned.swap(true, Ordering::Relaxed) {
            warn!(
                used,
                budget = self.monthly_budget,
                "monthly API budget at 80%"
            );
        }
    }

    /// Calls consumed in the current month.
    pub fn monthly_used(&self) -> u64 {
        self.monthly_used.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: u32, min_delay_ms: u64) -> ApiRateLimiter {
        ApiRateLimiter::new(&RateLimitSettings {
            per_endpoint_min_delay_ms: min_delay_ms,
            requests_per_minute: rpm,
            monthly_budget: 1_000,
        })
    }

    #[tokio::test]
    async fn endpoint_min_delay_enforced() {
        let limiter = limiter(6_000, 50);
        let start = Instant::now();
        limiter.acquire(Endpoint::Ohlcv).await;
        limiter.acquire(Endpoint::Ohlcv).await;
        limiter.acquire(Endpoint::Ohlcv).await;
        // Two inter-request delays of 50ms each.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn different_endpoints_do_not_share_min_delay() {
        let limiter = limiter(6_000, 200);
        limiter.acquire(Endpoint::Ohlcv).await;
        let start = Instant::now();
        limiter.acquire(Endpoint::Trades).await;
        // Global spacing at 6000/min is 10ms; the 200ms endpoint delay must
        // not apply across endpoint keys.
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn penalty_extends_next_admission() {
        tokio::time::pause();
        let limiter = limiter(6_000, 1);
        limiter.acquire(Endpoint::Ohlcv).await;
        limiter.penalize(Endpoint::Ohlcv, Some(Duration::from_secs(30)));

        let start = Instant::now();
        limiter.acquire(Endpoint::Ohlcv).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn budget_counts_admissions() {
        let limiter = limiter(6_000, 1);
        limiter.acquire(Endpoint::TopPools).await;
        limiter.acquire(Endpoint::NewPools).await;
        assert_eq!(limiter.monthly_used(), 2);
    }
}
