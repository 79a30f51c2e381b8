//! Circuit breaker for upstream and storage failure isolation.
//!
//! One three-state machine per key: Closed passes requests, Open fails
//! fast, Half-Open admits a single probe. Upstream cells are keyed by
//! endpoint name; the storage layer keeps its own cell so prolonged lock
//! contention trips a breaker instead of cascading. Only server-side and
//! connection failure kinds advance the failure count; client mistakes and
//! validation problems never trip the breaker.

use crate::error::HarvestError;
use crate::settings::CircuitBreakerSettings;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerCell {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for BreakerCell {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Shared breaker bank keyed by endpoint or component name.
pub struct CircuitBreaker {
    cells: DashMap<&'static str, Mutex<BreakerCell>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(settings: &CircuitBreakerSettings) -> Self {
        Self {
            cells: DashMap::new(),
            failure_threshold: settings.failure_threshold,
            recovery_timeout: settings.recovery_timeout(),
        }
    }

    fn with_cell<R>(&self, key: &'static str, f: impl FnOnce(&mut BreakerCell) -> R) -> R {
        let cell = self.cells.entry(key).or_default();
        let mut guard = cell.lock().expect("breaker mutex poisoned");
        f(&mut guard)
    }

    /// Gate a request. `Ok(())` admits the call (Closed, or the Half-Open
    /// probe slot); `Err(CircuitOpen)` means no outbound call may be made.
    pub fn check(&self, key: &'static str) -> Result<(), HarvestError> {
        let timeout = self.recovery_timeout;
        self.with_cell(key, |cell| match cell.state {
            BreakerState::Closed => Ok(()),
            // Half-open admits exactly one probe at a time.
            BreakerState::HalfOpen => {
                if cell.probe_in_flight {
                    Err(HarvestError::CircuitOpen { endpoint: key })
                } else {
                    cell.probe_in_flight = true;
                    Ok(())
                }
            }
            BreakerState::Open => {
                let elapsed = cell.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= timeout {
                    cell.state = BreakerState::HalfOpen;
                    cell.probe_in_flight = true;
                    info!(key, "recovery timeout elapsed, admitting probe request");
                    Ok(())
                } else {
                    Err(HarvestError::CircuitOpen { endpoint: key })
                }
            }
        })
    }

    pub fn record_success(&self, key: &'static str) {
        self.with_cell(key, |cell| {
            if cell.state == BreakerState::HalfOpen {
                info!(key, "probe succeeded, closing circuit");
            }
            cell.state = BreakerState::Closed;
            cell.consecutive_failures = 0;
            cell.opened_at = None;
            cell.probe_in_flight = false;
        });
    }

    /// Record a failure. Errors that do not count toward the breaker reset
    /// nothing and trip nothing.
    pub fn record_failure(&self, key: &'static str, error: &HarvestError) {
        if !error.counts_toward_breaker() && !is_storage_contention(error) {
            return;
        }
        let threshold = self.failure_threshold;
        self.with_cell(key, |cell| match cell.state {
            BreakerState::HalfOpen => {
                cell.state = BreakerState::Open;
                cell.opened_at = Some(Instant::now());
                cell.probe_in_flight = false;
                warn!(key, "probe failed, reopening circuit");
            }
            BreakerState::Closed => {
                cell.consecutive_failures += 1;
                if cell.consecutive_failures >= threshold {
                    cell.state = BreakerState::Open;
                    cell.opened_at = Some(Instant::now());
                    warn!(
                        key,
                        failures = cell.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                }
            }
            BreakerState::Open => {}
        });
    }

    pub fn state(&self, key: &'static str) -> BreakerState {
        self.with_cell(key, |cell| cell.state)
    }

    /// True when any key's circuit is currently open.
    pub fn any_open(&self) -> bool {
        self.cells.iter().any(|entry| {
            entry
                .value()
                .lock()
                .map(|cell| cell.state == BreakerState::Open)
                .unwrap_or(false)
        })
    }
}

/// Database lock and timeout kinds trip the storage breaker even though
/// they never count toward the upstream one.
fn is_storage_contention(error: &HarvestError) -> bool {
    matches!(
        error,
        HarvestError::DatabaseLock(_)
            | HarvestError::DatabaseTimeout(_)
            | HarvestError::DatabaseConnection(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerSettings {
            failure_threshold: threshold,
            recovery_timeout_secs: timeout_secs,
        })
    }

    fn server_error() -> HarvestError {
        HarvestError::ServerError {
            status: 500,
            message: "boom".into(),
        }
    }

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let cb = breaker(3, 300);
        for _ in 0..2 {
            cb.record_failure("ohlcv", &server_error());
            assert!(cb.check("ohlcv").is_ok());
        }
        cb.record_failure("ohlcv", &server_error());
        assert_eq!(cb.state("ohlcv"), BreakerState::Open);
        assert!(matches!(
            cb.check("ohlcv"),
            Err(HarvestError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker(3, 300);
        cb.record_failure("ohlcv", &server_error());
        cb.record_failure("ohlcv", &server_error());
        cb.record_success("ohlcv");
        cb.record_failure("ohlcv", &server_error());
        cb.record_failure("ohlcv", &server_error());
        assert_eq!(cb.state("ohlcv"), BreakerState::Closed);
    }

    #[test]
    fn non_breaker_errors_never_trip() {
        let cb = breaker(1, 300);
        cb.record_failure("ohlcv", &HarvestError::Validation("bad row".into()));
        cb.record_failure("ohlcv", &HarvestError::RateLimit { retry_after: None });
        cb.record_failure("ohlcv", &HarvestError::Authentication { status: 401 });
        assert_eq!(cb.state("ohlcv"), BreakerState::Closed);
    }

    #[test]
    fn storage_contention_trips_storage_cell() {
        let cb = breaker(2, 300);
        cb.record_failure("storage", &HarvestError::DatabaseLock("busy".into()));
        cb.record_failure("storage", &HarvestError::DatabaseLock("busy".into()));
        assert_eq!(cb.state("storage"), BreakerState::Open);
    }

    #[test]
    fn probe_after_recovery_timeout() {
        let cb = breaker(1, 0);
        cb.record_failure("ohlcv", &server_error());
        assert_eq!(cb.state("ohlcv"), BreakerState::Open);
        // Zero recovery timeout: the next check flips to half-open.
        assert!(cb.check("ohlcv").is_ok());
        assert_eq!(cb.state("ohlcv"), BreakerState::HalfOpen);
        // A second caller is rejected while the probe is in flight.
        assert!(cb.check("ohlcv").is_err());
        // Probe failure reopens with a fresh window.
        cb.record_failure("ohlcv", &server_error());
        assert_eq!(cb.state("ohlcv"), BreakerState::Open);
        // Probe success closes.
        assert!(cb.check("ohlcv").is_ok());
        cb.record_success("ohlcv");
        assert_eq!(cb.state("ohlcv"), BreakerState::Closed);
    }

    #[test]
    fn keys_are_independent() {
        let cb = breaker(1, 300);
        cb.record_failure("ohlcv", &server_error());
        assert_eq!(cb.state("ohlcv"), BreakerState::Open);
        assert!(cb.check("trades").is_ok());
        assert!(cb.any_open());
    }
}
