//! # Gecko Harvester
//!
//! Continuous market-data harvester for decentralized-exchange pools. The
//! crate collects pool metadata, OHLCV candles, individual trades and
//! newly-listed pools from the GeckoTerminal JSON API for a configured set
//! of DEXes on one network, and persists them into a relational store
//! suitable for later quantitative export.
//!
//! ## Architecture
//!
//! The collection core is organized into layers:
//!
//! ### Upstream layer
//! One typed client method per API endpoint, behind a trait so a
//! fixture-backed mock substitutes for the live transport. Every call runs
//! through the resilience stack: rate limiter, circuit breaker, retry
//! engine with exponential backoff.
//!
//! ### Collector layer
//! Eight interval-driven collectors (DEX list, top pools, watchlist
//! monitor and refresh, OHLCV, historical backfill, trades, new pools),
//! each a concrete value behind one small trait, executed through an
//! error-wrapped runner that keeps per-collector metadata truthful.
//!
//! ### Storage layer
//! Deduplicating inserts, non-null-preserving upserts, gap enumeration and
//! range queries over one portable SQL abstraction serving both the
//! embedded store and the server database, with an ordered batch queue for
//! the single-writer case.
//!
//! ### Signal layer
//! A pure scorer over new-pool snapshot history deciding alerts and
//! automatic watchlist additions.

// Upstream API
/// Client trait, transports, and the resilience wrapper
pub mod api;
/// Per-endpoint circuit breakers
pub mod circuit_breaker;
/// Two-tier request pacing and the monthly budget
pub mod rate_limiter;
/// Exponential backoff with jitter
pub mod retry;

// Collection
/// Collector trait, validation helpers, and the wrapped runner
pub mod collectors;
/// Interval registry and dispatch loop
pub mod scheduler;

// Domain & analysis
/// Persisted entities
pub mod models;
/// Signal scoring for newly observed pools
pub mod signal;
/// CSV + database watchlist source of truth
pub mod watchlist;

// Infrastructure
/// Failure taxonomy
pub mod error;
/// Strategy-dispatching failure handler
pub mod error_handler;
/// Per-collector health counters and alert policy
pub mod health;
/// Metrics facade (no-op without the `observability` feature)
pub mod metrics;
/// Portable relational store
pub mod storage;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use api::{Endpoint, PoolDataApi};
pub use collectors::{run_collector, CollectionResult, Collector};
pub use error::HarvestError;
pub use scheduler::Scheduler;
pub use settings::Settings;
pub use storage::Storage;
