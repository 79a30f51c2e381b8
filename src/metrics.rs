//! Metrics facade.
//!
//! Thin wrappers over the `metrics` crate, compiled to no-ops unless the
//! `observability` feature is enabled so call sites stay unconditional.

#[cfg(feature = "observability")]
use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub fn record_collection_pass(collector: &str, success: bool, stored: u64, duration: Duration) {
    #[cfg(feature = "observability")]
    {
        counter!("harvester_collection_passes_total", 1,
            "collector" => collector.to_string(),
            "success" => success.to_string());
        counter!("harvester_records_stored_total", stored, "collector" => collector.to_string());
        histogram!("harvester_collection_duration_seconds", duration.as_secs_f64(),
            "collector" => collector.to_string());
    }
    #[cfg(not(feature = "observability"))]
    let _ = (collector, success, stored, duration);
}

pub fn record_db_batch(operations: usize, duration: Duration) {
    #[cfg(feature = "observability")]
    {
        histogram!("harvester_db_batch_duration_seconds", duration.as_secs_f64());
        histogram!("harvester_db_batch_size", operations as f64);
    }
    #[cfg(not(feature = "observability"))]
    let _ = (operations, duration);
}

pub fn set_backfill_queue_depth(depth: usize) {
    #[cfg(feature = "observability")]
    gauge!("harvester_backfill_queue_depth", depth as f64);
    #[cfg(not(feature = "observability"))]
    let _ = depth;
}
