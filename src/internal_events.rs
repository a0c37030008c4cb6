//! Lightweight internal instrumentation.
//!
//! Mirrors the gauge-per-entity pattern `vector_buffers` uses for its buffer metrics: a small set
//! of named gauges/counters tagged by storage path, updated from the hot path. This is
//! observability only — nothing here is queryable state, so it doesn't reintroduce the indexing
//! the store explicitly does without.

use metrics::{counter, gauge};

/// Updates the two gauges that track an engine's on-disk footprint and live-record count.
pub(crate) fn set_engine_gauges(path: &str, records_stored: i64, db_size: i64) {
    gauge!("queue_records_stored", "path" => path.to_string()).set(records_stored as f64);
    gauge!("queue_db_size_bytes", "path" => path.to_string()).set(db_size as f64);
}

/// Counts a single append.
pub(crate) fn record_write(path: &str) {
    counter!("queue_writes_total", "path" => path.to_string()).increment(1);
}

/// Counts a single consuming read.
pub(crate) fn record_read(path: &str) {
    counter!("queue_reads_total", "path" => path.to_string()).increment(1);
}

/// Counts a completed compaction cycle.
pub(crate) fn record_compaction_cycle() {
    counter!("queue_compaction_cycles_total").increment(1);
}
