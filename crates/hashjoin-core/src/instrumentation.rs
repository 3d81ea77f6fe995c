//! Join observability counters.
//!
//! Lightweight process-local counters. Snapshots are cumulative across joins
//! until [`reset_join_metrics`] is called.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of join metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct JoinMetricsSnapshot {
    /// Rows inserted into hash indexes.
    pub hashjoin_rows_indexed_total: u64,
    /// Probe rows looked up in hash indexes.
    pub hashjoin_probe_rows_total: u64,
    /// Matching pairs emitted by hash indexes (before de-duplication).
    pub hashjoin_matches_emitted_total: u64,
    /// Partitions moved from memory to disk.
    pub hashjoin_partitions_spilled_total: u64,
    /// Rows written to spill files.
    pub hashjoin_spill_rows_total: u64,
    /// Record bytes written to spill files.
    pub hashjoin_spill_bytes_total: u64,
    /// Blocks a spilled partition was split into because it exceeded the
    /// memory budget on reload.
    pub hashjoin_spill_blocks_total: u64,
    /// Joins that ended in cancellation.
    pub hashjoin_cancellations_total: u64,
}

static ROWS_INDEXED_TOTAL: AtomicU64 = AtomicU64::new(0);
static PROBE_ROWS_TOTAL: AtomicU64 = AtomicU64::new(0);
static MATCHES_EMITTED_TOTAL: AtomicU64 = AtomicU64::new(0);
static PARTITIONS_SPILLED_TOTAL: AtomicU64 = AtomicU64::new(0);
static SPILL_ROWS_TOTAL: AtomicU64 = AtomicU64::new(0);
static SPILL_BYTES_TOTAL: AtomicU64 = AtomicU64::new(0);
static SPILL_BLOCKS_TOTAL: AtomicU64 = AtomicU64::new(0);
static CANCELLATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_row_indexed() {
    ROWS_INDEXED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_probe() {
    PROBE_ROWS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_match() {
    MATCHES_EMITTED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_partition_spilled() {
    PARTITIONS_SPILLED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_spill_row(bytes: u64) {
    SPILL_ROWS_TOTAL.fetch_add(1, Ordering::Relaxed);
    SPILL_BYTES_TOTAL.fetch_add(bytes, Ordering::Relaxed);
}

pub(crate) fn record_spill_blocks(blocks: u64) {
    SPILL_BLOCKS_TOTAL.fetch_add(blocks, Ordering::Relaxed);
}

pub(crate) fn record_cancellation() {
    CANCELLATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Return a snapshot of join counters.
#[must_use]
pub fn join_metrics_snapshot() -> JoinMetricsSnapshot {
    JoinMetricsSnapshot {
        hashjoin_rows_indexed_total: ROWS_INDEXED_TOTAL.load(Ordering::Relaxed),
        hashjoin_probe_rows_total: PROBE_ROWS_TOTAL.load(Ordering::Relaxed),
        hashjoin_matches_emitted_total: MATCHES_EMITTED_TOTAL.load(Ordering::Relaxed),
        hashjoin_partitions_spilled_total: PARTITIONS_SPILLED_TOTAL.load(Ordering::Relaxed),
        hashjoin_spill_rows_total: SPILL_ROWS_TOTAL.load(Ordering::Relaxed),
        hashjoin_spill_bytes_total: SPILL_BYTES_TOTAL.load(Ordering::Relaxed),
        hashjoin_spill_blocks_total: SPILL_BLOCKS_TOTAL.load(Ordering::Relaxed),
        hashjoin_cancellations_total: CANCELLATIONS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset all join counters.
pub fn reset_join_metrics() {
    for counter in [
        &ROWS_INDEXED_TOTAL,
        &PROBE_ROWS_TOTAL,
        &MATCHES_EMITTED_TOTAL,
        &PARTITIONS_SPILLED_TOTAL,
        &SPILL_ROWS_TOTAL,
        &SPILL_BYTES_TOTAL,
        &SPILL_BLOCKS_TOTAL,
        &CANCELLATIONS_TOTAL,
    ] {
        counter.store(0, Ordering::Relaxed);
    }
}
