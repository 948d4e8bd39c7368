//! Join diagnostics counters.
//!
//! One [`JoinMetrics`] is shared by `Arc` between a join driver and whoever
//! monitors it; [`JoinMetrics::snapshot`] gives a consistent-enough,
//! serializable read-out. Nothing is registered process-wide.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tablejoin_error::{JoinError, Result};

/// Live counters of one or more join executions.
#[derive(Debug, Default)]
pub struct JoinMetrics {
    partitions: AtomicU64,
    partitions_on_disk: AtomicU64,
    probe_rows_in_memory: AtomicU64,
    probe_rows_from_disk: AtomicU64,
    hash_rows_indexed: AtomicU64,
    repartitions: AtomicU64,
    nested_loop_fallbacks: AtomicU64,
    spilled_bytes: AtomicU64,
    joins_completed: AtomicU64,
    joins_cancelled: AtomicU64,
    buckets: Mutex<BucketSizes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BucketSizes {
    hash: Vec<u64>,
    probe: Vec<u64>,
}

/// Min/max/mean of a bucket size distribution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BucketStats {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl BucketStats {
    #[must_use]
    pub fn from_sizes(sizes: &[u64]) -> Self {
        let Some(&min) = sizes.iter().min() else {
            return Self::default();
        };
        let max = sizes.iter().copied().max().unwrap_or(min);
        let sum: u64 = sizes.iter().sum();
        Self {
            count: sizes.len() as u64,
            min,
            max,
            mean: sum as f64 / sizes.len() as f64,
        }
    }
}

/// Point-in-time copy of [`JoinMetrics`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinMetricsSnapshot {
    pub partitions: u64,
    pub partitions_on_disk: u64,
    pub probe_rows_in_memory: u64,
    pub probe_rows_from_disk: u64,
    pub hash_rows_indexed: u64,
    pub repartitions: u64,
    pub nested_loop_fallbacks: u64,
    pub spilled_bytes: u64,
    pub joins_completed: u64,
    pub joins_cancelled: u64,
    /// Row counts of the hash-side disk buckets, by partition.
    pub hash_bucket_sizes: Vec<u64>,
    /// Row counts of the probe-side disk buckets, by partition.
    pub probe_bucket_sizes: Vec<u64>,
    pub hash_bucket_stats: BucketStats,
    pub probe_bucket_stats: BucketStats,
}

impl JoinMetricsSnapshot {
    /// Serialize for an external monitoring collaborator.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| JoinError::internal(format!("metrics serialization failed: {e}")))
    }
}

impl JoinMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_partitions(&self, n: usize) {
        self.partitions.store(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_partitions_on_disk(&self, n: usize) {
        self.partitions_on_disk.store(n as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn partitions_on_disk(&self) -> u64 {
        self.partitions_on_disk.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_probe_rows_in_memory(&self) {
        self.probe_rows_in_memory.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_probe_rows_from_disk(&self) {
        self.probe_rows_from_disk.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_hash_rows_indexed(&self, n: usize) {
        self.hash_rows_indexed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn inc_repartitions(&self) {
        self.repartitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_nested_loop_fallbacks(&self) {
        self.nested_loop_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_spilled_bytes(&self, bytes: u64) {
        self.spilled_bytes.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn inc_joins_completed(&self) {
        self.joins_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_joins_cancelled(&self) {
        self.joins_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the disk bucket sizes of the partitions processed in phase 3.
    pub(crate) fn set_bucket_sizes(&self, hash: Vec<u64>, probe: Vec<u64>) {
        *self.buckets.lock() = BucketSizes { hash, probe };
    }

    /// Zero the per-execution gauges; totals survive.
    pub(crate) fn reset_execution(&self) {
        for gauge in [
            &self.partitions,
            &self.partitions_on_disk,
            &self.probe_rows_in_memory,
            &self.probe_rows_from_disk,
            &self.hash_rows_indexed,
            &self.repartitions,
            &self.nested_loop_fallbacks,
            &self.spilled_bytes,
        ] {
            gauge.store(0, Ordering::Relaxed);
        }
        *self.buckets.lock() = BucketSizes::default();
    }

    #[must_use]
    pub fn snapshot(&self) -> JoinMetricsSnapshot {
        let buckets = self.buckets.lock().clone();
        JoinMetricsSnapshot {
            partitions: self.partitions.load(Ordering::Relaxed),
            partitions_on_disk: self.partitions_on_disk.load(Ordering::Relaxed),
            probe_rows_in_memory: self.probe_rows_in_memory.load(Ordering::Relaxed),
            probe_rows_from_disk: self.probe_rows_from_disk.load(Ordering::Relaxed),
            hash_rows_indexed: self.hash_rows_indexed.load(Ordering::Relaxed),
            repartitions: self.repartitions.load(Ordering::Relaxed),
            nested_loop_fallbacks: self.nested_loop_fallbacks.load(Ordering::Relaxed),
            spilled_bytes: self.spilled_bytes.load(Ordering::Relaxed),
            joins_completed: self.joins_completed.load(Ordering::Relaxed),
            joins_cancelled: self.joins_cancelled.load(Ordering::Relaxed),
            hash_bucket_stats: BucketStats::from_sizes(&buckets.hash),
            probe_bucket_stats: BucketStats::from_sizes(&buckets.probe),
            hash_bucket_sizes: buckets.hash,
            probe_bucket_sizes: buckets.probe,
        }
    }
}
