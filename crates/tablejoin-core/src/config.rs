//! Runtime configuration of a join execution.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tablejoin_error::{JoinError, Result};
use tablejoin_types::InputTable;

use crate::driver::JoinStrategy;

/// Default number of spill files that may be open at once.
pub const DEFAULT_MAX_OPEN_FILES: usize = 200;
/// Default memory budget of in-memory hash partitions.
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;
/// Default fraction of the budget considered full.
pub const DEFAULT_MEMORY_LIMIT_FRACTION: f64 = 0.9;
/// Default throttle between two memory samples.
pub const DEFAULT_MEMORY_CHECK_INTERVAL_MS: u64 = 100;
/// Default number of rows between cancellation polls.
pub const DEFAULT_CANCEL_CHECK_INTERVAL_ROWS: u32 = 1024;
/// Default recursion cap for repartitioning skewed partitions.
pub const DEFAULT_MAX_REPARTITION_DEPTH: u32 = 3;

/// Tunables of one join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Spill file budget. Half of it is the number of hash partitions.
    pub max_open_files: usize,
    pub memory_limit_bytes: u64,
    /// Fraction of `memory_limit_bytes` at which memory counts as low.
    pub memory_limit_fraction: f64,
    pub memory_check_interval_ms: u64,
    pub cancel_check_interval_rows: u32,
    pub max_repartition_depth: u32,
    /// Keep the output-to-input row key mapping.
    pub enable_hiliting: bool,
    /// Parent of the per-join spill directory; system temp dir if unset.
    pub spill_dir: Option<PathBuf>,
    /// Testing: every memory check reports low memory.
    pub assume_memory_low: bool,
    /// Testing: report low memory until this many partitions are on disk.
    pub desired_partitions_on_disk: usize,
    /// Use this strategy instead of choosing one.
    pub strategy: Option<JoinStrategy>,
    /// Index this input instead of the smaller one.
    pub hash_side: Option<InputTable>,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            memory_limit_fraction: DEFAULT_MEMORY_LIMIT_FRACTION,
            memory_check_interval_ms: DEFAULT_MEMORY_CHECK_INTERVAL_MS,
            cancel_check_interval_rows: DEFAULT_CANCEL_CHECK_INTERVAL_ROWS,
            max_repartition_depth: DEFAULT_MAX_REPARTITION_DEPTH,
            enable_hiliting: false,
            spill_dir: None,
            assume_memory_low: false,
            desired_partitions_on_disk: 0,
            strategy: None,
            hash_side: None,
        }
    }
}

impl JoinConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::InvalidSettings`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_open_files < 2 {
            return Err(JoinError::invalid_settings(format!(
                "max_open_files must be at least 2, got {}",
                self.max_open_files
            )));
        }
        if !(self.memory_limit_fraction > 0.0 && self.memory_limit_fraction <= 1.0) {
            return Err(JoinError::invalid_settings(format!(
                "memory_limit_fraction must be in (0, 1], got {}",
                self.memory_limit_fraction
            )));
        }
        if self.memory_limit_bytes == 0 {
            return Err(JoinError::invalid_settings("memory_limit_bytes must be positive"));
        }
        Ok(())
    }

    /// Number of hash partitions: two spill files per partition.
    #[must_use]
    pub fn num_partitions(&self) -> usize {
        (self.max_open_files / 2).max(1)
    }

    /// Bytes of hash rows that may be held in memory.
    #[must_use]
    pub fn memory_budget_bytes(&self) -> u64 {
        ((self.memory_limit_bytes as f64) * self.memory_limit_fraction) as u64
    }
}
