//! Progress, cancellation and memory-pressure tracking of one join execution.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tablejoin_error::Result;
use tablejoin_types::{CancelChecker, Cx};

use crate::config::JoinConfig;
use crate::metrics::JoinMetrics;

/// Source of the current memory usage of a join.
pub trait MemoryProbe: Send + Sync + fmt::Debug {
    fn used_bytes(&self) -> u64;
}

/// Execution state of a join.
///
/// `NotStarted → IndexingHashSide → Probing → (SpillingToDisk ⇄
/// ProbingFromDisk)* → DrainingUnmatched → Done`. `Canceled` and `Failed`
/// are reachable from every state and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JoinState {
    #[default]
    NotStarted,
    IndexingHashSide,
    Probing,
    SpillingToDisk,
    ProbingFromDisk,
    DrainingUnmatched,
    Done,
    Canceled,
    Failed,
}

impl JoinState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::IndexingHashSide => "indexing_hash_side",
            Self::Probing => "probing",
            Self::SpillingToDisk => "spilling_to_disk",
            Self::ProbingFromDisk => "probing_from_disk",
            Self::DrainingUnmatched => "draining_unmatched",
            Self::Done => "done",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled | Self::Failed)
    }
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one join execution for the strategies driving it.
#[derive(Debug)]
pub struct JoinProgressMonitor {
    cancel: CancelChecker,
    metrics: Arc<JoinMetrics>,
    probe: Option<Arc<dyn MemoryProbe>>,
    budget_bytes: u64,
    throttle: Duration,
    assume_memory_low: bool,
    desired_partitions_on_disk: usize,
    last_sample: Option<Instant>,
    last_low: bool,
    state: JoinState,
    message: String,
    progress: f64,
}

impl JoinProgressMonitor {
    #[must_use]
    pub fn new(
        cx: Cx,
        config: &JoinConfig,
        metrics: Arc<JoinMetrics>,
        probe: Option<Arc<dyn MemoryProbe>>,
    ) -> Self {
        Self {
            cancel: CancelChecker::new(cx, config.cancel_check_interval_rows),
            metrics,
            probe,
            budget_bytes: config.memory_budget_bytes(),
            throttle: Duration::from_millis(config.memory_check_interval_ms),
            assume_memory_low: config.assume_memory_low,
            desired_partitions_on_disk: config.desired_partitions_on_disk,
            last_sample: None,
            last_low: false,
            state: JoinState::NotStarted,
            message: String::new(),
            progress: 0.0,
        }
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<JoinMetrics> {
        &self.metrics
    }

    /// Fresh checker polling the same context, for loops owned elsewhere.
    #[must_use]
    pub fn cancel_checker(&self) -> CancelChecker {
        CancelChecker::new(self.cancel.cx().clone(), self.cancel.interval())
    }

    #[must_use]
    pub const fn cx(&self) -> &Cx {
        self.cancel.cx()
    }

    /// Count one row; polls the cancellation flag every configured interval.
    pub fn check_canceled(&mut self) -> Result<()> {
        self.cancel.check()
    }

    /// Whether the in-memory hash partitions should shrink.
    ///
    /// Memory usage is re-sampled at most once per configured interval;
    /// between samples the last answer is repeated. `in_memory_bytes` is the
    /// caller's estimate, used when no [`MemoryProbe`] is installed.
    pub fn is_memory_low(&mut self, in_memory_bytes: u64) -> bool {
        if self.assume_memory_low {
            return true;
        }
        if (self.metrics.partitions_on_disk() as usize) < self.desired_partitions_on_disk {
            return true;
        }
        let now = Instant::now();
        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.throttle {
                return self.last_low;
            }
        }
        self.last_sample = Some(now);
        let used = self
            .probe
            .as_ref()
            .map_or(in_memory_bytes, |probe| probe.used_bytes());
        self.last_low = used > self.budget_bytes;
        if self.last_low {
            tracing::debug!(
                target: "tablejoin::monitor",
                used_bytes = used,
                budget_bytes = self.budget_bytes,
                "memory low"
            );
        }
        self.last_low
    }

    /// Forget the cached memory reading, e.g. after partitions were flushed.
    pub fn memory_relieved(&mut self) {
        self.last_sample = None;
        self.last_low = false;
    }

    #[must_use]
    pub const fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn enter(&mut self, state: JoinState) {
        if self.state != state {
            tracing::debug!(
                target: "tablejoin::monitor",
                from = %self.state,
                to = %state,
                "join state"
            );
            self.state = state;
        }
    }

    #[must_use]
    pub const fn state(&self) -> JoinState {
        self.state
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Record progress in `[0, 1]` and poll the cancellation flag.
    pub fn set_progress_and_check_canceled(&mut self, fraction: f64) -> Result<()> {
        self.progress = fraction.clamp(0.0, 1.0);
        self.cancel.check_now()
    }

    #[must_use]
    pub const fn progress(&self) -> f64 {
        self.progress
    }
}
