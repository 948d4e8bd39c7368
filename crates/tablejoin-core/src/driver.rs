//! The join driver.
//!
//! [`JoinImplementation`] runs one join described by a
//! [`JoinSpecification`]: it validates the configuration, picks a strategy
//! and a hash side, drives the strategy against a [`JoinResult`] and keeps
//! the execution state and metrics up to date.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tablejoin_error::{JoinError, Result};
use tablejoin_types::{Cx, InputTable};
use tracing::{debug, info, info_span, warn};

use crate::config::JoinConfig;
use crate::hybrid::HybridHashJoin;
use crate::metrics::JoinMetrics;
use crate::monitor::{JoinProgressMonitor, JoinState, MemoryProbe};
use crate::nested_loop::BlockNestedLoop;
use crate::order::MAX_ROW_OFFSET;
use crate::results::{JoinContainer, JoinOutput, JoinResult, OutputFormat, ResultOrder};
use crate::specification::{JoinSpecification, OutputRowOrder};

/// How a join is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinStrategy {
    /// Compare blocks of hash rows against full scans of the probe side.
    BlockNestedLoop,
    /// Hash join spilling partitions to disk under memory pressure.
    HybridHash,
    /// One conjunctive sub-join per clause of a disjunctive join, merged
    /// with deduplication and deferred unmatched rows.
    MatchAny,
}

impl JoinStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BlockNestedLoop => "block_nested_loop",
            Self::HybridHash => "hybrid_hash",
            Self::MatchAny => "match_any",
        }
    }
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes joins of one specification.
#[derive(Debug)]
pub struct JoinImplementation {
    spec: Arc<JoinSpecification>,
    config: JoinConfig,
    cx: Cx,
    metrics: Arc<JoinMetrics>,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
    state: JoinState,
}

impl JoinImplementation {
    #[must_use]
    pub fn new(spec: JoinSpecification, cx: Cx) -> Self {
        Self {
            spec: Arc::new(spec),
            config: JoinConfig::default(),
            cx,
            metrics: Arc::new(JoinMetrics::new()),
            memory_probe: None,
            state: JoinState::NotStarted,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: JoinConfig) -> Self {
        self.config = config;
        self
    }

    /// Report into `metrics` instead of a private instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<JoinMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn specification(&self) -> &JoinSpecification {
        &self.spec
    }

    #[must_use]
    pub const fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// Spill file budget; half of it is the number of hash partitions.
    pub fn set_max_open_files(&mut self, max_open_files: usize) {
        self.config.max_open_files = max_open_files;
    }

    /// Fraction of the memory limit at which partitions are spilled.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::InvalidSettings`] unless `fraction` is in `(0, 1]`.
    pub fn set_memory_limit_fraction(&mut self, fraction: f64) -> Result<()> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(JoinError::invalid_settings(format!(
                "memory_limit_fraction must be in (0, 1], got {fraction}"
            )));
        }
        self.config.memory_limit_fraction = fraction;
        Ok(())
    }

    /// Keep the mapping from output rows to input rows.
    pub fn set_enable_hiliting(&mut self, enabled: bool) {
        self.config.enable_hiliting = enabled;
    }

    pub fn set_memory_probe(&mut self, probe: Arc<dyn MemoryProbe>) {
        self.memory_probe = Some(probe);
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<JoinMetrics> {
        &self.metrics
    }

    #[must_use]
    pub const fn state(&self) -> JoinState {
        self.state
    }

    #[must_use]
    pub const fn cx(&self) -> &Cx {
        &self.cx
    }

    /// Strategy the next join will use. A disjunctive join with several
    /// clauses is always decomposed; a forced strategy then applies to the
    /// sub-joins.
    #[must_use]
    pub fn strategy(&self) -> JoinStrategy {
        if self.spec.is_match_any() {
            return JoinStrategy::MatchAny;
        }
        self.config.strategy.unwrap_or(JoinStrategy::HybridHash)
    }

    /// Input to index: the configured one, else the one with fewer rows.
    /// Ties index the right input.
    #[must_use]
    pub fn hash_side(&self) -> InputTable {
        self.config.hash_side.unwrap_or_else(|| {
            let left = self.spec.settings(InputTable::Left).row_count();
            let right = self.spec.settings(InputTable::Right).row_count();
            if left < right {
                InputTable::Left
            } else {
                InputTable::Right
            }
        })
    }

    /// Row order the container of this join uses.
    #[must_use]
    pub fn result_order(&self) -> ResultOrder {
        if self.strategy() == JoinStrategy::MatchAny {
            return match self.spec.output_row_order() {
                OutputRowOrder::Arbitrary => ResultOrder::Arbitrary,
                OutputRowOrder::Deterministic | OutputRowOrder::LeftRight => ResultOrder::LeftRight,
            };
        }
        match self.spec.output_row_order() {
            OutputRowOrder::Arbitrary => ResultOrder::Arbitrary,
            OutputRowOrder::Deterministic => ResultOrder::ProbeMajor {
                probe: self.hash_side().other(),
            },
            OutputRowOrder::LeftRight => ResultOrder::LeftRight,
        }
    }

    /// A result container matching this join's specification and order.
    #[must_use]
    pub fn new_container(&self, format: OutputFormat) -> JoinContainer {
        JoinContainer::new(Arc::clone(&self.spec), format, self.result_order())
            .with_hiliting(self.config.enable_hiliting)
            .with_spill_settings(&self.config)
    }

    /// Join into one table: matches, then left and right unmatched rows,
    /// padded with missing values.
    pub fn join_output_combined(&mut self) -> Result<JoinOutput> {
        let mut container = self.new_container(OutputFormat::Combined);
        self.join(&mut container)?;
        container.finish()
    }

    /// Join into separate match, left-unmatched and right-unmatched tables.
    pub fn join_output_split(&mut self) -> Result<JoinOutput> {
        let mut container = self.new_container(OutputFormat::Split);
        self.join(&mut container)?;
        container.finish()
    }

    /// Execute the join, reporting into `result`.
    ///
    /// On success `result` is marked complete. On any error, cancellation
    /// included, it is left incomplete and its content must be discarded;
    /// spill files are removed before this returns.
    ///
    /// # Errors
    ///
    /// Configuration errors before any row is read, row incompatibilities,
    /// spill I/O failures, resource exhaustion and [`JoinError::Cancelled`].
    pub fn join(&mut self, result: &mut dyn JoinResult) -> Result<()> {
        let strategy = self.strategy();
        let _span = info_span!(
            target: "tablejoin::driver",
            "join",
            strategy = %strategy,
            clauses = self.spec.num_join_clauses()
        )
        .entered();
        self.metrics.reset_execution();
        let mut monitor = JoinProgressMonitor::new(
            self.cx.clone(),
            &self.config,
            Arc::clone(&self.metrics),
            self.memory_probe.clone(),
        );

        let outcome = self.execute(strategy, result, &mut monitor);
        self.state = match &outcome {
            Ok(()) => {
                result.complete();
                self.metrics.inc_joins_completed();
                JoinState::Done
            }
            Err(err) if err.is_cancelled() => {
                warn!(target: "tablejoin::driver", state = %monitor.state(), "join cancelled");
                self.metrics.inc_joins_cancelled();
                JoinState::Canceled
            }
            Err(err) => {
                warn!(target: "tablejoin::driver", state = %monitor.state(), error = %err, "join failed");
                JoinState::Failed
            }
        };
        monitor.enter(self.state);
        outcome
    }

    fn execute(
        &self,
        strategy: JoinStrategy,
        result: &mut dyn JoinResult,
        monitor: &mut JoinProgressMonitor,
    ) -> Result<()> {
        self.config.validate()?;
        if strategy == JoinStrategy::MatchAny && self.spec.is_conjunctive() && self.spec.num_join_clauses() > 1 {
            return Err(JoinError::invalid_settings(
                "match-any decomposition requires a disjunctive join",
            ));
        }
        if self.spec.is_empty_join() {
            info!(target: "tablejoin::driver", "nothing retained, skipping empty join");
            return Ok(());
        }
        for side in InputTable::BOTH {
            let settings = self.spec.settings(side);
            let table = settings.require_table()?;
            if table.row_count() > MAX_ROW_OFFSET {
                return Err(JoinError::resource_exhausted(format!(
                    "{side} input has {} rows; at most {MAX_ROW_OFFSET} are supported",
                    table.row_count()
                )));
            }
        }

        let hash_side = self.hash_side();
        info!(
            target: "tablejoin::driver",
            strategy = %strategy,
            hash_side = %hash_side,
            left_rows = self.spec.settings(InputTable::Left).row_count(),
            right_rows = self.spec.settings(InputTable::Right).row_count(),
            "join started"
        );
        match strategy {
            JoinStrategy::MatchAny => self.match_any(hash_side, result, monitor)?,
            JoinStrategy::HybridHash | JoinStrategy::BlockNestedLoop => {
                self.run_single(Arc::clone(&self.spec), strategy, hash_side, result, monitor)?;
            }
        }

        monitor.enter(JoinState::DrainingUnmatched);
        monitor.set_message("collecting unmatched rows");
        result.drain_deferred_unmatched(monitor.cx())?;
        result.sorted_chunk_end()?;
        info!(target: "tablejoin::driver", "join finished");
        Ok(())
    }

    fn run_single(
        &self,
        spec: Arc<JoinSpecification>,
        strategy: JoinStrategy,
        hash_side: InputTable,
        result: &mut dyn JoinResult,
        monitor: &mut JoinProgressMonitor,
    ) -> Result<()> {
        match strategy {
            JoinStrategy::BlockNestedLoop => {
                let hash = Arc::clone(spec.settings(hash_side).require_table()?);
                let probe = Arc::clone(spec.settings(hash_side.other()).require_table()?);
                monitor.enter(JoinState::Probing);
                let blocks = BlockNestedLoop::new(
                    &spec,
                    hash_side,
                    monitor.budget_bytes(),
                    false,
                    monitor.cancel_checker(),
                )
                .join(hash.as_ref(), probe.as_ref(), result)?;
                debug!(target: "tablejoin::driver", blocks, "block nested loop finished");
                Ok(())
            }
            JoinStrategy::HybridHash | JoinStrategy::MatchAny => {
                HybridHashJoin::new(spec, &self.config, hash_side, monitor).run(result)
            }
        }
    }

    /// Run one single-clause sub-join per clause. A pair matching several
    /// clauses is reported once; a row is unmatched only if no clause
    /// matched it.
    fn match_any(
        &self,
        hash_side: InputTable,
        result: &mut dyn JoinResult,
        monitor: &mut JoinProgressMonitor,
    ) -> Result<()> {
        result.enable_deduplication();
        for side in InputTable::BOTH {
            result.set_defer_unmatched_rows(side, true)?;
        }
        let inner = match self.config.strategy {
            Some(JoinStrategy::BlockNestedLoop) => JoinStrategy::BlockNestedLoop,
            _ => JoinStrategy::HybridHash,
        };
        let clauses = self.spec.num_join_clauses();
        for clause in 0..clauses {
            monitor.check_canceled()?;
            let sub = self
                .spec
                .using_only_join_clause(clause)
                .with_output_row_order(OutputRowOrder::LeftRight);
            debug!(
                target: "tablejoin::driver",
                clause,
                clauses,
                left = %sub.settings(InputTable::Left).join_clauses()[0],
                right = %sub.settings(InputTable::Right).join_clauses()[0],
                "match-any sub-join"
            );
            self.run_single(Arc::new(sub), inner, hash_side, result, monitor)?;
        }
        Ok(())
    }
}
