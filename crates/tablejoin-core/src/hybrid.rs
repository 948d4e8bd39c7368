//! Hybrid hash join.
//!
//! Phase 1 indexes the hash side into [`DiskBackedHashPartitions`], flushing
//! partitions to disk whenever the monitor reports low memory. Phase 2
//! streams the probe side: rows of resident partitions are joined at once,
//! the rest are spilled next to their hash partition. Phase 3 joins the disk
//! partitions pair by pair, repartitioning skewed pairs with a fresh hash
//! seed and falling back to a block nested loop past the depth cap.

use std::sync::Arc;

use tablejoin_error::Result;
use tablejoin_storage::{DiskTable, SpillManager};
use tablejoin_types::{InMemoryTable, InputTable, Table};
use tracing::{debug, debug_span, info, warn};

use crate::config::JoinConfig;
use crate::hash_index::HashIndex;
use crate::monitor::{JoinProgressMonitor, JoinState};
use crate::nested_loop::BlockNestedLoop;
use crate::order::{tagged_spec, untag_row};
use crate::partitions::{Buckets, DiskBackedHashPartitions, DiskPartition, DiskPartitions, TOP_LEVEL_SEED};
use crate::results::JoinResult;
use crate::specification::JoinSpecification;

pub(crate) struct HybridHashJoin<'a> {
    spec: Arc<JoinSpecification>,
    config: &'a JoinConfig,
    hash_side: InputTable,
    monitor: &'a mut JoinProgressMonitor,
}

impl<'a> HybridHashJoin<'a> {
    pub(crate) fn new(
        spec: Arc<JoinSpecification>,
        config: &'a JoinConfig,
        hash_side: InputTable,
        monitor: &'a mut JoinProgressMonitor,
    ) -> Self {
        Self {
            spec,
            config,
            hash_side,
            monitor,
        }
    }

    const fn probe_side(&self) -> InputTable {
        self.hash_side.other()
    }

    pub(crate) fn run(&mut self, result: &mut dyn JoinResult) -> Result<()> {
        let hash_side = self.hash_side;
        let probe_side = self.probe_side();
        let hash_table = Arc::clone(self.spec.settings(hash_side).require_table()?);
        let probe_table = Arc::clone(self.spec.settings(probe_side).require_table()?);
        let _span = debug_span!(
            target: "tablejoin::hybrid",
            "hybrid_hash_join",
            hash_side = %hash_side,
            hash_rows = hash_table.row_count(),
            probe_rows = probe_table.row_count()
        )
        .entered();

        let cancel = self.monitor.cancel_checker();
        let metrics = Arc::clone(self.monitor.metrics());
        let mut partitions = DiskBackedHashPartitions::new(
            Arc::clone(&self.spec),
            hash_side,
            result.is_retain_unmatched(hash_side),
            self.config,
            Arc::clone(&metrics),
            &cancel,
        );

        // Phase 1: index the hash side, flushing partitions under pressure.
        self.monitor.enter(JoinState::IndexingHashSide);
        self.monitor.set_message("indexing hash side");
        let hash_settings = self.spec.settings(hash_side);
        let mut indexed = 0_usize;
        for (offset, row) in hash_table.rows()?.enumerate() {
            self.monitor.check_canceled()?;
            let row = row?;
            if self.monitor.is_memory_low(partitions.in_memory_bytes())
                && partitions.flush_next_bucket()?
            {
                result.low_memory()?;
                self.monitor.memory_relieved();
            }
            match hash_settings.join_tuple(&row)? {
                None => {
                    result.add_unmatched(hash_side, &row, offset as u64)?;
                }
                Some(tuple) => {
                    partitions.add_hash(tuple, row, offset as u64)?;
                    indexed += 1;
                }
            }
        }
        result.sorted_chunk_end()?;
        metrics.add_hash_rows_indexed(indexed);
        info!(
            target: "tablejoin::hybrid",
            phase = "index",
            rows = indexed,
            partitions = partitions.num_partitions(),
            on_disk = partitions.partitions_on_disk(),
            "hash side indexed"
        );
        self.monitor.set_progress_and_check_canceled(1.0 / 3.0)?;

        // Phase 2: probe resident partitions, queue the rest on disk.
        self.monitor.enter(JoinState::Probing);
        self.monitor.set_message("probing");
        let probe_settings = self.spec.settings(probe_side);
        for (offset, row) in probe_table.rows()?.enumerate() {
            self.monitor.check_canceled()?;
            let row = row?;
            match probe_settings.join_tuple(&row)? {
                None => {
                    result.add_unmatched(probe_side, &row, offset as u64)?;
                }
                Some(tuple) => partitions.process_probe(&tuple, row, offset as u64, result)?,
            }
        }
        result.sorted_chunk_end()?;
        partitions.drain_in_memory_unmatched(result)?;
        let snapshot = metrics.snapshot();
        info!(
            target: "tablejoin::hybrid",
            phase = "probe",
            in_memory = snapshot.probe_rows_in_memory,
            from_disk = snapshot.probe_rows_from_disk,
            "probe side streamed"
        );
        self.monitor.set_progress_and_check_canceled(2.0 / 3.0)?;

        // Phase 3: join the disk partitions.
        if let Some(disk) = partitions.into_disk_partitions()? {
            self.join_disk_partitions(&disk, result)?;
        }
        self.monitor.set_progress_and_check_canceled(1.0)
    }

    fn join_disk_partitions(&mut self, disk: &DiskPartitions, result: &mut dyn JoinResult) -> Result<()> {
        let hash_sizes = disk.partitions.iter().map(DiskPartition::hash_rows).collect();
        let probe_sizes = disk.partitions.iter().map(DiskPartition::probe_rows).collect();
        self.monitor.metrics().set_bucket_sizes(hash_sizes, probe_sizes);
        info!(
            target: "tablejoin::hybrid",
            phase = "disk",
            partitions = disk.partitions.len(),
            spilled_bytes = disk.manager.bytes_written(),
            "joining disk partitions"
        );
        let total = disk.partitions.len().max(1) as f64;
        for (done, part) in disk.partitions.iter().enumerate() {
            self.monitor
                .set_progress_and_check_canceled((2.0 + done as f64 / total) / 3.0)?;
            debug!(
                target: "tablejoin::hybrid",
                partition = part.partition,
                hash_rows = part.hash_rows(),
                probe_rows = part.probe_rows(),
                "joining disk partition"
            );
            self.join_bucket_pair(&disk.manager, part.hash.as_ref(), part.probe.as_ref(), 0, result)?;
        }
        Ok(())
    }

    fn join_bucket_pair(
        &mut self,
        manager: &SpillManager,
        hash: Option<&DiskTable>,
        probe: Option<&DiskTable>,
        level: u32,
        result: &mut dyn JoinResult,
    ) -> Result<()> {
        let probe_rows = probe.map_or(0, Table::row_count);
        let Some(hash) = hash.filter(|t| t.row_count() > 0) else {
            if let Some(probe) = probe {
                self.report_probe_unmatched(probe, result)?;
            }
            return Ok(());
        };
        if probe_rows == 0 && !result.is_retain_unmatched(self.hash_side) {
            return Ok(());
        }

        let empty;
        let probe: &dyn Table = match probe {
            Some(probe) => probe,
            None => {
                empty = InMemoryTable::empty(tagged_spec(self.spec.settings(self.probe_side()).spec()));
                &empty
            }
        };

        if hash.bytes() <= self.monitor.budget_bytes() {
            self.join_in_memory(hash, probe, result)
        } else if level < self.config.max_repartition_depth && self.config.num_partitions() >= 2 {
            self.repartition(manager, hash, probe, level + 1, result)
        } else {
            warn!(
                target: "tablejoin::hybrid",
                level,
                hash_rows = hash.row_count(),
                hash_bytes = hash.bytes(),
                budget_bytes = self.monitor.budget_bytes(),
                "partition still too large, falling back to block nested loop"
            );
            self.monitor.metrics().inc_nested_loop_fallbacks();
            self.monitor.enter(JoinState::ProbingFromDisk);
            BlockNestedLoop::new(
                &self.spec,
                self.hash_side,
                self.monitor.budget_bytes(),
                true,
                self.monitor.cancel_checker(),
            )
            .join(hash, probe, result)
            .map(|_| ())
        }
    }

    fn report_probe_unmatched(&mut self, probe: &DiskTable, result: &mut dyn JoinResult) -> Result<()> {
        if !result.is_retain_unmatched(self.probe_side()) {
            return Ok(());
        }
        self.monitor.enter(JoinState::ProbingFromDisk);
        for row in probe.rows()? {
            self.monitor.check_canceled()?;
            let (row, offset) = untag_row(row?)?;
            result.add_unmatched(self.probe_side(), &row, offset)?;
        }
        result.sorted_chunk_end()?;
        Ok(())
    }

    fn join_in_memory(
        &mut self,
        hash: &DiskTable,
        probe: &dyn Table,
        result: &mut dyn JoinResult,
    ) -> Result<()> {
        self.monitor.enter(JoinState::ProbingFromDisk);
        let hash_side = self.hash_side;
        let mut index = HashIndex::new(
            Arc::clone(&self.spec),
            hash_side,
            TOP_LEVEL_SEED,
            result.is_retain_unmatched(hash_side),
            self.monitor.cancel_checker(),
        );
        let hash_settings = self.spec.settings(hash_side);
        for row in hash.rows()? {
            self.monitor.check_canceled()?;
            let (row, offset) = untag_row(row?)?;
            let tuple = hash_settings.join_tuple(&row)?;
            index.add_hash_row(tuple, row, offset, result)?;
        }
        self.monitor.metrics().add_hash_rows_indexed(index.num_added_rows());

        for row in probe.rows()? {
            self.monitor.check_canceled()?;
            let (row, offset) = untag_row(row?)?;
            index.join_single_row(&row, offset, result)?;
        }
        result.sorted_chunk_end()?;
        index.for_unmatched_hash_rows(|row, offset| {
            result.add_unmatched(hash_side, row, offset).map(|_| ())
        })?;
        result.sorted_chunk_end()?;
        Ok(())
    }

    fn repartition(
        &mut self,
        manager: &SpillManager,
        hash: &DiskTable,
        probe: &dyn Table,
        level: u32,
        result: &mut dyn JoinResult,
    ) -> Result<()> {
        self.monitor.enter(JoinState::SpillingToDisk);
        self.monitor.metrics().inc_repartitions();
        let fan_out = self.config.num_partitions();
        let seed = u64::from(level);
        let mode = self.spec.comparison_mode();

        let split = |table: &dyn Table,
                     side: InputTable,
                     monitor: &mut JoinProgressMonitor|
         -> Result<Vec<Option<DiskTable>>> {
            let settings = self.spec.settings(side);
            let mut buckets = Buckets::new(side, fan_out);
            for row in table.rows()? {
                monitor.check_canceled()?;
                let row = row?;
                // The offset tag trails the declared columns; tuples read
                // the declared columns only.
                let partition = settings.join_tuple(&row)?.map_or(0, |tuple| {
                    (mode.hash_tuple(&tuple, seed) % fan_out as u64) as usize
                });
                buckets.push_tagged(manager, &self.spec, partition, &row)?;
            }
            buckets.finish()
        };
        let hash_parts = split(hash, self.hash_side, self.monitor)?;
        let probe_parts = split(probe, self.probe_side(), self.monitor)?;
        debug!(
            target: "tablejoin::hybrid",
            level,
            fan_out,
            hash_rows = hash.row_count(),
            probe_rows = probe.row_count(),
            "repartitioned skewed partition"
        );

        for (sub_hash, sub_probe) in hash_parts.iter().zip(&probe_parts) {
            self.join_bucket_pair(manager, sub_hash.as_ref(), sub_probe.as_ref(), level, result)?;
        }
        Ok(())
    }
}
