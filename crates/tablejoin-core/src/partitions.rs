//! Hash partitions of one hybrid hash join, spilled to disk under memory
//! pressure.
//!
//! Rows are assigned to `hash(tuple) mod n` partitions. All partitions start
//! in memory as [`HashIndex`]es; when memory runs low, partitions are flushed
//! to disk in ascending order, so partitions `0..first_in_memory` live on
//! disk and the rest in memory. Spilled rows keep only join and include
//! columns and carry their source offset as a trailing cell.

use std::path::PathBuf;
use std::sync::Arc;

use tablejoin_error::{JoinError, Result};
use tablejoin_storage::{DiskTable, SpillManager, SpillWriter};
use tablejoin_types::{CancelChecker, InputTable, Row, Table, Value};

use crate::comparison::JoinTuple;
use crate::config::JoinConfig;
use crate::hash_index::HashIndex;
use crate::metrics::JoinMetrics;
use crate::order::{tag_row, tagged_spec};
use crate::results::JoinResult;
use crate::specification::JoinSpecification;

/// Hash seed of the top-level partitioning.
pub const TOP_LEVEL_SEED: u64 = 0;

/// One disk-resident partition: hash-side and probe-side buckets.
#[derive(Debug)]
pub struct DiskPartition {
    pub partition: usize,
    pub hash: Option<DiskTable>,
    pub probe: Option<DiskTable>,
}

impl DiskPartition {
    #[must_use]
    pub fn hash_rows(&self) -> u64 {
        self.hash.as_ref().map_or(0, Table::row_count)
    }

    #[must_use]
    pub fn probe_rows(&self) -> u64 {
        self.probe.as_ref().map_or(0, Table::row_count)
    }
}

/// Disk partitions left over after the in-memory phases, with the spill
/// directory that holds them.
#[derive(Debug)]
pub struct DiskPartitions {
    pub manager: Arc<SpillManager>,
    pub partitions: Vec<DiskPartition>,
}

/// Spill buckets of one side, created on first use.
#[derive(Debug)]
pub(crate) struct Buckets {
    side: InputTable,
    writers: Vec<Option<SpillWriter>>,
}

impl Buckets {
    pub(crate) fn new(side: InputTable, n: usize) -> Self {
        Self {
            side,
            writers: (0..n).map(|_| None).collect(),
        }
    }

    fn writer(
        &mut self,
        manager: &SpillManager,
        spec: &JoinSpecification,
        partition: usize,
    ) -> Result<&mut SpillWriter> {
        let slot = &mut self.writers[partition];
        if slot.is_none() {
            let label = format!("{}-{partition}-", self.side);
            *slot = Some(manager.create_writer(tagged_spec(spec.settings(self.side).spec()), &label)?);
        }
        slot.as_mut()
            .ok_or_else(|| JoinError::internal("spill writer vanished after creation"))
    }

    /// Append `row` (projected, tagged with `offset`) to bucket `partition`.
    pub(crate) fn push(
        &mut self,
        manager: &SpillManager,
        spec: &JoinSpecification,
        partition: usize,
        row: Row,
        offset: u64,
    ) -> Result<()> {
        let row = tag_row(spec.settings(self.side).project_materialized(row), offset);
        self.writer(manager, spec, partition)?.push(&row)
    }

    /// Append an already tagged row to bucket `partition`.
    pub(crate) fn push_tagged(
        &mut self,
        manager: &SpillManager,
        spec: &JoinSpecification,
        partition: usize,
        row: &Row,
    ) -> Result<()> {
        self.writer(manager, spec, partition)?.push(row)
    }

    /// Close every bucket.
    pub(crate) fn finish(self) -> Result<Vec<Option<DiskTable>>> {
        self.writers
            .into_iter()
            .map(|writer| writer.map(SpillWriter::finish).transpose())
            .collect()
    }
}

/// The partitions of one hybrid hash join.
#[derive(Debug)]
pub struct DiskBackedHashPartitions {
    spec: Arc<JoinSpecification>,
    hash_side: InputTable,
    in_memory: Vec<Option<HashIndex>>,
    first_in_memory: usize,
    /// Sum of the in-memory partitions' estimated bytes.
    in_memory_bytes: u64,
    hash_buckets: Buckets,
    probe_buckets: Buckets,
    manager: Option<Arc<SpillManager>>,
    spill_dir: Option<PathBuf>,
    max_open_files: usize,
    metrics: Arc<JoinMetrics>,
}

impl DiskBackedHashPartitions {
    /// In-memory partitions for `hash_side`, as many as the open-file
    /// budget of `config` allows. The spill directory is created on the
    /// first flush.
    #[must_use]
    pub fn new(
        spec: Arc<JoinSpecification>,
        hash_side: InputTable,
        track_matches: bool,
        config: &JoinConfig,
        metrics: Arc<JoinMetrics>,
        cancel: &CancelChecker,
    ) -> Self {
        let num_partitions = config.num_partitions();
        let in_memory = (0..num_partitions)
            .map(|_| {
                Some(HashIndex::new(
                    Arc::clone(&spec),
                    hash_side,
                    TOP_LEVEL_SEED,
                    track_matches,
                    cancel.clone(),
                ))
            })
            .collect();
        metrics.set_partitions(num_partitions);
        Self {
            spec,
            hash_side,
            in_memory,
            first_in_memory: 0,
            in_memory_bytes: 0,
            hash_buckets: Buckets::new(hash_side, num_partitions),
            probe_buckets: Buckets::new(hash_side.other(), num_partitions),
            manager: None,
            spill_dir: config.spill_dir.clone(),
            max_open_files: config.max_open_files,
            metrics,
        }
    }

    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.in_memory.len()
    }

    #[must_use]
    pub const fn partitions_on_disk(&self) -> usize {
        self.first_in_memory
    }

    #[must_use]
    pub fn is_in_memory(&self, partition: usize) -> bool {
        partition >= self.first_in_memory
    }

    #[must_use]
    pub fn partition_of(&self, hash: u64) -> usize {
        (hash % self.num_partitions() as u64) as usize
    }

    fn hash(&self, tuple: &[Value]) -> u64 {
        self.spec.comparison_mode().hash_tuple(tuple, TOP_LEVEL_SEED)
    }

    /// Estimated bytes held by in-memory partitions.
    #[must_use]
    pub const fn in_memory_bytes(&self) -> u64 {
        self.in_memory_bytes
    }

    fn manager(&mut self) -> Result<Arc<SpillManager>> {
        if let Some(manager) = &self.manager {
            return Ok(Arc::clone(manager));
        }
        let manager = Arc::new(SpillManager::new(
            self.spill_dir.as_deref(),
            self.max_open_files,
        )?);
        self.manager = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Route a hash-side row with a present tuple to its partition.
    pub fn add_hash(&mut self, tuple: JoinTuple, row: Row, offset: u64) -> Result<()> {
        let hash = self.hash(&tuple);
        let partition = self.partition_of(hash);
        if let Some(index) = self.in_memory[partition].as_mut() {
            let before = index.estimated_bytes();
            index.insert_hashed(hash, tuple, row, offset);
            self.in_memory_bytes += index.estimated_bytes() - before;
            return Ok(());
        }
        let manager = self.manager()?;
        self.hash_buckets
            .push(&manager, &self.spec, partition, row, offset)
    }

    /// Move the lowest in-memory partition to disk. Returns `false` when
    /// every partition is on disk already.
    pub fn flush_next_bucket(&mut self) -> Result<bool> {
        let partition = self.first_in_memory;
        let Some(slot) = self.in_memory.get_mut(partition) else {
            return Ok(false);
        };
        let Some(index) = slot.take() else {
            return Err(JoinError::internal(format!(
                "partition {partition} is neither in memory nor on disk"
            )));
        };
        let bytes = index.estimated_bytes();
        let rows = index.num_added_rows();
        self.first_in_memory += 1;
        self.in_memory_bytes -= bytes;
        let manager = self.manager()?;
        for (row, offset) in index.drain() {
            self.hash_buckets
                .push(&manager, &self.spec, partition, row, offset)?;
        }
        self.metrics.set_partitions_on_disk(self.first_in_memory);
        tracing::debug!(
            target: "tablejoin::partitions",
            partition,
            rows,
            bytes,
            on_disk = self.first_in_memory,
            "flushed hash partition"
        );
        Ok(true)
    }

    /// Join a probe-side row with a present tuple: in memory if its
    /// partition is resident, otherwise queue it in the partition's probe
    /// bucket.
    pub fn process_probe(
        &mut self,
        tuple: &JoinTuple,
        row: Row,
        offset: u64,
        result: &mut dyn JoinResult,
    ) -> Result<()> {
        let hash = self.hash(tuple);
        let partition = self.partition_of(hash);
        if let Some(index) = self.in_memory[partition].as_mut() {
            index.probe_hashed(hash, tuple, &row, offset, result)?;
            self.metrics.inc_probe_rows_in_memory();
            return Ok(());
        }
        let manager = self.manager()?;
        self.probe_buckets
            .push(&manager, &self.spec, partition, row, offset)?;
        self.metrics.inc_probe_rows_from_disk();
        Ok(())
    }

    /// Report the never-matched rows of every in-memory partition and drop
    /// the partitions. Each partition forms one sorted chunk.
    pub fn drain_in_memory_unmatched(&mut self, result: &mut dyn JoinResult) -> Result<()> {
        let hash_side = self.hash_side;
        for slot in &mut self.in_memory[self.first_in_memory..] {
            if let Some(mut index) = slot.take() {
                index.for_unmatched_hash_rows(|row, offset| {
                    result.add_unmatched(hash_side, row, offset).map(|_| ())
                })?;
                result.sorted_chunk_end()?;
            }
        }
        self.in_memory_bytes = 0;
        Ok(())
    }

    /// Close all spill buckets. `None` if nothing was spilled.
    pub fn into_disk_partitions(self) -> Result<Option<DiskPartitions>> {
        let Some(manager) = self.manager else {
            return Ok(None);
        };
        let hash = self.hash_buckets.finish()?;
        let probe = self.probe_buckets.finish()?;
        let partitions = hash
            .into_iter()
            .zip(probe)
            .enumerate()
            .take(self.first_in_memory)
            .map(|(partition, (hash, probe))| DiskPartition {
                partition,
                hash,
                probe,
            })
            .collect();
        self.metrics.set_spilled_bytes(manager.bytes_written());
        Ok(Some(DiskPartitions {
            manager,
            partitions,
        }))
    }
}
