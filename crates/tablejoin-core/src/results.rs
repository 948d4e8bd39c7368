//! Join result sinks.
//!
//! Join strategies report matched pairs and unmatched rows to a
//! [`JoinResult`]. The provided [`JoinContainer`] formats them into output
//! tables, optionally deduplicating matches and deferring unmatched rows
//! until every partial join of a match-any decomposition has run.
//!
//! Rows arrive in sorted chunks: within a chunk, order is arbitrary; at each
//! [`JoinResult::sorted_chunk_end`] the chunk is sorted by its order key and
//! the final output is a k-way merge over all chunks.
//!
//! Under memory pressure, or once the collected rows exceed the memory
//! budget, sorted runs are written to disk and the final merge streams over
//! disk cursors into a disk-backed output table.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tablejoin_error::{JoinError, Result};
use tablejoin_storage::{DiskTable, SpillManager};
use tablejoin_types::{
    CancelChecker, ColumnSpec, Cx, DataType, InMemoryTable, InputTable, Row, RowKey, Table, TableSpec,
    Value,
};
use tracing::debug;

use crate::bitmap::MatchBitmap;
use crate::config::JoinConfig;
use crate::order::{SortedRunMerge, combined_offsets, sort_run};
use crate::specification::{JoinSpecification, RowKeyFactory};

/// Receiver of the rows produced by a join strategy.
pub trait JoinResult {
    /// Report a matched pair. Returns whether the pair was recorded; with
    /// deduplication enabled, a pair seen before is not.
    fn add_match(&mut self, left: &Row, left_offset: u64, right: &Row, right_offset: u64)
    -> Result<bool>;

    /// Report a row of `side` that has no join partner in the current
    /// (partial) join.
    fn add_unmatched(&mut self, side: InputTable, row: &Row, offset: u64) -> Result<bool>;

    /// Rows reported since the previous call form one sortable chunk.
    fn sorted_chunk_end(&mut self) -> Result<()>;

    /// Release memory that can be recovered later, at some cost.
    fn low_memory(&mut self) -> Result<()>;

    /// Ignore matches that were already reported.
    fn enable_deduplication(&mut self);

    /// Collect unmatched rows of `side` and report only those never matched
    /// by the time [`JoinResult::drain_deferred_unmatched`] runs.
    ///
    /// # Errors
    ///
    /// Deferral cannot be switched off once on.
    fn set_defer_unmatched_rows(&mut self, side: InputTable, defer: bool) -> Result<()>;

    /// Emit the deferred unmatched rows that never found a partner.
    fn drain_deferred_unmatched(&mut self, cx: &Cx) -> Result<()>;

    fn is_retain_matched(&self) -> bool;

    fn is_retain_unmatched(&self, side: InputTable) -> bool;

    /// Mark the result as complete. Only a completed result is valid output.
    fn complete(&mut self);
}

// ── Output ─────────────────────────────────────────────────────────────────

/// Whether matches and unmatched rows share one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    /// One table in match-table layout; unmatched rows padded with missing.
    #[default]
    Combined,
    /// Separate tables for matches and each side's unmatched rows.
    Split,
}

/// How rows are ordered within each output category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResultOrder {
    /// Discovery order.
    #[default]
    Arbitrary,
    /// Matches by probe row offset, then hash row offset.
    ProbeMajor { probe: InputTable },
    /// Matches by left row offset, then right row offset.
    LeftRight,
}

impl ResultOrder {
    const fn match_key(self, left_offset: u64, right_offset: u64, sequence: u64) -> u64 {
        match self {
            Self::Arbitrary => sequence,
            Self::ProbeMajor {
                probe: InputTable::Left,
            }
            | Self::LeftRight => combined_offsets(left_offset, right_offset),
            Self::ProbeMajor {
                probe: InputTable::Right,
            } => combined_offsets(right_offset, left_offset),
        }
    }

    const fn unmatched_key(self, offset: u64, sequence: u64) -> u64 {
        match self {
            Self::Arbitrary => sequence,
            _ => offset,
        }
    }

    const fn is_arbitrary(self) -> bool {
        matches!(self, Self::Arbitrary)
    }
}

/// The input rows an output row was made from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiliteSource {
    pub left: Option<RowKey>,
    pub right: Option<RowKey>,
}

impl HiliteSource {
    #[must_use]
    pub const fn key(&self, side: InputTable) -> Option<&RowKey> {
        match side {
            InputTable::Left => self.left.as_ref(),
            InputTable::Right => self.right.as_ref(),
        }
    }
}

/// Output row key to input row keys, for selection propagation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiliteMapping {
    sources: BTreeMap<RowKey, HiliteSource>,
}

impl HiliteMapping {
    #[must_use]
    pub fn source(&self, output_key: &RowKey) -> Option<&HiliteSource> {
        self.sources.get(output_key)
    }

    /// Output rows made from `input_key` of `side`.
    #[must_use]
    pub fn output_keys(&self, side: InputTable, input_key: &RowKey) -> Vec<&RowKey> {
        self.sources
            .iter()
            .filter(|(_, source)| source.key(side) == Some(input_key))
            .map(|(output, _)| output)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &HiliteSource)> {
        self.sources.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// One finished output table, held in memory or in a spill file.
#[derive(Debug, Clone)]
pub struct OutputTable {
    pub table: Arc<dyn Table>,
    pub hilite: Option<HiliteMapping>,
    on_disk: bool,
}

impl OutputTable {
    /// Read every row in output order.
    pub fn rows(&self) -> Result<Vec<Row>> {
        self.table.rows()?.collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.row_count() as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.row_count() == 0
    }

    /// Whether the rows live in a spill file rather than in memory.
    #[must_use]
    pub const fn is_on_disk(&self) -> bool {
        self.on_disk
    }
}

/// Finished output of a join.
#[derive(Debug, Clone)]
pub enum JoinOutput {
    Combined(OutputTable),
    Split {
        matches: OutputTable,
        left_unmatched: OutputTable,
        right_unmatched: OutputTable,
    },
}

impl JoinOutput {
    #[must_use]
    pub const fn combined(&self) -> Option<&OutputTable> {
        match self {
            Self::Combined(table) => Some(table),
            Self::Split { .. } => None,
        }
    }

    #[must_use]
    pub const fn matches(&self) -> Option<&OutputTable> {
        match self {
            Self::Split { matches, .. } => Some(matches),
            Self::Combined(_) => None,
        }
    }

    #[must_use]
    pub const fn unmatched(&self, side: InputTable) -> Option<&OutputTable> {
        match (self, side) {
            (Self::Split { left_unmatched, .. }, InputTable::Left) => Some(left_unmatched),
            (Self::Split { right_unmatched, .. }, InputTable::Right) => Some(right_unmatched),
            (Self::Combined(_), _) => None,
        }
    }

    /// Every output table: the combined one, or matches then left and right
    /// unmatched.
    #[must_use]
    pub fn tables(&self) -> Vec<&OutputTable> {
        match self {
            Self::Combined(table) => vec![table],
            Self::Split {
                matches,
                left_unmatched,
                right_unmatched,
            } => vec![matches, left_unmatched, right_unmatched],
        }
    }
}

// ── Container internals ────────────────────────────────────────────────────

/// Rows an in-memory run holds at least before it is written to disk.
const MIN_SPILL_RUN_ROWS: usize = 1024;
/// Share of the memory budget one in-memory run may use while spilling.
const RUN_BUDGET_DIVISOR: u64 = 4;
/// Bookkeeping cells stored ahead of the output cells in a spilled run:
/// order key, sequence, left row key, right row key.
const RUN_HEADER_CELLS: usize = 4;

#[derive(Debug, Clone)]
struct OutputEntry {
    sequence: u64,
    cells: Vec<Value>,
    left: Option<RowKey>,
    right: Option<RowKey>,
}

impl OutputEntry {
    fn estimated_bytes(&self) -> u64 {
        let keys: usize = [&self.left, &self.right]
            .into_iter()
            .flatten()
            .map(|key| key.as_str().len())
            .sum();
        let cells: usize = self.cells.iter().map(Value::estimated_size).sum();
        (mem::size_of::<(u64, Self)>() + keys + cells) as u64
    }

    fn into_run_row(self, key: u64) -> Row {
        let row_key = |key: Option<RowKey>| key.map_or(Value::Missing, |k| Value::Text(k.into_string()));
        let mut cells = Vec::with_capacity(RUN_HEADER_CELLS + self.cells.len());
        cells.push(Value::Long(key as i64));
        cells.push(Value::Long(self.sequence as i64));
        cells.push(row_key(self.left));
        cells.push(row_key(self.right));
        cells.extend(self.cells);
        Row::new(RowKey::new(String::new()), cells)
    }

    fn from_run_row(row: Row) -> Result<(u64, Self)> {
        let (_, mut header) = row.into_parts();
        if header.len() < RUN_HEADER_CELLS {
            return Err(JoinError::spill_corrupt(format!(
                "output run row has {} cells, expected at least {RUN_HEADER_CELLS}",
                header.len()
            )));
        }
        let cells = header.split_off(RUN_HEADER_CELLS);
        let mut header = header.into_iter();
        let mut long = |field: &str| match header.next() {
            Some(Value::Long(v)) => Ok(v as u64),
            other => Err(JoinError::spill_corrupt(format!("output run {field} is {other:?}"))),
        };
        let key = long("order key")?;
        let sequence = long("sequence")?;
        let mut row_key = |field: &str| match header.next() {
            Some(Value::Missing) => Ok(None),
            Some(Value::Text(k)) => Ok(Some(RowKey::new(k))),
            other => Err(JoinError::spill_corrupt(format!("output run {field} is {other:?}"))),
        };
        let left = row_key("left row key")?;
        let right = row_key("right row key")?;
        Ok((
            key,
            Self {
                sequence,
                cells,
                left,
                right,
            },
        ))
    }
}

/// Layout of a spilled run: bookkeeping columns, then the output columns.
fn run_spec(output: &TableSpec) -> TableSpec {
    let header = [
        ("$order$", DataType::Long),
        ("$sequence$", DataType::Long),
        ("$left$", DataType::Text),
        ("$right$", DataType::Text),
    ]
    .map(|(name, data_type)| ColumnSpec::new(name, data_type));
    TableSpec::new(header.into_iter().chain(output.columns().iter().cloned()).collect())
}

/// Order key of a spilled run row, read without decoding the entry.
fn run_row_key(row: &Row) -> Result<u64> {
    match row.cells().first() {
        Some(Value::Long(key)) => Ok(*key as u64),
        other => Err(JoinError::spill_corrupt(format!("output run order key is {other:?}"))),
    }
}

type EntryCursor<'a> = Box<dyn Iterator<Item = Result<(u64, OutputEntry)>> + 'a>;

/// Cursors over the runs of one category, disk runs first since they hold
/// the earlier rows.
fn entry_cursors(memory: Vec<Vec<(u64, OutputEntry)>>, disk: &[DiskTable]) -> Result<Vec<EntryCursor<'_>>> {
    let mut cursors: Vec<EntryCursor<'_>> = Vec::with_capacity(disk.len() + memory.len());
    for table in disk {
        cursors.push(Box::new(
            table.rows()?.map(|row| row.and_then(OutputEntry::from_run_row)),
        ));
    }
    for run in memory {
        cursors.push(Box::new(run.into_iter().map(Ok::<_, JoinError>)));
    }
    Ok(cursors)
}

/// Where and when output runs go to disk.
#[derive(Debug)]
struct OutputSpill {
    dir: Option<PathBuf>,
    max_open_files: usize,
    budget_bytes: u64,
    manager: Option<SpillManager>,
    active: bool,
}

impl OutputSpill {
    fn new(config: &JoinConfig) -> Self {
        Self {
            dir: config.spill_dir.clone(),
            max_open_files: config.max_open_files,
            budget_bytes: config.memory_budget_bytes(),
            manager: None,
            active: false,
        }
    }

    fn manager(&mut self) -> Result<&SpillManager> {
        if self.manager.is_none() {
            self.manager = Some(SpillManager::new(self.dir.as_deref(), self.max_open_files)?);
        }
        self.manager
            .as_ref()
            .ok_or_else(|| JoinError::internal("output spill directory was not created"))
    }

    fn run_budget_bytes(&self) -> u64 {
        self.budget_bytes / RUN_BUDGET_DIVISOR
    }

    /// Disk runs merged at once, leaving one file for the merged run.
    fn fan_in(&self) -> usize {
        self.max_open_files.saturating_sub(1).max(2)
    }
}

/// One output category: sorted runs on disk, finished sorted chunks in
/// memory, plus the open chunk.
#[derive(Debug)]
struct SortedChunks {
    spec: TableSpec,
    spilled: Vec<DiskTable>,
    finished: Vec<Vec<(u64, OutputEntry)>>,
    current: Vec<(u64, OutputEntry)>,
    current_bytes: u64,
    held_bytes: u64,
    rows: usize,
}

impl SortedChunks {
    const fn new(spec: TableSpec) -> Self {
        Self {
            spec,
            spilled: Vec::new(),
            finished: Vec::new(),
            current: Vec::new(),
            current_bytes: 0,
            held_bytes: 0,
            rows: 0,
        }
    }

    fn push(&mut self, key: u64, entry: OutputEntry) {
        let bytes = entry.estimated_bytes();
        self.current_bytes += bytes;
        self.held_bytes += bytes;
        self.rows += 1;
        self.current.push((key, entry));
    }

    const fn is_empty(&self) -> bool {
        self.rows == 0
    }

    fn end_chunk(&mut self) {
        if !self.current.is_empty() {
            let mut chunk = mem::take(&mut self.current);
            self.current_bytes = 0;
            sort_run(&mut chunk);
            self.finished.push(chunk);
        }
    }

    /// Write every in-memory run to disk, merging disk runs once there are
    /// more than one merge can read at a time.
    fn spill(&mut self, spill: &mut OutputSpill) -> Result<()> {
        self.end_chunk();
        for run in mem::take(&mut self.finished) {
            let mut writer = spill.manager()?.create_writer(run_spec(&self.spec), "output-run-")?;
            for (key, entry) in run {
                writer.push(&entry.into_run_row(key))?;
            }
            self.spilled.push(writer.finish()?);
        }
        self.held_bytes = 0;
        if self.spilled.len() >= spill.fan_in() {
            self.compact(spill)?;
        }
        Ok(())
    }

    /// Merge all disk runs into one.
    fn compact(&mut self, spill: &mut OutputSpill) -> Result<()> {
        let runs = mem::take(&mut self.spilled);
        let mut writer = spill.manager()?.create_writer(run_spec(&self.spec), "output-merged-")?;
        let mut cursors = Vec::with_capacity(runs.len());
        for run in &runs {
            cursors.push(run.rows()?.map(|row| -> Result<(u64, Row)> {
                let row = row?;
                Ok((run_row_key(&row)?, row))
            }));
        }
        for row in SortedRunMerge::new(cursors) {
            writer.push(&row?)?;
        }
        let merged = writer.finish()?;
        debug!(
            target: "tablejoin::results",
            runs = runs.len(),
            rows = merged.row_count(),
            bytes = merged.bytes(),
            "merged output runs"
        );
        self.spilled.push(merged);
        Ok(())
    }

    fn into_runs(mut self) -> (Vec<Vec<(u64, OutputEntry)>>, Vec<DiskTable>) {
        self.end_chunk();
        (self.finished, self.spilled)
    }
}

#[derive(Debug)]
enum UnmatchedRows {
    Immediate,
    Deferred {
        /// Offsets reported unmatched by at least one partial join.
        candidates: BTreeSet<u64>,
        /// Candidate rows, dropped under memory pressure.
        rows: BTreeMap<u64, Row>,
        matched: MatchBitmap,
        low_memory: bool,
    },
}

impl UnmatchedRows {
    fn deferred() -> Self {
        Self::Deferred {
            candidates: BTreeSet::new(),
            rows: BTreeMap::new(),
            matched: MatchBitmap::new(),
            low_memory: false,
        }
    }

    const fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}

const MATCHES: usize = 0;

const fn unmatched_category(side: InputTable) -> usize {
    1 + side.index()
}

// ── Container ──────────────────────────────────────────────────────────────

/// Collects join output and turns it into [`JoinOutput`].
#[derive(Debug)]
pub struct JoinContainer {
    spec: Arc<JoinSpecification>,
    format: OutputFormat,
    order: ResultOrder,
    hiliting: bool,
    deduplicate: bool,
    seen_matches: HashSet<u64>,
    seen_unmatched: [HashSet<u64>; 2],
    unmatched: [UnmatchedRows; 2],
    categories: [SortedChunks; 3],
    spill: OutputSpill,
    sequence: u64,
    complete: bool,
}

impl JoinContainer {
    #[must_use]
    pub fn new(spec: Arc<JoinSpecification>, format: OutputFormat, order: ResultOrder) -> Self {
        let category_spec = |side: InputTable| match format {
            OutputFormat::Combined => spec.match_table_spec().clone(),
            OutputFormat::Split => spec.unmatched_table_spec(side).clone(),
        };
        let categories = [
            SortedChunks::new(spec.match_table_spec().clone()),
            SortedChunks::new(category_spec(InputTable::Left)),
            SortedChunks::new(category_spec(InputTable::Right)),
        ];
        Self {
            spec,
            format,
            order,
            hiliting: false,
            deduplicate: false,
            seen_matches: HashSet::new(),
            seen_unmatched: [HashSet::new(), HashSet::new()],
            unmatched: [UnmatchedRows::Immediate, UnmatchedRows::Immediate],
            categories,
            spill: OutputSpill::new(&JoinConfig::default()),
            sequence: 0,
            complete: false,
        }
    }

    /// Spill directory, file budget and memory budget for output runs.
    #[must_use]
    pub fn with_spill_settings(mut self, config: &JoinConfig) -> Self {
        self.spill = OutputSpill::new(config);
        self
    }

    /// Record the input row keys of every output row.
    #[must_use]
    pub const fn with_hiliting(mut self, enabled: bool) -> Self {
        self.hiliting = enabled;
        self
    }

    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    #[must_use]
    pub const fn order(&self) -> ResultOrder {
        self.order
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Rows recorded so far, per category: matches, left, right unmatched.
    #[must_use]
    pub fn row_counts(&self) -> [usize; 3] {
        self.categories.each_ref().map(|c| c.rows)
    }

    /// Whether output runs are being written to disk.
    #[must_use]
    pub const fn is_spilling(&self) -> bool {
        self.spill.active
    }

    fn record(&mut self, category: usize, key: u64, entry: OutputEntry) -> Result<()> {
        self.categories[category].push(key, entry);
        if self.spill.active {
            let chunks = &mut self.categories[category];
            if chunks.current.len() >= MIN_SPILL_RUN_ROWS
                && chunks.current_bytes >= self.spill.run_budget_bytes()
            {
                chunks.spill(&mut self.spill)?;
            }
        } else if self.categories.iter().map(|c| c.held_bytes).sum::<u64>() > self.spill.budget_bytes {
            self.start_spilling("output exceeds the memory budget")?;
        }
        Ok(())
    }

    fn start_spilling(&mut self, reason: &str) -> Result<()> {
        if self.spill.active {
            return Ok(());
        }
        self.spill.active = true;
        debug!(
            target: "tablejoin::results",
            reason,
            rows = self.categories.iter().map(|c| c.rows).sum::<usize>(),
            "writing output runs to disk"
        );
        for category in &mut self.categories {
            category.spill(&mut self.spill)?;
        }
        Ok(())
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    fn unmatched_cells(&self, side: InputTable, row: &Row) -> Vec<Value> {
        match (self.format, side) {
            (OutputFormat::Split, _) => self.spec.row_project_outer(side, row),
            (OutputFormat::Combined, InputTable::Left) => self.spec.left_to_single_table_format(row),
            (OutputFormat::Combined, InputTable::Right) => self.spec.right_to_single_table_format(row),
        }
    }

    fn push_unmatched(&mut self, side: InputTable, row: &Row, offset: u64) -> Result<()> {
        let sequence = self.next_sequence();
        let key = row.key().clone();
        let (left, right) = match side {
            InputTable::Left => (Some(key), None),
            InputTable::Right => (None, Some(key)),
        };
        let entry = OutputEntry {
            sequence,
            cells: self.unmatched_cells(side, row),
            left,
            right,
        };
        let order_key = self.order.unmatched_key(offset, sequence);
        self.record(unmatched_category(side), order_key, entry)
    }

    /// Build the output tables.
    ///
    /// Once output runs were spilled, the tables are written to disk as
    /// well; the spill directory then lives as long as the output.
    ///
    /// # Errors
    ///
    /// Fails unless the join marked this result complete; a cancelled or
    /// failed join leaves only a partial result behind. Spill I/O errors
    /// while merging runs are returned as well.
    pub fn finish(self) -> Result<JoinOutput> {
        if !self.complete {
            return Err(JoinError::internal(
                "join did not complete; the partial result is not valid output",
            ));
        }
        let Self {
            spec,
            format,
            order,
            hiliting,
            categories,
            mut spill,
            ..
        } = self;
        let [(matches, matches_disk), (left, left_disk), (right, right_disk)] =
            categories.map(SortedChunks::into_runs);
        let factory = spec.row_key_factory();

        let output = match format {
            OutputFormat::Combined => {
                let mut matches = entry_cursors(matches, &matches_disk)?;
                let left = entry_cursors(left, &left_disk)?;
                let right = entry_cursors(right, &right_disk)?;
                let table = if order.is_arbitrary() {
                    // Order keys are sequence numbers: one merge restores
                    // discovery order across categories.
                    matches.extend(left);
                    matches.extend(right);
                    let entries = SortedRunMerge::new(matches);
                    build_table(spec.match_table_spec(), entries, factory, hiliting, &mut spill)?
                } else {
                    let entries = SortedRunMerge::new(matches)
                        .chain(SortedRunMerge::new(left))
                        .chain(SortedRunMerge::new(right));
                    build_table(spec.match_table_spec(), entries, factory, hiliting, &mut spill)?
                };
                JoinOutput::Combined(table)
            }
            OutputFormat::Split => JoinOutput::Split {
                matches: build_table(
                    spec.match_table_spec(),
                    SortedRunMerge::new(entry_cursors(matches, &matches_disk)?),
                    factory,
                    hiliting,
                    &mut spill,
                )?,
                left_unmatched: build_table(
                    spec.unmatched_table_spec(InputTable::Left),
                    SortedRunMerge::new(entry_cursors(left, &left_disk)?),
                    factory,
                    hiliting,
                    &mut spill,
                )?,
                right_unmatched: build_table(
                    spec.unmatched_table_spec(InputTable::Right),
                    SortedRunMerge::new(entry_cursors(right, &right_disk)?),
                    factory,
                    hiliting,
                    &mut spill,
                )?,
            },
        };
        debug!(
            target: "tablejoin::results",
            format = ?format,
            order = ?order,
            on_disk = spill.active,
            "join output built"
        );
        Ok(output)
    }
}

fn build_table(
    spec: &TableSpec,
    entries: impl Iterator<Item = Result<OutputEntry>>,
    factory: &RowKeyFactory,
    hiliting: bool,
    spill: &mut OutputSpill,
) -> Result<OutputTable> {
    let mut hilite = hiliting.then(HiliteMapping::default);
    let mut writer = if spill.active {
        Some(spill.manager()?.create_writer(spec.clone(), "output-table-")?)
    } else {
        None
    };
    let mut rows = Vec::new();
    for (position, entry) in entries.enumerate() {
        let entry = entry?;
        let key = factory.create(entry.left.as_ref(), entry.right.as_ref(), position as u64);
        if let Some(mapping) = hilite.as_mut() {
            mapping.sources.insert(
                key.clone(),
                HiliteSource {
                    left: entry.left,
                    right: entry.right,
                },
            );
        }
        let row = Row::new(key, entry.cells);
        match writer.as_mut() {
            Some(writer) => writer.push(&row)?,
            None => rows.push(row),
        }
    }
    let table: Arc<dyn Table> = match writer {
        Some(writer) => Arc::new(writer.finish()?),
        None => Arc::new(InMemoryTable::new(spec.clone(), rows)),
    };
    Ok(OutputTable {
        table,
        hilite,
        on_disk: spill.active,
    })
}

impl JoinResult for JoinContainer {
    fn add_match(
        &mut self,
        left: &Row,
        left_offset: u64,
        right: &Row,
        right_offset: u64,
    ) -> Result<bool> {
        if self.deduplicate && !self.seen_matches.insert(combined_offsets(left_offset, right_offset)) {
            return Ok(false);
        }
        for (side, offset) in [(InputTable::Left, left_offset), (InputTable::Right, right_offset)] {
            if let UnmatchedRows::Deferred { matched, .. } = &mut self.unmatched[side.index()] {
                matched.set(offset as usize);
            }
        }
        if !self.spec.is_retain_matched() {
            return Ok(false);
        }
        let sequence = self.next_sequence();
        let entry = OutputEntry {
            sequence,
            cells: self.spec.match_cells(left, right),
            left: Some(left.key().clone()),
            right: Some(right.key().clone()),
        };
        let key = self.order.match_key(left_offset, right_offset, sequence);
        self.record(MATCHES, key, entry)?;
        Ok(true)
    }

    fn add_unmatched(&mut self, side: InputTable, row: &Row, offset: u64) -> Result<bool> {
        if !self.spec.is_retain_unmatched(side) {
            return Ok(false);
        }
        if let UnmatchedRows::Deferred {
            candidates,
            rows,
            low_memory,
            ..
        } = &mut self.unmatched[side.index()]
        {
            let added = candidates.insert(offset);
            if added && !*low_memory {
                rows.insert(offset, row.clone());
            }
            return Ok(added);
        }
        if self.deduplicate && !self.seen_unmatched[side.index()].insert(offset) {
            return Ok(false);
        }
        self.push_unmatched(side, row, offset)?;
        Ok(true)
    }

    fn sorted_chunk_end(&mut self) -> Result<()> {
        for category in &mut self.categories {
            if self.spill.active {
                category.spill(&mut self.spill)?;
            } else {
                category.end_chunk();
            }
        }
        Ok(())
    }

    fn low_memory(&mut self) -> Result<()> {
        for unmatched in &mut self.unmatched {
            if let UnmatchedRows::Deferred { rows, low_memory, .. } = unmatched {
                if !*low_memory {
                    debug!(
                        target: "tablejoin::results",
                        dropped = rows.len(),
                        "dropping deferred unmatched rows, keeping offsets"
                    );
                }
                *low_memory = true;
                rows.clear();
            }
        }
        self.start_spilling("low memory")
    }

    fn enable_deduplication(&mut self) {
        self.deduplicate = true;
    }

    fn set_defer_unmatched_rows(&mut self, side: InputTable, defer: bool) -> Result<()> {
        let current = &mut self.unmatched[side.index()];
        match (current.is_deferred(), defer) {
            (true, false) => Err(JoinError::invalid_settings(format!(
                "unmatched {side} rows are already deferred; deferral cannot be switched off"
            ))),
            (false, true) => {
                if !self.categories[unmatched_category(side)].is_empty() {
                    return Err(JoinError::internal(format!(
                        "unmatched {side} rows were emitted before deferral was enabled"
                    )));
                }
                *current = UnmatchedRows::deferred();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn drain_deferred_unmatched(&mut self, cx: &Cx) -> Result<()> {
        let mut cancel = CancelChecker::new(cx.clone(), 1024);
        for side in InputTable::BOTH {
            let state = mem::replace(&mut self.unmatched[side.index()], UnmatchedRows::Immediate);
            let UnmatchedRows::Deferred {
                candidates,
                mut rows,
                matched,
                low_memory,
            } = state
            else {
                continue;
            };
            let pending: BTreeSet<u64> = candidates
                .into_iter()
                .filter(|&offset| !matched.get(offset as usize))
                .collect();
            debug!(
                target: "tablejoin::results",
                side = %side,
                unmatched = pending.len(),
                rescan = low_memory,
                "draining deferred unmatched rows"
            );
            if low_memory {
                // Rows were dropped; read them back from the source table.
                let table = Arc::clone(self.spec.settings(side).require_table()?);
                for (offset, row) in table.rows()?.enumerate() {
                    cancel.check()?;
                    let row = row?;
                    if pending.contains(&(offset as u64)) {
                        self.push_unmatched(side, &row, offset as u64)?;
                    }
                }
            } else {
                for offset in pending {
                    cancel.check()?;
                    let row = rows.remove(&offset).ok_or_else(|| {
                        JoinError::internal(format!("deferred {side} row {offset} was not retained"))
                    })?;
                    self.push_unmatched(side, &row, offset)?;
                }
            }
            // Keep later deferral requests consistent with what was drained.
            self.unmatched[side.index()] = UnmatchedRows::deferred();
            self.categories[unmatched_category(side)].end_chunk();
        }
        Ok(())
    }

    fn is_retain_matched(&self) -> bool {
        self.spec.is_retain_matched()
    }

    fn is_retain_unmatched(&self, side: InputTable) -> bool {
        self.spec.is_retain_unmatched(side)
    }

    fn complete(&mut self) {
        self.complete = true;
    }
}

// ── Test support ───────────────────────────────────────────────────────────

/// A sink that records every call verbatim.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingResult {
    pub matches: Vec<(RowKey, u64, RowKey, u64)>,
    pub unmatched: Vec<(InputTable, RowKey, u64)>,
    pub chunks: usize,
    pub retain_unmatched: [bool; 2],
}

#[cfg(test)]
impl RecordingResult {
    pub fn retaining_unmatched() -> Self {
        Self {
            retain_unmatched: [true, true],
            ..Self::default()
        }
    }
}

#[cfg(test)]
impl JoinResult for RecordingResult {
    fn add_match(&mut self, left: &Row, lo: u64, right: &Row, ro: u64) -> Result<bool> {
        self.matches.push((left.key().clone(), lo, right.key().clone(), ro));
        Ok(true)
    }

    fn add_unmatched(&mut self, side: InputTable, row: &Row, offset: u64) -> Result<bool> {
        self.unmatched.push((side, row.key().clone(), offset));
        Ok(true)
    }

    fn sorted_chunk_end(&mut self) -> Result<()> {
        self.chunks += 1;
        Ok(())
    }

    fn low_memory(&mut self) -> Result<()> {
        Ok(())
    }

    fn enable_deduplication(&mut self) {}

    fn set_defer_unmatched_rows(&mut self, _side: InputTable, _defer: bool) -> Result<()> {
        Ok(())
    }

    fn drain_deferred_unmatched(&mut self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    fn is_retain_matched(&self) -> bool {
        true
    }

    fn is_retain_unmatched(&self, side: InputTable) -> bool {
        self.retain_unmatched[side.index()]
    }

    fn complete(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::JoinTableSettings;
    use crate::specification::join_columns;

    fn input(side: InputTable, name: &str, rows: Vec<Row>) -> JoinTableSettings {
        let spec = TableSpec::new(vec![
            ColumnSpec::new("k", DataType::Long),
            ColumnSpec::new(name, DataType::Text),
        ]);
        JoinTableSettings::new(
            side,
            true,
            join_columns(["k"]),
            vec!["k".to_owned(), name.to_owned()],
            Arc::new(InMemoryTable::new(spec, rows)),
        )
        .expect("settings")
    }

    fn spec() -> Arc<JoinSpecification> {
        let left = input(
            InputTable::Left,
            "l",
            (0..4)
                .map(|i| Row::new(format!("L{i}"), vec![Value::Long(i), Value::from(format!("l{i}"))]))
                .collect(),
        );
        let right = input(
            InputTable::Right,
            "r",
            (0..3)
                .map(|i| Row::new(format!("R{i}"), vec![Value::Long(i), Value::from(format!("r{i}"))]))
                .collect(),
        );
        Arc::new(
            JoinSpecification::builder(left, right)
                .row_key_factory(RowKeyFactory::concatenate("_"))
                .build()
                .expect("spec"),
        )
    }

    fn row(spec: &JoinSpecification, side: InputTable, offset: usize) -> Row {
        let table = spec.settings(side).require_table().expect("table");
        table
            .rows()
            .expect("rows")
            .nth(offset)
            .expect("row")
            .expect("ok")
    }

    fn keys(table: &OutputTable) -> Vec<String> {
        table
            .rows()
            .expect("rows")
            .iter()
            .map(|r| r.key().to_string())
            .collect()
    }

    fn spill_config(dir: &std::path::Path, memory_limit_bytes: u64) -> JoinConfig {
        JoinConfig {
            max_open_files: 2,
            memory_limit_bytes,
            memory_limit_fraction: 1.0,
            spill_dir: Some(dir.to_path_buf()),
            ..JoinConfig::default()
        }
    }

    /// Every match of the small inputs, reported in three chunks.
    fn report_all(c: &mut JoinContainer, spec: &JoinSpecification) {
        let (l, r) = (InputTable::Left, InputTable::Right);
        for (chunk, lefts) in [[3, 1], [2, 0]].into_iter().enumerate() {
            for left in lefts {
                for right in (0..3).rev() {
                    c.add_match(&row(spec, l, left), left as u64, &row(spec, r, right), right as u64)
                        .expect("m");
                }
            }
            if chunk == 0 {
                c.add_unmatched(r, &row(spec, r, 1), 1).expect("u");
            }
            c.sorted_chunk_end().expect("chunk end");
        }
        c.complete();
    }

    #[test]
    fn chunks_are_merged_by_order_key() {
        let spec = spec();
        let mut c = JoinContainer::new(spec.clone(), OutputFormat::Split, ResultOrder::LeftRight);
        let (l, r) = (InputTable::Left, InputTable::Right);
        c.add_match(&row(&spec, l, 2), 2, &row(&spec, r, 1), 1).expect("m");
        c.add_match(&row(&spec, l, 0), 0, &row(&spec, r, 2), 2).expect("m");
        c.sorted_chunk_end().expect("chunk end");
        c.add_match(&row(&spec, l, 1), 1, &row(&spec, r, 0), 0).expect("m");
        c.add_unmatched(l, &row(&spec, l, 3), 3).expect("u");
        c.complete();
        let out = c.finish().expect("finish");
        assert_eq!(keys(out.matches().expect("matches")), ["L0_R2", "L1_R0", "L2_R1"]);
        let left = out.unmatched(l).expect("left");
        assert_eq!(keys(left), ["L3_?"]);
        assert_eq!(left.rows().expect("rows")[0].cells(), &[Value::Long(3), Value::from("l3")]);
        assert!(!left.is_on_disk());
    }

    #[test]
    fn combined_output_pads_and_orders_by_category() {
        let spec = spec();
        let mut c = JoinContainer::new(
            spec.clone(),
            OutputFormat::Combined,
            ResultOrder::ProbeMajor {
                probe: InputTable::Right,
            },
        )
        .with_hiliting(true);
        let (l, r) = (InputTable::Left, InputTable::Right);
        c.add_unmatched(r, &row(&spec, r, 2), 2).expect("u");
        c.add_match(&row(&spec, l, 1), 1, &row(&spec, r, 1), 1).expect("m");
        c.add_match(&row(&spec, l, 0), 0, &row(&spec, r, 1), 1).expect("m");
        c.add_unmatched(l, &row(&spec, l, 3), 3).expect("u");
        c.complete();
        let out = c.finish().expect("finish");
        let combined = out.combined().expect("combined");
        assert_eq!(keys(combined), ["L0_R1", "L1_R1", "L3_?", "?_R2"]);
        assert_eq!(
            combined.rows().expect("rows")[3].cells(),
            &[Value::Missing, Value::Missing, Value::Long(2), Value::from("r2")]
        );
        let hilite = combined.hilite.as_ref().expect("hilite");
        assert_eq!(hilite.len(), 4);
        assert_eq!(hilite.output_keys(r, &RowKey::new("R1")).len(), 2);
        assert_eq!(
            hilite.source(&RowKey::new("L3_?")).and_then(|s| s.key(l)),
            Some(&RowKey::new("L3"))
        );
    }

    #[test]
    fn arbitrary_order_keeps_discovery_order() {
        let spec = spec();
        let mut c = JoinContainer::new(spec.clone(), OutputFormat::Combined, ResultOrder::Arbitrary);
        let (l, r) = (InputTable::Left, InputTable::Right);
        c.add_unmatched(l, &row(&spec, l, 3), 3).expect("u");
        c.add_match(&row(&spec, l, 1), 1, &row(&spec, r, 1), 1).expect("m");
        c.add_unmatched(r, &row(&spec, r, 0), 0).expect("u");
        c.complete();
        let out = c.finish().expect("finish");
        assert_eq!(keys(out.combined().expect("combined")), ["L3_?", "L1_R1", "?_R0"]);
    }

    #[test]
    fn deduplication_drops_repeated_pairs() {
        let spec = spec();
        let mut c = JoinContainer::new(spec.clone(), OutputFormat::Split, ResultOrder::LeftRight);
        c.enable_deduplication();
        let (l, r) = (InputTable::Left, InputTable::Right);
        assert!(c.add_match(&row(&spec, l, 1), 1, &row(&spec, r, 1), 1).expect("m"));
        assert!(!c.add_match(&row(&spec, l, 1), 1, &row(&spec, r, 1), 1).expect("m"));
        assert!(c.add_unmatched(l, &row(&spec, l, 2), 2).expect("u"));
        assert!(!c.add_unmatched(l, &row(&spec, l, 2), 2).expect("u"));
        assert_eq!(c.row_counts(), [1, 1, 0]);
    }

    #[test]
    fn deferred_rows_matched_later_are_not_reported() {
        for low_memory in [false, true] {
            let spec = spec();
            let mut c = JoinContainer::new(spec.clone(), OutputFormat::Split, ResultOrder::LeftRight);
            let (l, r) = (InputTable::Left, InputTable::Right);
            c.set_defer_unmatched_rows(l, true).expect("defer");
            c.add_unmatched(l, &row(&spec, l, 0), 0).expect("u");
            c.add_unmatched(l, &row(&spec, l, 3), 3).expect("u");
            if low_memory {
                c.low_memory().expect("low memory");
            }
            c.add_match(&row(&spec, l, 0), 0, &row(&spec, r, 0), 0).expect("m");
            c.drain_deferred_unmatched(&Cx::new()).expect("drain");
            c.complete();
            let out = c.finish().expect("finish");
            assert_eq!(
                keys(out.unmatched(l).expect("left")),
                ["L3_?"],
                "case=low_memory_{low_memory}"
            );
        }
    }

    #[test]
    fn deferral_cannot_be_switched_off() {
        let mut c = JoinContainer::new(spec(), OutputFormat::Split, ResultOrder::Arbitrary);
        c.set_defer_unmatched_rows(InputTable::Right, false).expect("noop");
        c.set_defer_unmatched_rows(InputTable::Right, true).expect("on");
        c.set_defer_unmatched_rows(InputTable::Right, true).expect("still on");
        let err = c.set_defer_unmatched_rows(InputTable::Right, false).unwrap_err();
        assert!(err.is_configuration(), "err={err}");
    }

    #[test]
    fn incomplete_result_is_not_output() {
        let spec = spec();
        let mut c = JoinContainer::new(spec.clone(), OutputFormat::Split, ResultOrder::Arbitrary);
        c.add_unmatched(InputTable::Left, &row(&spec, InputTable::Left, 0), 0).expect("u");
        assert!(!c.is_complete());
        assert!(c.finish().is_err());
    }

    #[test]
    fn spilled_output_matches_in_memory_output() {
        let spec = spec();
        for (format, order) in [
            (OutputFormat::Split, ResultOrder::LeftRight),
            (OutputFormat::Combined, ResultOrder::ProbeMajor { probe: InputTable::Right }),
            (OutputFormat::Combined, ResultOrder::Arbitrary),
        ] {
            let mut memory = JoinContainer::new(spec.clone(), format, order).with_hiliting(true);
            report_all(&mut memory, &spec);
            let memory = memory.finish().expect("finish");

            let dir = tempfile::tempdir().expect("tempdir");
            let mut spilled = JoinContainer::new(spec.clone(), format, order)
                .with_hiliting(true)
                .with_spill_settings(&spill_config(dir.path(), u64::MAX));
            spilled.low_memory().expect("low memory");
            assert!(spilled.is_spilling());
            report_all(&mut spilled, &spec);
            let spilled = spilled.finish().expect("finish");

            let case = format!("{format:?}/{order:?}");
            for ((a, b), category) in memory.tables().into_iter().zip(spilled.tables()).zip(0..) {
                assert!(!a.is_on_disk(), "case={case} category={category}");
                assert!(b.is_on_disk(), "case={case} category={category}");
                assert_eq!(a.rows().expect("rows"), b.rows().expect("rows"), "case={case} category={category}");
                assert_eq!(a.hilite, b.hilite, "case={case} category={category}");
            }
            drop(spilled);
            assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0, "case={case}");
        }
    }

    #[test]
    fn output_over_budget_starts_spilling() {
        let spec = spec();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut c = JoinContainer::new(spec.clone(), OutputFormat::Split, ResultOrder::LeftRight)
            .with_spill_settings(&spill_config(dir.path(), 1));
        let (l, r) = (InputTable::Left, InputTable::Right);
        c.add_match(&row(&spec, l, 1), 1, &row(&spec, r, 0), 0).expect("m");
        assert!(c.is_spilling());
        c.add_match(&row(&spec, l, 0), 0, &row(&spec, r, 2), 2).expect("m");
        c.complete();
        let out = c.finish().expect("finish");
        let matches = out.matches().expect("matches");
        assert!(matches.is_on_disk());
        assert_eq!(matches.len(), 2);
        assert_eq!(keys(matches), ["L0_R2", "L1_R0"]);
    }
}
