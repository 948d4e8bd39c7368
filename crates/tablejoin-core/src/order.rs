//! Row offset tagging and ordered merging.
//!
//! Spilled rows carry their source offset as a trailing `Long` cell so that
//! the order of a non-partitioned join can be restored after a disk round
//! trip. Matched pairs are ordered by a 64-bit key combining both offsets.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tablejoin_error::{JoinError, Result};
use tablejoin_types::{ColumnSpec, DataType, Row, TableSpec, Value};

/// Name of the column appended by [`tag_row`].
pub const OFFSET_COLUMN_NAME: &str = "$offset$";

/// Largest row offset that fits one half of a combined key.
pub const MAX_ROW_OFFSET: u64 = u32::MAX as u64;

/// Combine two row offsets into one sortable key, `high` in the upper 32 bits.
#[must_use]
pub const fn combined_offsets(high: u64, low: u64) -> u64 {
    (high << 32) | (low & MAX_ROW_OFFSET)
}

/// Inverse of [`combined_offsets`].
#[must_use]
pub const fn split_offsets(combined: u64) -> (u64, u64) {
    (combined >> 32, combined & MAX_ROW_OFFSET)
}

/// Append `offset` as a trailing cell.
#[must_use]
pub fn tag_row(row: Row, offset: u64) -> Row {
    let (key, mut cells) = row.into_parts();
    cells.push(Value::Long(offset as i64));
    Row::new(key, cells)
}

/// Remove the trailing offset cell added by [`tag_row`].
///
/// # Errors
///
/// Returns [`JoinError::SpillCorrupt`] if the last cell is not an offset.
pub fn untag_row(row: Row) -> Result<(Row, u64)> {
    let (key, mut cells) = row.into_parts();
    match cells.pop() {
        Some(Value::Long(offset)) if offset >= 0 => Ok((Row::new(key, cells), offset as u64)),
        other => Err(JoinError::spill_corrupt(format!(
            "row '{key}' has no offset tag, last cell is {other:?}"
        ))),
    }
}

/// `spec` with the offset column appended.
#[must_use]
pub fn tagged_spec(spec: &TableSpec) -> TableSpec {
    spec.with_appended(ColumnSpec::new(OFFSET_COLUMN_NAME, DataType::Long))
}

/// Streaming k-way merge of runs that are each sorted by key.
///
/// Items with equal keys keep the order of their runs. Runs are assumed to be
/// sorted already; see [`sort_run`]. Only the head item of every run is held
/// at a time, so runs may be cursors over disk tables. The first error of any
/// run is yielded and ends the merge.
pub struct SortedRunMerge<T, I> {
    runs: Vec<I>,
    heads: Vec<Option<T>>,
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    primed: bool,
    failed: bool,
}

impl<T, I> SortedRunMerge<T, I>
where
    I: Iterator<Item = Result<(u64, T)>>,
{
    #[must_use]
    pub fn new(runs: Vec<I>) -> Self {
        let heads = runs.iter().map(|_| None).collect();
        let heap = BinaryHeap::with_capacity(runs.len());
        Self {
            runs,
            heads,
            heap,
            primed: false,
            failed: false,
        }
    }

    fn advance(&mut self, run: usize) -> Result<()> {
        if let Some(next) = self.runs[run].next() {
            let (key, item) = next?;
            self.heap.push(Reverse((key, run)));
            self.heads[run] = Some(item);
        }
        Ok(())
    }

    fn prime(&mut self) -> Result<()> {
        self.primed = true;
        (0..self.runs.len()).try_for_each(|run| self.advance(run))
    }
}

impl<T, I> Iterator for SortedRunMerge<T, I>
where
    I: Iterator<Item = Result<(u64, T)>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            if let Err(e) = self.prime() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        let Reverse((_, run)) = self.heap.pop()?;
        let item = self.heads[run].take();
        if let Err(e) = self.advance(run) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(item.ok_or_else(|| JoinError::internal(format!("merge run {run} lost its head item"))))
    }
}

/// Merge in-memory runs that are each sorted by key.
#[must_use]
pub fn merge_sorted_runs<T>(runs: Vec<Vec<(u64, T)>>) -> Vec<T> {
    let runs = runs.into_iter().map(|run| run.into_iter().map(Ok::<_, JoinError>)).collect();
    SortedRunMerge::new(runs).flatten().collect()
}

/// Stable sort of one run by key.
pub fn sort_run<T>(run: &mut [(u64, T)]) {
    run.sort_by_key(|(key, _)| *key);
}
