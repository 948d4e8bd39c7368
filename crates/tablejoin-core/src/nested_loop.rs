//! Block nested loop join.
//!
//! The hash side is read in blocks that fit the memory budget; each block is
//! compared against a full scan of the probe side. Used when forced by
//! configuration and for disk partitions too skewed to split any further.

use tablejoin_error::Result;
use tablejoin_types::{CancelChecker, InputTable, Row, Table};

use crate::bitmap::MatchBitmap;
use crate::comparison::JoinTuple;
use crate::order::untag_row;
use crate::results::JoinResult;
use crate::specification::JoinSpecification;

#[derive(Debug)]
pub(crate) struct BlockNestedLoop<'a> {
    spec: &'a JoinSpecification,
    hash_side: InputTable,
    budget_bytes: u64,
    /// Rows carry their source offset as a trailing cell.
    tagged: bool,
    cancel: CancelChecker,
}

impl<'a> BlockNestedLoop<'a> {
    pub(crate) const fn new(
        spec: &'a JoinSpecification,
        hash_side: InputTable,
        budget_bytes: u64,
        tagged: bool,
        cancel: CancelChecker,
    ) -> Self {
        Self {
            spec,
            hash_side,
            budget_bytes,
            tagged,
            cancel,
        }
    }

    fn source_row(&self, row: Row, position: usize) -> Result<(Row, u64)> {
        if self.tagged {
            untag_row(row)
        } else {
            Ok((row, position as u64))
        }
    }

    /// Join `hash` against `probe`. Returns the number of hash blocks.
    pub(crate) fn join(
        &mut self,
        hash: &dyn Table,
        probe: &dyn Table,
        result: &mut dyn JoinResult,
    ) -> Result<usize> {
        let hash_side = self.hash_side;
        let probe_side = hash_side.other();
        let hash_settings = self.spec.settings(hash_side);
        let probe_settings = self.spec.settings(probe_side);
        let mode = self.spec.comparison_mode();
        let report_hash_unmatched = result.is_retain_unmatched(hash_side);

        let mut probe_matched = MatchBitmap::with_len(probe.row_count() as usize);
        let mut hash_rows = hash.rows()?.enumerate();
        let mut blocks = 0;
        loop {
            let mut block: Vec<(JoinTuple, Row, u64)> = Vec::new();
            let mut bytes = 0_u64;
            while block.is_empty() || bytes < self.budget_bytes {
                let Some((position, row)) = hash_rows.next() else {
                    break;
                };
                self.cancel.check()?;
                let (row, offset) = self.source_row(row?, position)?;
                match hash_settings.join_tuple(&row)? {
                    None => {
                        result.add_unmatched(hash_side, &row, offset)?;
                    }
                    Some(tuple) => {
                        bytes += row.estimated_size() as u64;
                        block.push((tuple, row, offset));
                    }
                }
            }
            if block.is_empty() {
                break;
            }
            blocks += 1;

            let mut block_matched = MatchBitmap::with_len(block.len());
            for (position, row) in probe.rows()?.enumerate() {
                self.cancel.check()?;
                let (row, offset) = self.source_row(row?, position)?;
                let Some(tuple) = probe_settings.join_tuple(&row)? else {
                    continue;
                };
                for (slot, (hash_tuple, hash_row, hash_offset)) in block.iter().enumerate() {
                    if !mode.tuples_equal(hash_tuple, &tuple) {
                        continue;
                    }
                    self.cancel.check()?;
                    block_matched.set(slot);
                    probe_matched.set(position);
                    match hash_side {
                        InputTable::Left => result.add_match(hash_row, *hash_offset, &row, offset)?,
                        InputTable::Right => result.add_match(&row, offset, hash_row, *hash_offset)?,
                    };
                }
            }
            if report_hash_unmatched {
                for slot in block_matched.iter_clear() {
                    self.cancel.check()?;
                    let (_, row, offset) = &block[slot];
                    result.add_unmatched(hash_side, row, *offset)?;
                }
            }
            result.sorted_chunk_end()?;
            tracing::trace!(
                target: "tablejoin::nested_loop",
                block = blocks,
                rows = block.len(),
                bytes,
                "joined hash block"
            );
        }

        if result.is_retain_unmatched(probe_side) {
            for (position, row) in probe.rows()?.enumerate() {
                self.cancel.check()?;
                if probe_matched.get(position) {
                    continue;
                }
                let (row, offset) = self.source_row(row?, position)?;
                result.add_unmatched(probe_side, &row, offset)?;
            }
            result.sorted_chunk_end()?;
        }
        Ok(blocks)
    }
}
