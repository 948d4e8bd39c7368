//! In-memory hash index over the rows of the hash side.
//!
//! Rows are appended to a dense arena. Equal hashes are chained through a
//! `next` array in insertion order, so a probe visits every row sharing the
//! probe's join tuple, oldest first. Tuples with colliding hashes share a
//! chain and are told apart by [`ComparisonMode::tuples_equal`].

use std::sync::Arc;

use hashbrown::HashMap;
use tablejoin_error::Result;
use tablejoin_types::{CancelChecker, InputTable, Row, Value};

use crate::bitmap::MatchBitmap;
use crate::comparison::{ComparisonMode, JoinTuple};
use crate::results::JoinResult;
use crate::specification::JoinSpecification;

#[derive(Debug)]
struct IndexedRow {
    tuple: JoinTuple,
    row: Row,
    offset: u64,
}

/// Hash table from join tuple to the hash-side rows carrying it.
#[derive(Debug)]
pub struct HashIndex {
    spec: Arc<JoinSpecification>,
    hash_side: InputTable,
    mode: ComparisonMode,
    seed: u64,
    track_matches: bool,
    /// Hash to first and last arena slot of its chain.
    head: HashMap<u64, (usize, usize)>,
    next: Vec<Option<usize>>,
    rows: Vec<IndexedRow>,
    matched: MatchBitmap,
    bytes: u64,
    cancel: CancelChecker,
}

impl HashIndex {
    /// Index for `hash_side`. Matched rows are tracked only when
    /// `track_matches` is set, i.e. when unmatched hash rows are wanted.
    #[must_use]
    pub fn new(
        spec: Arc<JoinSpecification>,
        hash_side: InputTable,
        seed: u64,
        track_matches: bool,
        cancel: CancelChecker,
    ) -> Self {
        let mode = spec.comparison_mode();
        Self {
            spec,
            hash_side,
            mode,
            seed,
            track_matches,
            head: HashMap::new(),
            next: Vec::new(),
            rows: Vec::new(),
            matched: MatchBitmap::new(),
            bytes: 0,
            cancel,
        }
    }

    #[must_use]
    pub const fn hash_side(&self) -> InputTable {
        self.hash_side
    }

    #[must_use]
    pub const fn probe_side(&self) -> InputTable {
        self.hash_side.other()
    }

    /// Hash of `tuple` under this index's comparison mode and seed.
    #[must_use]
    pub fn hash(&self, tuple: &[Value]) -> u64 {
        self.mode.hash_tuple(tuple, self.seed)
    }

    /// Index `row`. A row without a tuple (missing join value) can never
    /// match and is reported unmatched right away.
    pub fn add_hash_row(
        &mut self,
        tuple: Option<JoinTuple>,
        row: Row,
        offset: u64,
        result: &mut dyn JoinResult,
    ) -> Result<()> {
        match tuple {
            None => {
                result.add_unmatched(self.hash_side, &row, offset)?;
            }
            Some(tuple) => {
                let hash = self.hash(&tuple);
                self.insert_hashed(hash, tuple, row, offset);
            }
        }
        Ok(())
    }

    /// Index `row` under a precomputed `hash`.
    pub fn insert_hashed(&mut self, hash: u64, tuple: JoinTuple, row: Row, offset: u64) {
        let slot = self.rows.len();
        self.bytes += (row.estimated_size() + tuple.iter().map(Value::estimated_size).sum::<usize>()) as u64;
        self.rows.push(IndexedRow { tuple, row, offset });
        self.next.push(None);
        if self.track_matches {
            self.matched.push_clear();
        }
        match self.head.get_mut(&hash) {
            Some((_, last)) => {
                self.next[*last] = Some(slot);
                *last = slot;
            }
            None => {
                self.head.insert(hash, (slot, slot));
            }
        }
    }

    /// Join one probe-side row against the index.
    ///
    /// # Errors
    ///
    /// Propagates row incompatibilities, sink failures and cancellation.
    pub fn join_single_row(
        &mut self,
        probe_row: &Row,
        probe_offset: u64,
        result: &mut dyn JoinResult,
    ) -> Result<bool> {
        let probe_side = self.probe_side();
        let Some(tuple) = self.spec.settings(probe_side).join_tuple(probe_row)? else {
            result.add_unmatched(probe_side, probe_row, probe_offset)?;
            return Ok(false);
        };
        let hash = self.hash(&tuple);
        self.probe_hashed(hash, &tuple, probe_row, probe_offset, result)
    }

    /// Join one probe-side row whose tuple and hash are known. Every indexed
    /// row with an equal tuple is emitted, in insertion order. Returns
    /// whether anything matched.
    pub fn probe_hashed(
        &mut self,
        hash: u64,
        tuple: &[Value],
        probe_row: &Row,
        probe_offset: u64,
        result: &mut dyn JoinResult,
    ) -> Result<bool> {
        let mut cursor = self.head.get(&hash).map(|&(first, _)| first);
        let mut matched = false;
        while let Some(slot) = cursor {
            self.cancel.check()?;
            let entry = &self.rows[slot];
            if self.mode.tuples_equal(&entry.tuple, tuple) {
                matched = true;
                if self.track_matches {
                    self.matched.set(slot);
                }
                match self.hash_side {
                    InputTable::Left => {
                        result.add_match(&entry.row, entry.offset, probe_row, probe_offset)?
                    }
                    InputTable::Right => {
                        result.add_match(probe_row, probe_offset, &entry.row, entry.offset)?
                    }
                };
            }
            cursor = self.next[slot];
        }
        if !matched {
            result.add_unmatched(self.hash_side.other(), probe_row, probe_offset)?;
        }
        Ok(matched)
    }

    /// Visit the indexed rows that were never matched, in insertion order.
    /// Does nothing unless matches are tracked.
    pub fn for_unmatched_hash_rows<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(&Row, u64) -> Result<()>,
    {
        if !self.track_matches {
            return Ok(());
        }
        for slot in self.matched.iter_clear() {
            self.cancel.check()?;
            let entry = &self.rows[slot];
            handler(&entry.row, entry.offset)?;
        }
        Ok(())
    }

    /// Rows indexed so far; rows reported unmatched on insert are excluded.
    #[must_use]
    pub fn num_added_rows(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.num_added_rows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Estimated heap bytes of the indexed rows.
    #[must_use]
    pub const fn estimated_bytes(&self) -> u64 {
        self.bytes
    }

    /// Consume the index, yielding its rows and offsets in insertion order.
    pub fn drain(self) -> impl Iterator<Item = (Row, u64)> {
        self.rows.into_iter().map(|entry| (entry.row, entry.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::RecordingResult;
    use crate::settings::JoinTableSettings;
    use crate::specification::join_columns;
    use tablejoin_types::{ColumnSpec, Cx, DataType, RowKey, TableSpec};

    fn spec(mode: ComparisonMode) -> Arc<JoinSpecification> {
        let table_spec = TableSpec::new(vec![
            ColumnSpec::new("k", DataType::Long),
            ColumnSpec::new("v", DataType::Text),
        ]);
        let side = |side| {
            JoinTableSettings::from_spec(
                side,
                true,
                join_columns(["k"]),
                vec!["v".to_owned()],
                table_spec.clone(),
            )
            .expect("settings")
        };
        Arc::new(
            JoinSpecification::builder(side(InputTable::Left), side(InputTable::Right))
                .comparison_mode(mode)
                .build()
                .expect("spec"),
        )
    }

    fn row(key: &str, k: Option<i64>) -> Row {
        Row::new(key, vec![k.into(), Value::from(key)])
    }

    fn index(hash_side: InputTable) -> (HashIndex, RecordingResult) {
        let mut sink = RecordingResult::retaining_unmatched();
        let spec = spec(ComparisonMode::Strict);
        let mut index = HashIndex::new(
            spec.clone(),
            hash_side,
            0,
            true,
            CancelChecker::new(Cx::new(), 1),
        );
        let rows = [row("H0", Some(1)), row("H1", Some(1)), row("H2", Some(2)), row("H3", None)];
        for (offset, r) in rows.into_iter().enumerate() {
            let tuple = spec.settings(hash_side).join_tuple(&r).expect("tuple");
            index.add_hash_row(tuple, r, offset as u64, &mut sink).expect("add");
        }
        (index, sink)
    }

    fn key(s: &str) -> RowKey {
        RowKey::new(s)
    }

    #[test]
    fn duplicates_are_all_visited_in_insertion_order() {
        let (mut idx, mut sink) = index(InputTable::Left);
        assert_eq!(idx.num_added_rows(), 3, "case=missing_not_indexed");
        assert_eq!(sink.unmatched, [(InputTable::Left, key("H3"), 3)]);

        assert!(idx.join_single_row(&row("P0", Some(1)), 7, &mut sink).expect("probe"));
        assert_eq!(
            sink.matches,
            [(key("H0"), 0, key("P0"), 7), (key("H1"), 1, key("P0"), 7)]
        );
    }

    #[test]
    fn identity_follows_the_hash_side() {
        let (mut idx, mut sink) = index(InputTable::Right);
        idx.join_single_row(&row("P0", Some(2)), 5, &mut sink).expect("probe");
        assert_eq!(sink.matches, [(key("P0"), 5, key("H2"), 2)]);
    }

    #[test]
    fn probe_misses_go_to_probe_unmatched() {
        let (mut idx, mut sink) = index(InputTable::Left);
        assert!(!idx.join_single_row(&row("P0", Some(9)), 0, &mut sink).expect("probe"));
        assert!(!idx.join_single_row(&row("P1", None), 1, &mut sink).expect("probe"));
        assert_eq!(
            &sink.unmatched[1..],
            [(InputTable::Right, key("P0"), 0), (InputTable::Right, key("P1"), 1)]
        );
    }

    #[test]
    fn unmatched_hash_rows_in_ascending_order() {
        let (mut idx, mut sink) = index(InputTable::Left);
        idx.join_single_row(&row("P0", Some(1)), 0, &mut sink).expect("probe");
        let mut seen = Vec::new();
        idx.for_unmatched_hash_rows(|r, offset| {
            seen.push((r.key().clone(), offset));
            Ok(())
        })
        .expect("drain");
        assert_eq!(seen, [(key("H2"), 2)]);
    }

    #[test]
    fn untracked_index_reports_nothing() {
        let spec = spec(ComparisonMode::Strict);
        let mut idx = HashIndex::new(spec, InputTable::Left, 0, false, CancelChecker::new(Cx::new(), 1));
        let mut sink = RecordingResult::default();
        idx.add_hash_row(Some([Value::Long(1)].into_iter().collect()), row("H0", Some(1)), 0, &mut sink)
            .expect("add");
        let mut calls = 0;
        idx.for_unmatched_hash_rows(|_, _| {
            calls += 1;
            Ok(())
        })
        .expect("drain");
        assert_eq!(calls, 0);
    }

    #[test]
    fn colliding_hashes_compare_tuples() {
        let spec = spec(ComparisonMode::Strict);
        let mut idx = HashIndex::new(spec, InputTable::Left, 0, true, CancelChecker::new(Cx::new(), 1));
        let mut sink = RecordingResult::default();
        // Same forced hash, different tuples.
        idx.insert_hashed(42, [Value::Long(1)].into_iter().collect(), row("H0", Some(1)), 0);
        idx.insert_hashed(42, [Value::Long(2)].into_iter().collect(), row("H1", Some(2)), 1);
        idx.probe_hashed(42, &[Value::Long(2)], &row("P", Some(2)), 0, &mut sink)
            .expect("probe");
        assert_eq!(sink.matches, [(key("H1"), 1, key("P"), 0)]);
    }

    #[test]
    fn cancellation_inside_a_long_chain() {
        let spec = spec(ComparisonMode::Strict);
        let cx = Cx::new();
        let mut idx = HashIndex::new(spec, InputTable::Left, 0, false, CancelChecker::new(cx.clone(), 4));
        let mut sink = RecordingResult::default();
        for i in 0..100 {
            idx.insert_hashed(7, [Value::Long(1)].into_iter().collect(), row(&format!("H{i}"), Some(1)), i);
        }
        cx.cancel();
        let err = idx
            .probe_hashed(7, &[Value::Long(1)], &row("P", Some(1)), 0, &mut sink)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(sink.matches.len() < 4, "matches={}", sink.matches.len());
    }

    #[test]
    fn drain_returns_rows_and_tracks_bytes() {
        let (idx, _) = index(InputTable::Left);
        assert!(idx.estimated_bytes() > 0);
        let drained: Vec<u64> = idx.drain().map(|(_, offset)| offset).collect();
        assert_eq!(drained, [0, 1, 2]);
    }
}
