//! End-to-end join semantics: join modes, comparison modes, match-any
//! decomposition, output layout, row keys and hiliting.

mod common;

use std::sync::Arc;

use common::{keyed_table, keys, match_keys, run_split, side_settings, unmatched_keys};
use tablejoin_core::{
    ComparisonMode, JoinColumn, JoinConfig, JoinImplementation, JoinSpecification, JoinState,
    JoinStrategy, JoinTableSettings, OutputRowOrder, RowKeyFactory,
};
use tablejoin_error::{JoinError, Result};
use tablejoin_types::{
    ColumnSpec, Cx, DataType, InMemoryTable, InputTable, Row, RowIter, RowKey, Table, TableSpec, Value,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn single_column_table(prefix: &str, name: &str, data_type: DataType, cells: Vec<Value>) -> Arc<dyn Table> {
    let spec = TableSpec::new(vec![ColumnSpec::new(name, data_type)]);
    Arc::new(InMemoryTable::new(
        spec,
        cells
            .into_iter()
            .enumerate()
            .map(|(i, v)| Row::new(format!("{prefix}{i}"), vec![v]))
            .collect(),
    ))
}

fn count_matches(left: Arc<dyn Table>, right: Arc<dyn Table>, mode: ComparisonMode) -> usize {
    let left_name = left.spec().columns()[0].name.clone();
    let right_name = right.spec().columns()[0].name.clone();
    let spec = JoinSpecification::builder(
        JoinTableSettings::new(
            InputTable::Left,
            false,
            vec![JoinColumn::column(left_name.clone())],
            vec![left_name],
            left,
        )
        .expect("left settings"),
        JoinTableSettings::new(
            InputTable::Right,
            false,
            vec![JoinColumn::column(right_name.clone())],
            vec![right_name],
            right,
        )
        .expect("right settings"),
    )
    .comparison_mode(mode)
    .build()
    .expect("spec");
    run_split(spec, JoinConfig::default())
        .matches()
        .expect("split")
        .len()
}

/// Two key columns `a`, `b` plus a payload column.
fn two_key_table(prefix: &str, payload: &str, rows: &[(i64, i64)]) -> Arc<dyn Table> {
    let spec = TableSpec::new(vec![
        ColumnSpec::new("a", DataType::Long),
        ColumnSpec::new("b", DataType::Long),
        ColumnSpec::new(payload, DataType::Text),
    ]);
    Arc::new(InMemoryTable::new(
        spec,
        rows.iter()
            .enumerate()
            .map(|(i, &(a, b))| {
                Row::new(
                    format!("{prefix}{i}"),
                    vec![Value::Long(a), Value::Long(b), Value::from(format!("{prefix}{i}"))],
                )
            })
            .collect(),
    ))
}

fn match_any_spec(left: Arc<dyn Table>, right: Arc<dyn Table>, order: OutputRowOrder) -> JoinSpecification {
    let settings = |side, table: Arc<dyn Table>| {
        let payload = table.spec().columns()[2].name.clone();
        JoinTableSettings::new(
            side,
            true,
            vec![JoinColumn::column("a"), JoinColumn::column("b")],
            vec!["a".to_owned(), "b".to_owned(), payload],
            table,
        )
        .expect("settings")
    };
    JoinSpecification::builder(settings(InputTable::Left, left), settings(InputTable::Right, right))
        .conjunctive(false)
        .output_row_order(order)
        .row_key_factory(RowKeyFactory::concatenate("+"))
        .build()
        .expect("spec")
}

/// Reports a huge row count without holding any rows.
#[derive(Debug)]
struct OversizedTable {
    spec: TableSpec,
}

impl Table for OversizedTable {
    fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn row_count(&self) -> u64 {
        u64::from(u32::MAX) + 1
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        Ok(Box::new(std::iter::empty()))
    }
}

/// Fails as soon as anyone tries to read it.
#[derive(Debug)]
struct UnreadableTable {
    spec: TableSpec,
}

impl Table for UnreadableTable {
    fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn row_count(&self) -> u64 {
        3
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        Err(JoinError::internal("table must not be read"))
    }
}

fn key_payload_spec(payload: &str) -> TableSpec {
    TableSpec::new(vec![
        ColumnSpec::new("k", DataType::Long),
        ColumnSpec::new(payload, DataType::Text),
    ])
}

// ─── End-to-end example ─────────────────────────────────────────────────────

#[test]
fn end_to_end_left_duplicates_and_left_unmatched() {
    let left = keyed_table("L", "lv", &[(Some(1), "a"), (Some(1), "b"), (Some(2), "c")]);
    let right = keyed_table("R", "rv", &[(Some(1), "x")]);
    let spec = common::full_outer(left, right, OutputRowOrder::LeftRight);
    let output = run_split(spec, JoinConfig::default());

    let matches = output.matches().expect("split");
    let pairs: Vec<(Value, Value)> = common::rows(matches)
        .iter()
        .map(|r| (r.cells()[1].clone(), r.cells()[3].clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![(Value::from("a"), Value::from("x")), (Value::from("b"), Value::from("x"))],
        "case=e2e_matches"
    );

    let left_unmatched = output.unmatched(InputTable::Left).expect("split");
    assert_eq!(left_unmatched.len(), 1, "case=e2e_left_unmatched");
    assert_eq!(common::rows(left_unmatched)[0].cells()[1], Value::from("c"));
    assert!(
        output.unmatched(InputTable::Right).expect("split").is_empty(),
        "case=e2e_right_unmatched"
    );
}

// ─── Join modes ─────────────────────────────────────────────────────────────

fn mode_tables() -> (Arc<dyn Table>, Arc<dyn Table>) {
    (
        keyed_table("L", "lv", &[(Some(1), "a"), (Some(2), "b"), (None, "m"), (Some(4), "d")]),
        keyed_table("R", "rv", &[(Some(2), "x"), (Some(3), "y"), (Some(4), "z"), (None, "n")]),
    )
}

fn mode_spec(retain_matched: bool, retain_left: bool, retain_right: bool) -> JoinSpecification {
    let (left, right) = mode_tables();
    JoinSpecification::builder(
        side_settings(InputTable::Left, retain_left, left),
        side_settings(InputTable::Right, retain_right, right),
    )
    .retain_matched(retain_matched)
    .row_key_factory(RowKeyFactory::concatenate("+"))
    .output_row_order(OutputRowOrder::Deterministic)
    .build()
    .expect("spec")
}

#[test]
fn inner_join_reports_only_matches() {
    let output = run_split(mode_spec(true, false, false), JoinConfig::default());
    assert_eq!(match_keys(&output), vec!["L1+R0", "L3+R2"], "case=inner_matches");
    assert!(unmatched_keys(&output, InputTable::Left).is_empty(), "case=inner_left");
    assert!(unmatched_keys(&output, InputTable::Right).is_empty(), "case=inner_right");
}

#[test]
fn left_outer_join_keeps_left_unmatched_including_missing_keys() {
    let output = run_split(mode_spec(true, true, false), JoinConfig::default());
    assert_eq!(match_keys(&output), vec!["L1+R0", "L3+R2"], "case=left_outer_matches");
    assert_eq!(
        unmatched_keys(&output, InputTable::Left),
        vec!["L0+?", "L2+?"],
        "case=left_outer_unmatched"
    );
    assert!(unmatched_keys(&output, InputTable::Right).is_empty());
}

#[test]
fn full_outer_join_reports_both_sides() {
    let output = run_split(mode_spec(true, true, true), JoinConfig::default());
    assert_eq!(unmatched_keys(&output, InputTable::Left), vec!["L0+?", "L2+?"]);
    assert_eq!(
        unmatched_keys(&output, InputTable::Right),
        vec!["?+R1", "?+R3"],
        "case=full_outer_right"
    );
}

#[test]
fn right_anti_join_has_no_matches() {
    let output = run_split(mode_spec(false, false, true), JoinConfig::default());
    assert!(match_keys(&output).is_empty(), "case=anti_matches");
    assert!(unmatched_keys(&output, InputTable::Left).is_empty());
    assert_eq!(unmatched_keys(&output, InputTable::Right), vec!["?+R1", "?+R3"]);
}

#[test]
fn full_anti_join_under_block_nested_loop() {
    let config = JoinConfig {
        strategy: Some(JoinStrategy::BlockNestedLoop),
        ..JoinConfig::default()
    };
    let output = run_split(mode_spec(false, true, true), config);
    assert!(match_keys(&output).is_empty());
    assert_eq!(unmatched_keys(&output, InputTable::Left), vec!["L0+?", "L2+?"]);
    assert_eq!(unmatched_keys(&output, InputTable::Right), vec!["?+R1", "?+R3"]);
}

#[test]
fn empty_join_never_reads_its_inputs() {
    let left: Arc<dyn Table> = Arc::new(UnreadableTable {
        spec: key_payload_spec("lv"),
    });
    let right: Arc<dyn Table> = Arc::new(UnreadableTable {
        spec: key_payload_spec("rv"),
    });
    let spec = JoinSpecification::builder(
        side_settings(InputTable::Left, false, left),
        side_settings(InputTable::Right, false, right),
    )
    .retain_matched(false)
    .build()
    .expect("spec");
    let mut join = JoinImplementation::new(spec, Cx::new());
    let output = join.join_output_combined().expect("empty join");
    assert!(output.combined().expect("combined").is_empty());
    assert_eq!(join.state(), JoinState::Done);
}

// ─── Combined output ────────────────────────────────────────────────────────

#[test]
fn combined_output_lists_matches_then_left_then_right() {
    let mut join = JoinImplementation::new(mode_spec(true, true, true), Cx::new());
    let output = join.join_output_combined().expect("join");
    let table = output.combined().expect("combined");
    assert_eq!(
        keys(table),
        vec!["L1+R0", "L3+R2", "L0+?", "L2+?", "?+R1", "?+R3"],
        "case=combined_order"
    );
    let right_unmatched = &common::rows(table)[4];
    assert_eq!(
        right_unmatched.cells(),
        &[Value::Missing, Value::Missing, Value::Long(3), Value::from("y")],
        "case=combined_padding"
    );
}

// ─── Comparison modes ───────────────────────────────────────────────────────

#[test]
fn int_against_long_depends_on_comparison_mode() {
    let ints = || single_column_table("L", "i", DataType::Int, vec![Value::Int(1), Value::Int(2)]);
    let longs = || single_column_table("R", "l", DataType::Long, vec![Value::Long(1), Value::Long(7)]);
    assert_eq!(count_matches(ints(), longs(), ComparisonMode::Strict), 0, "case=int_long_strict");
    assert_eq!(
        count_matches(ints(), longs(), ComparisonMode::NumericAsLong),
        1,
        "case=int_long_numeric"
    );
}

#[test]
fn text_against_int_only_matches_as_string() {
    let texts = || single_column_table("L", "s", DataType::Text, vec![Value::from("1"), Value::from("01")]);
    let ints = || single_column_table("R", "i", DataType::Int, vec![Value::Int(1)]);
    assert_eq!(count_matches(texts(), ints(), ComparisonMode::Strict), 0, "case=text_int_strict");
    assert_eq!(
        count_matches(texts(), ints(), ComparisonMode::NumericAsLong),
        0,
        "case=text_int_numeric"
    );
    assert_eq!(
        count_matches(texts(), ints(), ComparisonMode::AsString),
        1,
        "case=text_int_as_string"
    );
}

#[test]
fn row_key_join_column_matches_keys_as_text() {
    let left = single_column_table("K", "s", DataType::Text, vec![Value::from("K1"), Value::from("zz")]);
    let right = keyed_table("K", "rv", &[(Some(5), "a"), (Some(6), "b")]);
    let spec = JoinSpecification::builder(
        JoinTableSettings::new(
            InputTable::Left,
            false,
            vec![JoinColumn::column("s")],
            vec!["s".to_owned()],
            left,
        )
        .expect("left"),
        JoinTableSettings::new(
            InputTable::Right,
            false,
            vec![JoinColumn::RowKey],
            vec!["rv".to_owned()],
            right,
        )
        .expect("right"),
    )
    .build()
    .expect("spec");
    let output = run_split(spec, JoinConfig::default());
    let matches = output.matches().expect("split");
    assert_eq!(matches.len(), 1, "case=row_key_clause");
    assert_eq!(common::rows(matches)[0].cells(), &[Value::from("K1"), Value::from("b")]);
}

// ─── Match-any ──────────────────────────────────────────────────────────────

#[test]
fn match_any_emits_pairs_satisfying_both_clauses_once() {
    // L0 matches R0 on a and b; L1 matches R1 on b only; L2 matches nothing.
    let left = two_key_table("L", "lp", &[(1, 10), (2, 20), (3, 30)]);
    let right = two_key_table("R", "rp", &[(1, 10), (9, 20), (8, 80)]);
    let spec = match_any_spec(left, right, OutputRowOrder::Arbitrary);
    let mut join = JoinImplementation::new(spec, Cx::new());
    assert_eq!(join.strategy(), JoinStrategy::MatchAny);
    let output = join.join_output_split().expect("match-any join");

    assert_eq!(match_keys(&output), vec!["L0+R0", "L1+R1"], "case=match_any_dedup");
    assert_eq!(
        unmatched_keys(&output, InputTable::Left),
        vec!["L2+?"],
        "case=match_any_left_unmatched"
    );
    assert_eq!(unmatched_keys(&output, InputTable::Right), vec!["?+R2"]);
}

#[test]
fn match_any_deterministic_request_is_left_right_ordered() {
    let left = two_key_table("L", "lp", &[(5, 50), (1, 10), (2, 99)]);
    let right = two_key_table("R", "rp", &[(2, 0), (1, 10), (7, 50)]);
    let spec = match_any_spec(left, right, OutputRowOrder::Deterministic);
    let output = run_split(spec, JoinConfig::default());
    assert_eq!(
        keys(output.matches().expect("split")),
        vec!["L0+R2", "L1+R1", "L2+R0"],
        "case=match_any_order"
    );
}

#[test]
fn match_any_survives_spilling_sub_joins() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows: Vec<(i64, i64)> = (0..300).map(|i| (i % 17, i % 23)).collect();
    let left = two_key_table("L", "lp", &rows);
    let right = two_key_table("R", "rp", &rows[..150]);
    let baseline = run_split(
        match_any_spec(Arc::clone(&left), Arc::clone(&right), OutputRowOrder::LeftRight),
        JoinConfig::default(),
    );
    let spilled = run_split(
        match_any_spec(left, right, OutputRowOrder::LeftRight),
        common::starved_config(dir.path()),
    );
    assert_eq!(
        keys(spilled.matches().expect("split")),
        keys(baseline.matches().expect("split")),
        "case=match_any_spill"
    );
    assert!(spilled.matches().expect("split").is_on_disk(), "case=match_any_output_on_disk");
    drop(spilled);
    assert!(common::dir_is_empty(dir.path()), "case=match_any_spill_cleanup");
}

#[test]
fn forcing_match_any_on_conjunctive_join_is_rejected() {
    let left = two_key_table("L", "lp", &[(1, 1)]);
    let right = two_key_table("R", "rp", &[(1, 1)]);
    let settings = |side, table| {
        JoinTableSettings::new(
            side,
            false,
            vec![JoinColumn::column("a"), JoinColumn::column("b")],
            vec!["a".to_owned()],
            table,
        )
        .expect("settings")
    };
    let spec = JoinSpecification::builder(settings(InputTable::Left, left), settings(InputTable::Right, right))
        .build()
        .expect("spec");
    let config = JoinConfig {
        strategy: Some(JoinStrategy::MatchAny),
        ..JoinConfig::default()
    };
    let err = JoinImplementation::new(spec, Cx::new())
        .with_config(config)
        .join_output_split()
        .expect_err("conjunctive match-any");
    assert!(err.is_configuration(), "case=forced_match_any err={err}");
}

// ─── Layout, row keys, hiliting ─────────────────────────────────────────────

#[test]
fn merge_join_columns_emits_join_column_once() {
    let build = |merge: bool| {
        let (left, right) = mode_tables();
        JoinSpecification::builder(
            side_settings(InputTable::Left, false, left),
            side_settings(InputTable::Right, true, right),
        )
        .merge_join_columns(merge)
        .output_row_order(OutputRowOrder::Deterministic)
        .build()
        .expect("spec")
    };

    let plain: Vec<String> = build(false).match_table_spec().column_names().map(str::to_owned).collect();
    assert_eq!(plain, vec!["k", "lv", "k (#1)", "rv"], "case=plain_layout");

    let merged_spec = build(true);
    let merged: Vec<String> = merged_spec.match_table_spec().column_names().map(str::to_owned).collect();
    assert_eq!(merged, vec!["k", "lv", "rv"], "case=merged_layout");

    let output = JoinImplementation::new(merged_spec, Cx::new())
        .join_output_combined()
        .expect("join");
    let rows = output.combined().expect("combined").rows().expect("rows");
    assert_eq!(rows.len(), 4, "case=merged_rows");
    assert_eq!(rows[0].cells(), &[Value::Long(2), Value::from("b"), Value::from("x")]);
    assert_eq!(
        rows[2].cells(),
        &[Value::Long(3), Value::Missing, Value::from("y")],
        "case=merged_right_unmatched_fills_key"
    );
    assert_eq!(rows[3].cells(), &[Value::Missing, Value::Missing, Value::from("n")]);
}

#[test]
fn row_key_factories() {
    let build = |factory: RowKeyFactory| {
        let (left, right) = mode_tables();
        JoinSpecification::builder(
            side_settings(InputTable::Left, true, left),
            side_settings(InputTable::Right, true, right),
        )
        .row_key_factory(factory)
        .output_row_order(OutputRowOrder::Deterministic)
        .build()
        .expect("spec")
    };
    let combined_keys = |factory| {
        let output = JoinImplementation::new(build(factory), Cx::new())
            .join_output_combined()
            .expect("join");
        keys(output.combined().expect("combined"))
    };

    assert_eq!(
        combined_keys(RowKeyFactory::Sequence),
        vec!["Row0", "Row1", "Row2", "Row3", "Row4", "Row5"],
        "case=sequence_keys"
    );
    assert_eq!(
        combined_keys(RowKeyFactory::Retain),
        vec!["L1", "L3", "L0", "L2", "R1", "R3"],
        "case=retain_keys"
    );
    assert_eq!(
        combined_keys(RowKeyFactory::concatenate("_")),
        vec!["L1_R0", "L3_R2", "L0_?", "L2_?", "?_R1", "?_R3"],
        "case=concat_keys"
    );
}

#[test]
fn hiliting_maps_output_rows_to_their_inputs() {
    let left = keyed_table("L", "lv", &[(Some(1), "a"), (Some(1), "b")]);
    let right = keyed_table("R", "rv", &[(Some(1), "x"), (Some(2), "y")]);
    let spec = JoinSpecification::builder(
        side_settings(InputTable::Left, false, left),
        side_settings(InputTable::Right, true, right),
    )
    .output_row_order(OutputRowOrder::LeftRight)
    .build()
    .expect("spec");
    let mut join = JoinImplementation::new(spec, Cx::new());
    join.set_enable_hiliting(true);
    let output = join.join_output_combined().expect("join");
    let combined = output.combined().expect("combined");
    let hilite = combined.hilite.as_ref().expect("hilite mapping");

    assert_eq!(hilite.len(), 3, "case=hilite_len");
    let from_r0: Vec<String> = hilite
        .output_keys(InputTable::Right, &RowKey::from("R0"))
        .into_iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(from_r0, vec!["Row0", "Row1"], "case=hilite_right_key");
    let source = hilite.source(&RowKey::from("Row2")).expect("unmatched source");
    assert_eq!(source.key(InputTable::Left), None);
    assert_eq!(source.key(InputTable::Right), Some(&RowKey::from("R1")));
}

#[test]
fn hiliting_is_off_by_default() {
    let (left, right) = mode_tables();
    let output = run_split(common::full_outer(left, right, OutputRowOrder::Arbitrary), JoinConfig::default());
    assert!(output.matches().expect("split").hilite.is_none());
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[test]
fn rows_beyond_offset_range_are_rejected() {
    let left: Arc<dyn Table> = Arc::new(OversizedTable {
        spec: key_payload_spec("lv"),
    });
    let right = keyed_table("R", "rv", &[(Some(1), "x")]);
    let spec = common::full_outer(left, right, OutputRowOrder::Arbitrary);
    let mut join = JoinImplementation::new(spec, Cx::new());
    let err = join.join_output_split().expect_err("oversized input");
    assert!(matches!(err, JoinError::ResourceExhausted { .. }), "case=row_guard err={err}");
    assert_eq!(join.state(), JoinState::Failed);
}

#[test]
fn incompatible_row_fails_the_join_with_context() {
    let spec = key_payload_spec("lv");
    let left: Arc<dyn Table> = Arc::new(InMemoryTable::new(
        spec,
        vec![
            Row::new("L0", vec![Value::Long(1), Value::from("a")]),
            Row::new("bad", vec![Value::from("oops"), Value::from("b")]),
        ],
    ));
    let right = keyed_table("R", "rv", &[(Some(1), "x"), (Some(2), "y"), (Some(3), "z")]);
    let mut join = JoinImplementation::new(
        common::full_outer(left, right, OutputRowOrder::Arbitrary),
        Cx::new(),
    );
    let mut container = join.new_container(tablejoin_core::OutputFormat::Split);
    let err = join.join(&mut container).expect_err("incompatible row");
    match &err {
        JoinError::RowIncompatible { row_key, column, .. } => {
            assert_eq!(row_key, "bad", "case=row_incompatible_key");
            assert_eq!(*column, 0, "case=row_incompatible_column");
        }
        other => panic!("case=row_incompatible unexpected error {other}"),
    }
    assert_eq!(join.state(), JoinState::Failed);
    assert!(!container.is_complete());
    assert!(container.finish().is_err(), "case=failed_join_partial_output");
}

#[test]
fn unusable_spill_dir_fails_the_join_without_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").expect("write file");
    let config = JoinConfig {
        assume_memory_low: true,
        spill_dir: Some(file.join("spill")),
        ..JoinConfig::default()
    };
    let left = common::synthetic_table("L", "lv", 200, 20);
    let right = common::synthetic_table("R", "rv", 100, 20);
    let mut join = JoinImplementation::new(
        common::full_outer(left, right, OutputRowOrder::Arbitrary),
        Cx::new(),
    )
    .with_config(config);

    let err = join.join_output_split().expect_err("spill dir below a file");
    assert!(matches!(err, JoinError::Io(_)), "case=spill_dir_io err={err}");
    assert_eq!(join.state(), JoinState::Failed, "case=spill_dir_state");

    let mut container = join.new_container(tablejoin_core::OutputFormat::Combined);
    let err = join.join(&mut container).expect_err("second attempt");
    assert!(matches!(err, JoinError::Io(_)), "case=spill_dir_io_again err={err}");
    assert!(!container.is_complete());
    assert!(container.finish().is_err(), "case=spill_dir_no_output");
    assert_eq!(join.metrics().snapshot().joins_completed, 0);
}

#[test]
fn invalid_config_is_reported_before_reading_rows() {
    let (left, right) = mode_tables();
    let mut join = JoinImplementation::new(common::full_outer(left, right, OutputRowOrder::Arbitrary), Cx::new());
    assert!(join.set_memory_limit_fraction(0.0).is_err(), "case=fraction_setter");
    join.set_max_open_files(1);
    let err = join.join_output_split().expect_err("invalid config");
    assert!(err.is_configuration(), "case=max_open_files err={err}");
}

#[test]
fn mismatched_clause_counts_are_rejected() {
    let (left, right) = mode_tables();
    let err = JoinSpecification::builder(
        side_settings(InputTable::Left, false, left),
        JoinTableSettings::new(
            InputTable::Right,
            false,
            vec![JoinColumn::column("k"), JoinColumn::RowKey],
            vec!["rv".to_owned()],
            right,
        )
        .expect("right"),
    )
    .build()
    .expect_err("clause count mismatch");
    assert!(err.is_configuration(), "case=clause_count");
}

