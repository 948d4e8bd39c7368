//! Shared builders for the join integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use tablejoin_core::{
    JoinColumn, JoinConfig, JoinImplementation, JoinOutput, JoinSpecification, JoinTableSettings,
    OutputRowOrder, OutputTable, RowKeyFactory,
};
use tablejoin_types::{ColumnSpec, Cx, DataType, InMemoryTable, InputTable, Row, Table, TableSpec, Value};

/// `(key, payload)` table with columns `k: Long` and `<payload_name>: Text`.
pub fn keyed_table(prefix: &str, payload_name: &str, rows: &[(Option<i64>, &str)]) -> Arc<dyn Table> {
    let spec = TableSpec::new(vec![
        ColumnSpec::new("k", DataType::Long),
        ColumnSpec::new(payload_name, DataType::Text),
    ]);
    Arc::new(InMemoryTable::new(
        spec,
        rows.iter()
            .enumerate()
            .map(|(i, (k, v))| Row::new(format!("{prefix}{i}"), vec![(*k).into(), Value::from(*v)]))
            .collect(),
    ))
}

/// Table of `n` rows keyed `k = i % distinct`, every 7th key missing.
pub fn synthetic_table(prefix: &str, payload_name: &str, n: usize, distinct: i64) -> Arc<dyn Table> {
    let spec = TableSpec::new(vec![
        ColumnSpec::new("k", DataType::Long),
        ColumnSpec::new(payload_name, DataType::Text),
    ]);
    Arc::new(InMemoryTable::new(
        spec,
        (0..n)
            .map(|i| {
                let k = if i % 7 == 6 {
                    Value::Missing
                } else {
                    Value::Long(i as i64 % distinct)
                };
                Row::new(format!("{prefix}{i}"), vec![k, Value::from(format!("{prefix}-{i}"))])
            })
            .collect(),
    ))
}

pub fn side_settings(side: InputTable, retain_unmatched: bool, table: Arc<dyn Table>) -> JoinTableSettings {
    let payload = table.spec().columns()[1].name.clone();
    JoinTableSettings::new(
        side,
        retain_unmatched,
        vec![JoinColumn::column("k")],
        vec!["k".to_owned(), payload],
        table,
    )
    .expect("settings")
}

/// Full outer equi-join on `k` with `L+R` row keys.
pub fn full_outer(left: Arc<dyn Table>, right: Arc<dyn Table>, order: OutputRowOrder) -> JoinSpecification {
    JoinSpecification::builder(
        side_settings(InputTable::Left, true, left),
        side_settings(InputTable::Right, true, right),
    )
    .output_row_order(order)
    .row_key_factory(RowKeyFactory::concatenate("+"))
    .build()
    .expect("spec")
}

pub fn run_split(spec: JoinSpecification, config: JoinConfig) -> JoinOutput {
    JoinImplementation::new(spec, Cx::new())
        .with_config(config)
        .join_output_split()
        .expect("join")
}

pub fn rows(table: &OutputTable) -> Vec<Row> {
    table.rows().expect("output rows")
}

pub fn keys(table: &OutputTable) -> Vec<String> {
    rows(table).iter().map(|r| r.key().to_string()).collect()
}

pub fn sorted_keys(table: &OutputTable) -> Vec<String> {
    let mut keys = keys(table);
    keys.sort();
    keys
}

pub fn match_keys(output: &JoinOutput) -> Vec<String> {
    sorted_keys(output.matches().expect("split output"))
}

pub fn unmatched_keys(output: &JoinOutput, side: InputTable) -> Vec<String> {
    sorted_keys(output.unmatched(side).expect("split output"))
}

/// Configuration that spills every partition and repartitions down to
/// single-row nested loops.
pub fn starved_config(spill_dir: &std::path::Path) -> JoinConfig {
    JoinConfig {
        max_open_files: 8,
        memory_limit_bytes: 1,
        memory_limit_fraction: 1.0,
        memory_check_interval_ms: 0,
        spill_dir: Some(spill_dir.to_path_buf()),
        ..JoinConfig::default()
    }
}

pub fn dir_is_empty(path: &std::path::Path) -> bool {
    std::fs::read_dir(path).expect("read spill dir").next().is_none()
}
