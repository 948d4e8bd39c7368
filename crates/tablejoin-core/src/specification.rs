//! Join specification: what to join and how the output looks.
//!
//! A [`JoinSpecification`] pairs the [`JoinTableSettings`] of both inputs with
//! the join mode (conjunctive or match-any), the comparison mode, the output
//! row order, row key generation and column naming. The output layout (which
//! input column lands where, under which name) is derived once in
//! [`JoinSpecificationBuilder::build`].

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tablejoin_error::{JoinError, Result};
use tablejoin_types::{ColumnSpec, InputTable, Row, RowKey, TableSpec, Value};

use crate::comparison::ComparisonMode;
use crate::settings::{JoinColumn, JoinTableSettings};

/// Default suffix appended to clashing right column names.
pub const DEFAULT_DISAMBIGUATION_SUFFIX: &str = " (#1)";

/// Order of the rows in the join output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputRowOrder {
    /// Whatever order the rows were produced in.
    #[default]
    Arbitrary,
    /// Reproducible order, independent of memory pressure.
    Deterministic,
    /// Matches sorted by left row offset, then right row offset.
    LeftRight,
}

/// How output row keys are created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RowKeyFactory {
    /// `Row0`, `Row1`, ... in output order.
    #[default]
    Sequence,
    /// Left and right key joined by a separator, `?` for an absent side.
    Concat(String),
    /// The left key if present, else the right key.
    Retain,
}

impl RowKeyFactory {
    #[must_use]
    pub fn concatenate(separator: impl Into<String>) -> Self {
        Self::Concat(separator.into())
    }

    /// Key for an output row made from `left` and/or `right`; `sequence` is the
    /// row's position in its output table.
    #[must_use]
    pub fn create(&self, left: Option<&RowKey>, right: Option<&RowKey>, sequence: u64) -> RowKey {
        match self {
            Self::Sequence => RowKey::new(format!("Row{sequence}")),
            Self::Concat(separator) => RowKey::new(format!(
                "{}{separator}{}",
                left.map_or("?", RowKey::as_str),
                right.map_or("?", RowKey::as_str)
            )),
            Self::Retain => left
                .or(right)
                .cloned()
                .unwrap_or_else(|| RowKey::new(format!("Row{sequence}"))),
        }
    }

    /// Whether distinct output rows always receive distinct keys.
    #[must_use]
    pub const fn creates_unique_keys(&self) -> bool {
        !matches!(self, Self::Retain)
    }
}

// ── Layout ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct OutputLayout {
    /// Input column indices contributing to the match table, per side.
    match_includes: [Vec<usize>; 2],
    match_spec: TableSpec,
    unmatched_specs: [TableSpec; 2],
    /// For each left match-table column, the right columns merged into it.
    left_merged_locations: Vec<Vec<usize>>,
}

fn disambiguate(name: &str, taken: &HashSet<String>, suffix: &str) -> String {
    let mut candidate = name.to_owned();
    while taken.contains(&candidate) {
        let next = format!("{candidate}{suffix}").trim().to_owned();
        // A suffix that vanishes under trimming would loop forever.
        candidate = if next == candidate {
            format!("{candidate}{candidate}")
        } else {
            next
        };
    }
    candidate
}

/// Right join partners (named columns only) of the left column `name`.
fn left_join_partners<'a>(
    left: &'a JoinTableSettings,
    right: &'a JoinTableSettings,
    name: &'a str,
) -> impl Iterator<Item = &'a str> {
    left.join_clauses()
        .iter()
        .zip(right.join_clauses())
        .filter(move |(l, _)| l.column_name() == Some(name))
        .filter_map(|(_, r)| r.column_name())
}

fn unmatched_spec(settings: &JoinTableSettings) -> TableSpec {
    settings
        .include_indices()
        .iter()
        .filter_map(|&i| settings.spec().column(i).cloned())
        .collect()
}

fn plain_layout(left: &JoinTableSettings, right: &JoinTableSettings, suffix: &str) -> OutputLayout {
    let mut columns: Vec<ColumnSpec> = Vec::new();
    let mut taken = HashSet::new();
    for &i in left.include_indices() {
        if let Some(col) = left.spec().column(i) {
            taken.insert(col.name.clone());
            columns.push(col.clone());
        }
    }
    for &i in right.include_indices() {
        if let Some(col) = right.spec().column(i) {
            let name = disambiguate(&col.name, &taken, suffix);
            taken.insert(name.clone());
            columns.push(col.renamed(name));
        }
    }
    OutputLayout {
        match_includes: [left.include_indices().to_vec(), right.include_indices().to_vec()],
        match_spec: TableSpec::new(columns),
        unmatched_specs: [unmatched_spec(left), unmatched_spec(right)],
        left_merged_locations: Vec::new(),
    }
}

fn merged_layout(left: &JoinTableSettings, right: &JoinTableSettings, suffix: &str) -> OutputLayout {
    let left_includes: HashSet<&str> = left.include_column_names().iter().map(String::as_str).collect();
    let right_includes: HashSet<&str> =
        right.include_column_names().iter().map(String::as_str).collect();
    let left_join_names: HashSet<&str> = left.join_column_names().collect();

    let mut taken: HashSet<String> = HashSet::new();
    let mut columns: Vec<ColumnSpec> = Vec::new();
    let mut left_match_includes = Vec::new();
    let mut left_merged_locations = Vec::new();

    for (index, col) in left.spec().columns().iter().enumerate() {
        let name = col.name.as_str();
        let partners: Vec<&str> = left_join_partners(left, right, name).collect();
        let included_directly = left_includes.contains(name);
        let is_join_column = left_join_names.contains(name);
        let included_via_merge = is_join_column && partners.iter().any(|p| right_includes.contains(p));

        if included_directly && !is_join_column {
            taken.insert(name.to_owned());
            columns.push(col.clone());
        } else if included_directly || included_via_merge {
            if partners.contains(&name) {
                taken.insert(name.to_owned());
                columns.push(col.clone());
            } else {
                let merged_name = if partners.is_empty() {
                    name.to_owned()
                } else {
                    format!("{name}={}", partners.join("="))
                };
                let merged_name = disambiguate(&merged_name, &taken, suffix);
                taken.insert(merged_name.clone());
                columns.push(col.renamed(merged_name));
            }
        } else {
            continue;
        }
        left_match_includes.push(index);
        left_merged_locations.push(
            partners
                .iter()
                .filter_map(|p| right.spec().find_column_index(p))
                .collect::<Vec<_>>(),
        );
    }

    // Right columns merged into a left column are not repeated.
    let merged_right: HashSet<&str> = left
        .join_clauses()
        .iter()
        .zip(right.join_clauses())
        .filter(|(l, _)| l.is_column())
        .filter_map(|(_, r)| r.column_name())
        .collect();
    let mut right_match_includes = Vec::new();
    for &index in right.include_indices() {
        let Some(col) = right.spec().column(index) else {
            continue;
        };
        if merged_right.contains(col.name.as_str()) {
            continue;
        }
        let name = disambiguate(&col.name, &taken, suffix);
        taken.insert(name.clone());
        columns.push(col.renamed(name));
        right_match_includes.push(index);
    }

    OutputLayout {
        match_includes: [left_match_includes, right_match_includes],
        match_spec: TableSpec::new(columns),
        unmatched_specs: [unmatched_spec(left), unmatched_spec(right)],
        left_merged_locations,
    }
}

fn cell_at(row: &Row, index: usize) -> Value {
    row.cell(index).cloned().unwrap_or(Value::Missing)
}

/// Common value of the right cells at `locations`, missing if they disagree
/// or if there are none.
fn right_consensus(right: &Row, locations: &[usize]) -> Value {
    let mut cells = locations.iter().map(|&i| cell_at(right, i));
    let Some(first) = cells.next() else {
        return Value::Missing;
    };
    if cells.all(|c| c == first) { first } else { Value::Missing }
}

// ── Specification ──────────────────────────────────────────────────────────

/// Complete description of one join.
#[derive(Debug, Clone)]
pub struct JoinSpecification {
    settings: [JoinTableSettings; 2],
    conjunctive: bool,
    retain_matched: bool,
    merge_join_columns: bool,
    comparison_mode: ComparisonMode,
    output_row_order: OutputRowOrder,
    row_key_factory: RowKeyFactory,
    column_name_suffix: String,
    layout: Arc<OutputLayout>,
}

impl JoinSpecification {
    #[must_use]
    pub fn builder(left: JoinTableSettings, right: JoinTableSettings) -> JoinSpecificationBuilder {
        JoinSpecificationBuilder::new(left, right)
    }

    #[must_use]
    pub const fn settings(&self, side: InputTable) -> &JoinTableSettings {
        &self.settings[side.index()]
    }

    /// Whether all clauses must hold (AND) rather than any (OR).
    #[must_use]
    pub const fn is_conjunctive(&self) -> bool {
        self.conjunctive
    }

    /// A match-any join with more than one clause. A single clause is the
    /// same under both interpretations.
    #[must_use]
    pub fn is_match_any(&self) -> bool {
        !self.conjunctive && self.num_join_clauses() > 1
    }

    #[must_use]
    pub fn num_join_clauses(&self) -> usize {
        self.settings[0].join_clauses().len()
    }

    #[must_use]
    pub const fn is_retain_matched(&self) -> bool {
        self.retain_matched
    }

    #[must_use]
    pub const fn is_retain_unmatched(&self, side: InputTable) -> bool {
        self.settings[side.index()].is_retain_unmatched()
    }

    /// Nothing is retained, so the result is empty whatever the input.
    #[must_use]
    pub const fn is_empty_join(&self) -> bool {
        !(self.retain_matched
            || self.is_retain_unmatched(InputTable::Left)
            || self.is_retain_unmatched(InputTable::Right))
    }

    #[must_use]
    pub const fn is_merge_join_columns(&self) -> bool {
        self.merge_join_columns
    }

    #[must_use]
    pub const fn comparison_mode(&self) -> ComparisonMode {
        self.comparison_mode
    }

    #[must_use]
    pub const fn output_row_order(&self) -> OutputRowOrder {
        self.output_row_order
    }

    #[must_use]
    pub const fn row_key_factory(&self) -> &RowKeyFactory {
        &self.row_key_factory
    }

    #[must_use]
    pub fn column_name_suffix(&self) -> &str {
        &self.column_name_suffix
    }

    /// Columns of the match table; also the layout of the combined output.
    #[must_use]
    pub fn match_table_spec(&self) -> &TableSpec {
        &self.layout.match_spec
    }

    /// Columns of the unmatched-rows table of `side`.
    #[must_use]
    pub fn unmatched_table_spec(&self, side: InputTable) -> &TableSpec {
        &self.layout.unmatched_specs[side.index()]
    }

    /// Input columns of `side` that appear in the match table.
    #[must_use]
    pub fn match_table_include_indices(&self, side: InputTable) -> &[usize] {
        &self.layout.match_includes[side.index()]
    }

    /// Copy that joins on clause `clause` only. The output layout of the full
    /// specification is kept.
    #[must_use]
    pub fn using_only_join_clause(&self, clause: usize) -> Self {
        let mut narrowed = self.clone();
        narrowed.settings = [
            self.settings[0].using_only_join_clause(clause),
            self.settings[1].using_only_join_clause(clause),
        ];
        narrowed.conjunctive = true;
        narrowed
    }

    #[must_use]
    pub fn with_output_row_order(&self, order: OutputRowOrder) -> Self {
        let mut copy = self.clone();
        copy.output_row_order = order;
        copy
    }

    // ── Row formatting ─────────────────────────────────────────────────────

    /// Cells of the match-table row for a matched pair.
    #[must_use]
    pub fn match_cells(&self, left: &Row, right: &Row) -> Vec<Value> {
        let left_includes = self.match_table_include_indices(InputTable::Left);
        let right_includes = self.match_table_include_indices(InputTable::Right);
        let mut cells = Vec::with_capacity(left_includes.len() + right_includes.len());
        let check_consensus = self.merge_join_columns && !self.conjunctive;
        for (pos, &i) in left_includes.iter().enumerate() {
            let cell = cell_at(left, i);
            let merged_agree = !check_consensus
                || self.layout.left_merged_locations[pos]
                    .iter()
                    .all(|&r| cell_at(right, r) == cell);
            cells.push(if merged_agree { cell } else { Value::Missing });
        }
        cells.extend(right_includes.iter().map(|&i| cell_at(right, i)));
        cells
    }

    /// A left unmatched row in match-table layout, right side padded.
    #[must_use]
    pub fn left_to_single_table_format(&self, left: &Row) -> Vec<Value> {
        let left_includes = self.match_table_include_indices(InputTable::Left);
        let right_len = self.match_table_include_indices(InputTable::Right).len();
        let mut cells = Vec::with_capacity(left_includes.len() + right_len);
        cells.extend(left_includes.iter().map(|&i| cell_at(left, i)));
        cells.resize(left_includes.len() + right_len, Value::Missing);
        cells
    }

    /// A right unmatched row in match-table layout. Merged join columns take
    /// the right row's own join values.
    #[must_use]
    pub fn right_to_single_table_format(&self, right: &Row) -> Vec<Value> {
        let left_len = self.match_table_include_indices(InputTable::Left).len();
        let right_includes = self.match_table_include_indices(InputTable::Right);
        let mut cells = Vec::with_capacity(left_len + right_includes.len());
        if self.merge_join_columns {
            cells.extend(
                self.layout
                    .left_merged_locations
                    .iter()
                    .map(|locations| right_consensus(right, locations)),
            );
        } else {
            cells.resize(left_len, Value::Missing);
        }
        cells.extend(right_includes.iter().map(|&i| cell_at(right, i)));
        cells
    }

    /// An unmatched row of `side` in its own unmatched-table layout.
    #[must_use]
    pub fn row_project_outer(&self, side: InputTable, row: &Row) -> Vec<Value> {
        self.settings(side)
            .include_indices()
            .iter()
            .map(|&i| cell_at(row, i))
            .collect()
    }
}

// ── Builder ────────────────────────────────────────────────────────────────

/// Builder for [`JoinSpecification`].
#[derive(Debug, Clone)]
pub struct JoinSpecificationBuilder {
    left: JoinTableSettings,
    right: JoinTableSettings,
    conjunctive: bool,
    retain_matched: bool,
    merge_join_columns: bool,
    comparison_mode: ComparisonMode,
    output_row_order: OutputRowOrder,
    row_key_factory: RowKeyFactory,
    column_name_suffix: String,
}

impl JoinSpecificationBuilder {
    #[must_use]
    pub fn new(left: JoinTableSettings, right: JoinTableSettings) -> Self {
        Self {
            left,
            right,
            conjunctive: true,
            retain_matched: true,
            merge_join_columns: false,
            comparison_mode: ComparisonMode::Strict,
            output_row_order: OutputRowOrder::Arbitrary,
            row_key_factory: RowKeyFactory::Sequence,
            column_name_suffix: DEFAULT_DISAMBIGUATION_SUFFIX.to_owned(),
        }
    }

    /// `true` joins on the AND of all clauses, `false` on the OR.
    #[must_use]
    pub const fn conjunctive(mut self, conjunctive: bool) -> Self {
        self.conjunctive = conjunctive;
        self
    }

    #[must_use]
    pub const fn retain_matched(mut self, retain: bool) -> Self {
        self.retain_matched = retain;
        self
    }

    #[must_use]
    pub const fn merge_join_columns(mut self, merge: bool) -> Self {
        self.merge_join_columns = merge;
        self
    }

    #[must_use]
    pub const fn comparison_mode(mut self, mode: ComparisonMode) -> Self {
        self.comparison_mode = mode;
        self
    }

    #[must_use]
    pub const fn output_row_order(mut self, order: OutputRowOrder) -> Self {
        self.output_row_order = order;
        self
    }

    #[must_use]
    pub fn row_key_factory(mut self, factory: RowKeyFactory) -> Self {
        self.row_key_factory = factory;
        self
    }

    #[must_use]
    pub fn column_name_disambiguator(mut self, suffix: impl Into<String>) -> Self {
        self.column_name_suffix = suffix.into();
        self
    }

    /// Validate and derive the output layout.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::InvalidSettings`] if the settings are declared for
    /// the wrong side, if there are no join clauses, or if the two sides have
    /// different numbers of clauses.
    pub fn build(self) -> Result<JoinSpecification> {
        if self.left.side() != InputTable::Left {
            return Err(JoinError::invalid_settings(
                "left join table settings are declared for the right input",
            ));
        }
        if self.right.side() != InputTable::Right {
            return Err(JoinError::invalid_settings(
                "right join table settings are declared for the left input",
            ));
        }
        let (left_clauses, right_clauses) =
            (self.left.join_clauses().len(), self.right.join_clauses().len());
        if left_clauses != right_clauses {
            return Err(JoinError::invalid_settings(format!(
                "number of join clauses differs: left has {left_clauses}, right has {right_clauses}"
            )));
        }
        if left_clauses == 0 {
            return Err(JoinError::invalid_settings("no join columns passed"));
        }

        let layout = if self.merge_join_columns {
            merged_layout(&self.left, &self.right, &self.column_name_suffix)
        } else {
            plain_layout(&self.left, &self.right, &self.column_name_suffix)
        };

        tracing::debug!(
            target: "tablejoin::specification",
            clauses = left_clauses,
            conjunctive = self.conjunctive,
            mode = %self.comparison_mode,
            order = ?self.output_row_order,
            output_columns = layout.match_spec.num_columns(),
            "built join specification"
        );

        Ok(JoinSpecification {
            settings: [self.left, self.right],
            conjunctive: self.conjunctive,
            retain_matched: self.retain_matched,
            merge_join_columns: self.merge_join_columns,
            comparison_mode: self.comparison_mode,
            output_row_order: self.output_row_order,
            row_key_factory: self.row_key_factory,
            column_name_suffix: self.column_name_suffix,
            layout: Arc::new(layout),
        })
    }
}

/// Shorthand for a list of named join columns.
#[must_use]
pub fn join_columns<I, S>(names: I) -> Vec<JoinColumn>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(JoinColumn::column).collect()
}
