//! Per-input join settings.
//!
//! [`JoinTableSettings`] describes one input of the join: which columns form
//! the join clauses, which columns are carried into the output, whether
//! unmatched rows are retained, and the table the rows come from. Column
//! names are resolved to indices once, at construction.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tablejoin_error::{JoinError, Result};
use tablejoin_types::{InputTable, Row, Table, TableSpec, Value};

use crate::comparison::JoinTuple;

/// Operand of one equality clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinColumn {
    /// A named column of the input table.
    Column(String),
    /// The row key, compared as text.
    RowKey,
}

impl JoinColumn {
    /// Display name of the row key operand.
    pub const ROW_KEY_NAME: &'static str = "$RowID$";

    #[must_use]
    pub fn column(name: impl Into<String>) -> Self {
        Self::Column(name.into())
    }

    #[must_use]
    pub const fn is_column(&self) -> bool {
        matches!(self, Self::Column(_))
    }

    #[must_use]
    pub fn column_name(&self) -> Option<&str> {
        match self {
            Self::Column(name) => Some(name),
            Self::RowKey => None,
        }
    }
}

impl fmt::Display for JoinColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(name) => f.write_str(name),
            Self::RowKey => f.write_str(Self::ROW_KEY_NAME),
        }
    }
}

/// Where the value of a join clause operand is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseSource {
    Cell(usize),
    RowKey,
}

/// Settings for one input of the join.
#[derive(Debug, Clone)]
pub struct JoinTableSettings {
    side: InputTable,
    retain_unmatched: bool,
    join_clauses: Vec<JoinColumn>,
    include_columns: Vec<String>,
    spec: TableSpec,
    table: Option<Arc<dyn Table>>,
    clause_sources: Vec<ClauseSource>,
    include_indices: Vec<usize>,
    materialize_indices: Vec<usize>,
    materialize_mask: Vec<bool>,
}

impl JoinTableSettings {
    /// Settings backed by `table`.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::InvalidSettings`] if a join or include column is
    /// not part of the table spec.
    pub fn new(
        side: InputTable,
        retain_unmatched: bool,
        join_clauses: Vec<JoinColumn>,
        include_columns: Vec<String>,
        table: Arc<dyn Table>,
    ) -> Result<Self> {
        let spec = table.spec().clone();
        let mut settings =
            Self::from_spec(side, retain_unmatched, join_clauses, include_columns, spec)?;
        settings.table = Some(table);
        Ok(settings)
    }

    /// Settings that only know the table spec, without rows.
    ///
    /// Enough to derive output layouts; a join needs [`JoinTableSettings::new`].
    pub fn from_spec(
        side: InputTable,
        retain_unmatched: bool,
        join_clauses: Vec<JoinColumn>,
        include_columns: Vec<String>,
        spec: TableSpec,
    ) -> Result<Self> {
        let clause_sources = join_clauses
            .iter()
            .map(|clause| match clause {
                JoinColumn::RowKey => Ok(ClauseSource::RowKey),
                JoinColumn::Column(name) => spec
                    .find_column_index(name)
                    .map(ClauseSource::Cell)
                    .ok_or_else(|| {
                        JoinError::invalid_settings(format!(
                            "join column '{name}' not found in {side} table"
                        ))
                    }),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut include_indices = include_columns
            .iter()
            .map(|name| {
                spec.find_column_index(name).ok_or_else(|| {
                    JoinError::invalid_settings(format!(
                        "include column '{name}' not found in {side} table"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        include_indices.sort_unstable();
        include_indices.dedup();

        let mut materialize_mask = vec![false; spec.num_columns()];
        for &i in &include_indices {
            materialize_mask[i] = true;
        }
        for source in &clause_sources {
            if let ClauseSource::Cell(i) = *source {
                materialize_mask[i] = true;
            }
        }
        let materialize_indices = materialize_mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();

        Ok(Self {
            side,
            retain_unmatched,
            join_clauses,
            include_columns,
            spec,
            table: None,
            clause_sources,
            include_indices,
            materialize_indices,
            materialize_mask,
        })
    }

    #[must_use]
    pub const fn side(&self) -> InputTable {
        self.side
    }

    #[must_use]
    pub const fn is_retain_unmatched(&self) -> bool {
        self.retain_unmatched
    }

    #[must_use]
    pub fn join_clauses(&self) -> &[JoinColumn] {
        &self.join_clauses
    }

    /// Names of the join clauses that reference named columns.
    pub fn join_column_names(&self) -> impl Iterator<Item = &str> {
        self.join_clauses.iter().filter_map(JoinColumn::column_name)
    }

    #[must_use]
    pub fn include_column_names(&self) -> &[String] {
        &self.include_columns
    }

    /// Include column indices in table order.
    #[must_use]
    pub fn include_indices(&self) -> &[usize] {
        &self.include_indices
    }

    /// Columns that must survive a spill: join columns and include columns.
    #[must_use]
    pub fn materialize_indices(&self) -> &[usize] {
        &self.materialize_indices
    }

    #[must_use]
    pub const fn spec(&self) -> &TableSpec {
        &self.spec
    }

    #[must_use]
    pub fn table(&self) -> Option<&Arc<dyn Table>> {
        self.table.as_ref()
    }

    /// The backing table, or an error naming the side that lacks one.
    pub fn require_table(&self) -> Result<&Arc<dyn Table>> {
        self.table.as_ref().ok_or_else(|| {
            JoinError::invalid_settings(format!(
                "{} input table is not present in the join table settings",
                self.side
            ))
        })
    }

    /// Extract the join tuple of `row`.
    ///
    /// Returns `Ok(None)` if any join value is missing; such rows can never
    /// match and go straight to the unmatched output.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::RowIncompatible`] if the row has fewer cells than
    /// its table spec declares or a join cell has the wrong type.
    pub fn join_tuple(&self, row: &Row) -> Result<Option<JoinTuple>> {
        if row.len() < self.spec.num_columns() {
            return Err(JoinError::RowIncompatible {
                row_key: row.key().to_string(),
                column: row.len(),
                detail: format!(
                    "{} table row has {} cells but its table spec declares {} columns",
                    self.side,
                    row.len(),
                    self.spec.num_columns()
                ),
            });
        }
        let mut tuple: JoinTuple = SmallVec::with_capacity(self.clause_sources.len());
        for source in &self.clause_sources {
            let value = match *source {
                ClauseSource::RowKey => Value::Text(row.key().as_str().to_owned()),
                ClauseSource::Cell(i) => {
                    let cell = &row.cells()[i];
                    let Some(actual) = cell.data_type() else {
                        return Ok(None);
                    };
                    let expected = self.spec.columns()[i].data_type;
                    if actual != expected {
                        return Err(JoinError::RowIncompatible {
                            row_key: row.key().to_string(),
                            column: i,
                            detail: format!("expected {expected}, found {actual}"),
                        });
                    }
                    cell.clone()
                }
            };
            tuple.push(value);
        }
        Ok(Some(tuple))
    }

    /// Replace cells that are neither join nor include columns by
    /// [`Value::Missing`]; column positions are unchanged.
    #[must_use]
    pub fn project_materialized(&self, row: Row) -> Row {
        if self.materialize_indices.len() == self.spec.num_columns() {
            return row;
        }
        let (key, mut cells) = row.into_parts();
        for (cell, &keep) in cells.iter_mut().zip(&self.materialize_mask) {
            if !keep {
                *cell = Value::Missing;
            }
        }
        Row::new(key, cells)
    }

    /// Copy of these settings with a single join clause.
    #[must_use]
    pub fn using_only_join_clause(&self, clause: usize) -> Self {
        let mut narrowed = self.clone();
        narrowed.join_clauses = vec![self.join_clauses[clause].clone()];
        narrowed.clause_sources = vec![self.clause_sources[clause]];
        narrowed
    }

    /// Number of rows in the backing table, zero without one.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.table.as_ref().map_or(0, |t| t.row_count())
    }
}
