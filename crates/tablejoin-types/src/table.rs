//! The table capability consumed and produced by the join engine.

use std::fmt;
use std::sync::Arc;

use tablejoin_error::Result;

use crate::row::Row;
use crate::schema::TableSpec;

/// A boxed cursor over a table's rows.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row>> + Send + 'a>;

/// A re-iterable, ordered row source.
///
/// Every call to [`Table::rows`] returns an independent cursor that starts at
/// the first row, so several cursors may be open at once, including from
/// different threads.
pub trait Table: Send + Sync + fmt::Debug {
    fn spec(&self) -> &TableSpec;

    /// Number of rows the cursor will yield.
    fn row_count(&self) -> u64;

    /// Open a new cursor positioned before the first row.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be opened. Errors for
    /// individual rows are yielded by the iterator.
    fn rows(&self) -> Result<RowIter<'_>>;
}

/// A table held fully in memory.
#[derive(Debug, Clone)]
pub struct InMemoryTable {
    spec: TableSpec,
    rows: Arc<[Row]>,
}

impl InMemoryTable {
    #[must_use]
    pub fn new(spec: TableSpec, rows: Vec<Row>) -> Self {
        Self {
            spec,
            rows: rows.into(),
        }
    }

    #[must_use]
    pub fn empty(spec: TableSpec) -> Self {
        Self::new(spec, Vec::new())
    }

    /// Direct access to the stored rows.
    #[must_use]
    pub fn as_slice(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Table for InMemoryTable {
    fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        Ok(Box::new(self.rows.iter().cloned().map(Ok)))
    }
}
