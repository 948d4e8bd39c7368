//! Rows and row keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identifier of a row, unique within its source table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(String);

impl RowKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl From<String> for RowKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// An immutable row: a key plus positional cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Row {
    key: RowKey,
    cells: Vec<Value>,
}

impl Row {
    #[must_use]
    pub fn new(key: impl Into<RowKey>, cells: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            cells,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &RowKey {
        &self.key
    }

    #[must_use]
    pub fn cells(&self) -> &[Value] {
        &self.cells
    }

    #[must_use]
    pub fn cell(&self, index: usize) -> Option<&Value> {
        self.cells.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn into_parts(self) -> (RowKey, Vec<Value>) {
        (self.key, self.cells)
    }

    /// Rough in-memory footprint, used for memory accounting.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.0.capacity()
            + self.cells.iter().map(Value::estimated_size).sum::<usize>()
    }
}
