//! Column and table descriptions.

use serde::{Deserialize, Serialize};

use crate::value::DataType;

/// Name and declared type of one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// Same column under a different name.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: self.data_type,
        }
    }
}

/// Ordered column list of a table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSpec {
    columns: Vec<ColumnSpec>,
}

impl TableSpec {
    #[must_use]
    pub const fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn column(&self, index: usize) -> Option<&ColumnSpec> {
        self.columns.get(index)
    }

    /// Position of the column called `name`.
    #[must_use]
    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.find_column_index(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Spec with one extra column appended.
    #[must_use]
    pub fn with_appended(&self, column: ColumnSpec) -> Self {
        let mut columns = self.columns.clone();
        columns.push(column);
        Self { columns }
    }
}

impl FromIterator<ColumnSpec> for TableSpec {
    fn from_iter<I: IntoIterator<Item = ColumnSpec>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}
