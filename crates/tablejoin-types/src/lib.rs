//! Core data model shared by the join engine and its storage layer.
//!
//! A [`Table`] is an ordered, re-iterable sequence of [`Row`]s described by a
//! [`TableSpec`]. Rows carry a [`RowKey`] that is unique within their source
//! table and a vector of typed [`Value`] cells.

pub mod cx;
pub mod row;
pub mod schema;
pub mod side;
pub mod table;
pub mod value;

pub use cx::{CancelChecker, Cx};
pub use row::{Row, RowKey};
pub use schema::{ColumnSpec, TableSpec};
pub use side::InputTable;
pub use table::{InMemoryTable, RowIter, Table};
pub use value::{DataType, Value};
