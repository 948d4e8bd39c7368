//! Memory-bounded joins of two tables.
//!
//! Describe the inputs with [`JoinTableSettings`], combine them into a
//! [`JoinSpecification`] and run it with a [`JoinImplementation`]:
//!
//! ```
//! use std::sync::Arc;
//!
//! use tablejoin::prelude::*;
//!
//! let spec = TableSpec::new(vec![
//!     ColumnSpec::new("id", DataType::Long),
//!     ColumnSpec::new("name", DataType::Text),
//! ]);
//! let people: Arc<dyn Table> = Arc::new(InMemoryTable::new(
//!     spec.clone(),
//!     vec![
//!         Row::new("p0", vec![Value::Long(1), Value::from("ada")]),
//!         Row::new("p1", vec![Value::Long(2), Value::from("bob")]),
//!     ],
//! ));
//! let pets: Arc<dyn Table> = Arc::new(InMemoryTable::new(
//!     spec,
//!     vec![Row::new("q0", vec![Value::Long(1), Value::from("cat")])],
//! ));
//!
//! let left = JoinTableSettings::new(
//!     InputTable::Left,
//!     true,
//!     join_columns(["id"]),
//!     vec!["name".to_owned()],
//!     people,
//! )?;
//! let right = JoinTableSettings::new(
//!     InputTable::Right,
//!     false,
//!     join_columns(["id"]),
//!     vec!["name".to_owned()],
//!     pets,
//! )?;
//! let spec = JoinSpecification::builder(left, right)
//!     .output_row_order(OutputRowOrder::LeftRight)
//!     .build()?;
//!
//! let output = JoinImplementation::new(spec, Cx::new()).join_output_combined()?;
//! let table = output.combined().expect("combined output");
//! assert_eq!(table.len(), 2);
//! assert_eq!(table.rows()?[0].cells(), &[Value::from("ada"), Value::from("cat")]);
//! # Ok::<(), tablejoin::JoinError>(())
//! ```

pub use tablejoin_core::{
    BucketStats, ComparisonMode, HiliteMapping, HiliteSource, JoinColumn, JoinConfig, JoinContainer,
    JoinImplementation, JoinMetrics, JoinMetricsSnapshot, JoinOutput, JoinResult, JoinSpecification,
    JoinSpecificationBuilder, JoinState, JoinStrategy, JoinTableSettings, MemoryProbe, OutputFormat,
    OutputRowOrder, OutputTable, ResultOrder, RowKeyFactory, join_columns,
};
pub use tablejoin_error::{JoinError, Result};
pub use tablejoin_storage::DiskTable;
pub use tablejoin_types::{
    CancelChecker, ColumnSpec, Cx, DataType, InMemoryTable, InputTable, Row, RowIter, RowKey, Table,
    TableSpec, Value,
};

/// Engine internals: hash index, partitions, order tagging, spill storage.
pub mod engine {
    pub use tablejoin_core::{
        DiskBackedHashPartitions, DiskPartition, DiskPartitions, HashIndex, JoinProgressMonitor,
        JoinTuple, MAX_ROW_OFFSET, MatchBitmap, OFFSET_COLUMN_NAME, SortedRunMerge,
        combined_offsets, merge_sorted_runs, split_offsets, tag_row, tagged_spec, untag_row,
    };
    pub use tablejoin_storage::{SpillManager, SpillWriter, codec};
}

/// The types needed to describe, run and read a join.
pub mod prelude {
    pub use crate::{
        ColumnSpec, ComparisonMode, Cx, DataType, InMemoryTable, InputTable, JoinColumn, JoinConfig,
        JoinError, JoinImplementation, JoinOutput, JoinSpecification, JoinTableSettings,
        OutputFormat, OutputRowOrder, OutputTable, Row, RowKey, RowKeyFactory, Table, TableSpec,
        Value, join_columns,
    };
}
