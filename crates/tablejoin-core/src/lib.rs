//! Join execution engine.
//!
//! Computes equi-joins and match-any (disjunctive) joins between two tables
//! under a memory budget. The [`JoinImplementation`] driver picks a strategy:
//! a hybrid hash join that spills hash partitions to disk when memory runs
//! low, a block nested loop, or the match-any decomposition into one
//! single-clause join per clause. Output is collected by a [`JoinResult`]
//! such as [`JoinContainer`].

pub mod bitmap;
pub mod comparison;
pub mod config;
pub mod driver;
pub mod hash_index;
mod hybrid;
pub mod metrics;
pub mod monitor;
mod nested_loop;
pub mod order;
pub mod partitions;
pub mod results;
pub mod settings;
pub mod specification;

pub use bitmap::MatchBitmap;
pub use comparison::{ComparisonMode, JoinTuple};
pub use config::JoinConfig;
pub use driver::{JoinImplementation, JoinStrategy};
pub use hash_index::HashIndex;
pub use metrics::{BucketStats, JoinMetrics, JoinMetricsSnapshot};
pub use monitor::{JoinProgressMonitor, JoinState, MemoryProbe};
pub use order::{
    MAX_ROW_OFFSET, OFFSET_COLUMN_NAME, SortedRunMerge, combined_offsets, merge_sorted_runs,
    split_offsets, tag_row, tagged_spec, untag_row,
};
pub use partitions::{DiskBackedHashPartitions, DiskPartition, DiskPartitions};
pub use results::{
    HiliteMapping, HiliteSource, JoinContainer, JoinOutput, JoinResult, OutputFormat, OutputTable,
    ResultOrder,
};
pub use settings::{JoinColumn, JoinTableSettings};
pub use specification::{
    DEFAULT_DISAMBIGUATION_SUFFIX, JoinSpecification, JoinSpecificationBuilder, OutputRowOrder,
    RowKeyFactory, join_columns,
};
