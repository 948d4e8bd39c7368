//! Transient on-disk storage for spilled join partitions.
//!
//! Rows are written through a [`SpillWriter`] into checksummed frames (see
//! [`codec`]) inside a per-join temporary directory owned by a
//! [`SpillManager`]. A finished writer becomes a [`DiskTable`], which
//! implements [`tablejoin_types::Table`] and deletes its file once the last
//! handle is dropped.

pub mod codec;
pub mod spill;

pub use codec::{FRAME_OVERHEAD_BYTES, MAX_FRAME_BYTES, decode_row, encode_row, read_frame, write_frame};
pub use spill::{DiskTable, SpillManager, SpillWriter};
