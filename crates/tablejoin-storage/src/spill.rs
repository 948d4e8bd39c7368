//! Spill directories, writers and disk-backed tables.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tablejoin_error::{JoinError, Result};
use tablejoin_types::{Row, RowIter, Table, TableSpec};
use tempfile::{TempDir, TempPath};
use tracing::{debug, trace};

use crate::codec::{FRAME_OVERHEAD_BYTES, decode_row, encode_row, read_frame, write_frame};

const SPILL_DIR_PREFIX: &str = "tablejoin-spill-";
const WRITE_BUFFER_BYTES: usize = 64 * 1024;

// ── Manager ────────────────────────────────────────────────────────────────

/// Owns the temporary directory of one join execution.
///
/// The directory and every file left in it are removed once the manager and
/// every [`DiskTable`] created through it are dropped, which covers
/// cancellation and failure paths. The number of simultaneously open writers
/// is capped by `max_open_files`.
#[derive(Debug)]
pub struct SpillManager {
    dir: Arc<TempDir>,
    max_open_files: usize,
    open_files: Arc<AtomicUsize>,
    files_created: AtomicU64,
    bytes_written: Arc<AtomicU64>,
}

impl SpillManager {
    /// Create a spill directory below `parent`, or below the system temp
    /// directory when `parent` is `None`.
    pub fn new(parent: Option<&Path>, max_open_files: usize) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SPILL_DIR_PREFIX);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        debug!(
            target: "tablejoin::spill",
            path = %dir.path().display(),
            max_open_files,
            "created spill directory"
        );
        Ok(Self {
            dir: Arc::new(dir),
            max_open_files,
            open_files: Arc::new(AtomicUsize::new(0)),
            files_created: AtomicU64::new(0),
            bytes_written: Arc::new(AtomicU64::new(0)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub const fn max_open_files(&self) -> usize {
        self.max_open_files
    }

    /// Writers currently holding a file handle.
    #[must_use]
    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn files_created(&self) -> u64 {
        self.files_created.load(Ordering::Relaxed)
    }

    /// Total bytes written by all writers of this manager.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Open a new spill file for rows shaped like `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::ResourceExhausted`] when `max_open_files` writers
    /// are already open, [`JoinError::Io`] if the file cannot be created.
    pub fn create_writer(&self, spec: TableSpec, label: &str) -> Result<SpillWriter> {
        let guard = OpenFileGuard::acquire(&self.open_files, self.max_open_files)?;
        let file = tempfile::Builder::new()
            .prefix(label)
            .suffix(".spill")
            .tempfile_in(self.dir.path())?;
        let (file, path) = file.into_parts();
        self.files_created.fetch_add(1, Ordering::Relaxed);
        trace!(target: "tablejoin::spill", path = %path.display(), "opened spill file");
        Ok(SpillWriter {
            out: BufWriter::with_capacity(WRITE_BUFFER_BYTES, file),
            path,
            dir: Arc::clone(&self.dir),
            spec,
            rows: 0,
            bytes: 0,
            payload: Vec::new(),
            total_bytes: Arc::clone(&self.bytes_written),
            _guard: guard,
        })
    }
}

#[derive(Debug)]
struct OpenFileGuard {
    counter: Arc<AtomicUsize>,
}

impl OpenFileGuard {
    fn acquire(counter: &Arc<AtomicUsize>, limit: usize) -> Result<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < limit).then_some(open + 1)
            })
            .map_err(|open| {
                JoinError::resource_exhausted(format!(
                    "open spill file budget exhausted: {open} of {limit} files open"
                ))
            })?;
        Ok(Self {
            counter: Arc::clone(counter),
        })
    }
}

impl Drop for OpenFileGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Writer ─────────────────────────────────────────────────────────────────

/// Appends rows to one spill file.
#[derive(Debug)]
pub struct SpillWriter {
    out: BufWriter<File>,
    path: TempPath,
    dir: Arc<TempDir>,
    spec: TableSpec,
    rows: u64,
    bytes: u64,
    payload: Vec<u8>,
    total_bytes: Arc<AtomicU64>,
    _guard: OpenFileGuard,
}

impl SpillWriter {
    pub fn push(&mut self, row: &Row) -> Result<()> {
        self.payload.clear();
        encode_row(row, &mut self.payload)?;
        write_frame(&mut self.out, &self.payload)?;
        let written = (self.payload.len() + FRAME_OVERHEAD_BYTES) as u64;
        self.rows += 1;
        self.bytes += written;
        self.total_bytes.fetch_add(written, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub const fn rows(&self) -> u64 {
        self.rows
    }

    /// Bytes written so far, frame overhead included.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file, releasing its slot in the open-file budget.
    pub fn finish(mut self) -> Result<DiskTable> {
        self.out.flush()?;
        let Self {
            out,
            path,
            dir,
            spec,
            rows,
            bytes,
            _guard: guard,
            ..
        } = self;
        out.into_inner().map_err(|e| JoinError::Io(e.into_error()))?;
        drop(guard);
        trace!(target: "tablejoin::spill", path = %path.display(), rows, bytes, "closed spill file");
        Ok(DiskTable {
            spec,
            path: Arc::new(path),
            _dir: dir,
            rows,
            bytes,
        })
    }
}

// ── Disk table ─────────────────────────────────────────────────────────────

/// A finished spill file, readable any number of times.
///
/// Clones share the file; it is deleted when the last clone is dropped. The
/// spill directory lives at least as long as the table.
#[derive(Debug, Clone)]
pub struct DiskTable {
    spec: TableSpec,
    path: Arc<TempPath>,
    _dir: Arc<TempDir>,
    rows: u64,
    bytes: u64,
}

impl DiskTable {
    /// Bytes stored in the file, frame overhead included.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.path.to_path_buf()
    }
}

impl Table for DiskTable {
    fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn row_count(&self) -> u64 {
        self.rows
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        let file = File::open(&**self.path)?;
        Ok(Box::new(DiskRowIter {
            input: BufReader::new(file),
            payload: Vec::new(),
            done: false,
        }))
    }
}

struct DiskRowIter {
    input: BufReader<File>,
    payload: Vec<u8>,
    done: bool,
}

impl Iterator for DiskRowIter {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = read_frame(&mut self.input, &mut self.payload)
            .and_then(|more| more.then(|| decode_row(&self.payload)).transpose());
        match next {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
