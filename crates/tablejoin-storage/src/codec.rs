//! Binary row codec.
//!
//! A spill file is a sequence of frames:
//!
//! ```text
//! u32 LE payload length | payload | u64 LE xxh3(payload)
//! ```
//!
//! The payload holds the row key (`u32` length + UTF-8), the cell count
//! (`u32`), then each cell as a tag byte followed by little-endian data.
//! Files are working files for one execution and carry no version header.

use std::io::{self, Read, Write};

use tablejoin_error::{JoinError, Result};
use tablejoin_types::{Row, RowKey, Value};
use xxhash_rust::xxh3::xxh3_64;

/// Bytes added around each payload (length prefix + checksum).
pub const FRAME_OVERHEAD_BYTES: usize = 4 + 8;

/// Largest payload a frame may carry.
pub const MAX_FRAME_BYTES: usize = 1 << 30;

const TAG_MISSING: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_TEXT: u8 = 5;

// ── Encoding ───────────────────────────────────────────────────────────────

/// Append the payload encoding of `row` to `buf`.
///
/// # Errors
///
/// Returns [`JoinError::ResourceExhausted`] if a string or the cell count
/// does not fit the `u32` length fields.
pub fn encode_row(row: &Row, buf: &mut Vec<u8>) -> Result<()> {
    put_str(buf, row.key().as_str(), "row key")?;
    put_len(buf, row.len(), "cell count")?;
    for cell in row.cells() {
        match cell {
            Value::Missing => buf.push(TAG_MISSING),
            Value::Boolean(b) => {
                buf.push(TAG_BOOLEAN);
                buf.push(u8::from(*b));
            }
            Value::Int(v) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Long(v) => {
                buf.push(TAG_LONG);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Double(v) => {
                buf.push(TAG_DOUBLE);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Text(s) => {
                buf.push(TAG_TEXT);
                put_str(buf, s, "text cell")?;
            }
        }
    }
    Ok(())
}

fn put_len(buf: &mut Vec<u8>, len: usize, field: &str) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        JoinError::resource_exhausted(format!("{field} of {len} exceeds the u32 frame limit"))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_str(buf: &mut Vec<u8>, s: &str, field: &str) -> Result<()> {
    put_len(buf, s.len(), field)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Write one frame around `payload`.
pub fn write_frame<W: Write>(out: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_FRAME_BYTES)
        .ok_or_else(|| {
            JoinError::resource_exhausted(format!(
                "frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit",
                payload.len()
            ))
        })?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(payload)?;
    out.write_all(&xxh3_64(payload).to_le_bytes())?;
    Ok(())
}

// ── Decoding ───────────────────────────────────────────────────────────────

/// Read the next frame into `payload`.
///
/// Returns `Ok(false)` on a clean end of file, i.e. when no byte of a new
/// frame is present.
///
/// # Errors
///
/// Returns [`JoinError::SpillCorrupt`] for a truncated frame or a checksum
/// mismatch, [`JoinError::Io`] for other read failures.
pub fn read_frame<R: Read>(input: &mut R, payload: &mut Vec<u8>) -> Result<bool> {
    let mut len_bytes = [0_u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match input.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(JoinError::spill_corrupt(format!(
                    "truncated frame header: {filled} of 4 bytes"
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(JoinError::spill_corrupt(format!(
            "frame length {len} exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }

    // Grow with the bytes actually present instead of trusting the header.
    payload.clear();
    input.by_ref().take(len as u64).read_to_end(payload)?;
    if payload.len() != len {
        return Err(JoinError::spill_corrupt(format!(
            "truncated frame payload: {} of {len} bytes",
            payload.len()
        )));
    }

    let mut checksum = [0_u8; 8];
    read_exact_or_corrupt(input, &mut checksum, "checksum")?;
    let stored = u64::from_le_bytes(checksum);
    let computed = xxh3_64(payload);
    if stored != computed {
        return Err(JoinError::spill_corrupt(format!(
            "checksum mismatch: stored={stored:#018x} computed={computed:#018x}"
        )));
    }
    Ok(true)
}

fn read_exact_or_corrupt<R: Read>(input: &mut R, buf: &mut [u8], field: &str) -> Result<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            JoinError::spill_corrupt(format!("truncated frame {field}"))
        } else {
            JoinError::Io(e)
        }
    })
}

/// Decode a row from a frame payload.
///
/// # Errors
///
/// Returns [`JoinError::SpillCorrupt`] if the payload is malformed.
pub fn decode_row(payload: &[u8]) -> Result<Row> {
    let mut reader = PayloadReader {
        bytes: payload,
        pos: 0,
    };
    let key = reader.read_string("row key")?;
    let count = reader.read_u32("cell count")? as usize;
    // Every cell needs at least its tag byte.
    if count > reader.remaining() {
        return Err(JoinError::spill_corrupt(format!(
            "cell count {count} exceeds remaining {} bytes",
            reader.remaining()
        )));
    }
    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        let cell = match reader.read_u8("cell tag")? {
            TAG_MISSING => Value::Missing,
            TAG_BOOLEAN => Value::Boolean(reader.read_u8("boolean cell")? != 0),
            TAG_INT => Value::Int(i32::from_le_bytes(reader.read_array("int cell")?)),
            TAG_LONG => Value::Long(i64::from_le_bytes(reader.read_array("long cell")?)),
            TAG_DOUBLE => Value::Double(f64::from_bits(u64::from_le_bytes(
                reader.read_array("double cell")?,
            ))),
            TAG_TEXT => Value::Text(reader.read_string("text cell")?),
            other => {
                return Err(JoinError::spill_corrupt(format!(
                    "unknown cell tag {other} at byte {}",
                    reader.pos - 1
                )));
            }
        };
        cells.push(cell);
    }
    if reader.remaining() != 0 {
        return Err(JoinError::spill_corrupt(format!(
            "{} trailing bytes after row '{key}'",
            reader.remaining()
        )));
    }
    Ok(Row::new(RowKey::new(key), cells))
}

struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl PayloadReader<'_> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                JoinError::spill_corrupt(format!(
                    "field {field} out of bounds: start={}, len={n}, payload={}",
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let slice = self.take(N, field)?;
        slice
            .try_into()
            .map_err(|_| JoinError::spill_corrupt(format!("failed to parse field {field}")))
    }

    fn read_u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.read_array::<1>(field)?[0])
    }

    fn read_u32(&mut self, field: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(field)?))
    }

    fn read_string(&mut self, field: &str) -> Result<String> {
        let len = self.read_u32(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| JoinError::spill_corrupt(format!("field {field} is not UTF-8: {e}")))
    }
}
