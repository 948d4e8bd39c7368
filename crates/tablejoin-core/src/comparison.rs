//! Equality and hashing of join tuples.
//!
//! A [`ComparisonMode`] decides when two join tuples are equal and produces a
//! hash consistent with that equality. Tuples containing a missing cell are
//! never equal to anything, including another tuple with a missing cell.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tablejoin_types::Value;
use xxhash_rust::xxh3::Xxh3;

/// Values of a row's join columns, in clause order.
pub type JoinTuple = SmallVec<[Value; 4]>;

// Type tags fed to the hasher ahead of each cell payload.
const HASH_TAG_MISSING: u8 = 0;
const HASH_TAG_BOOLEAN: u8 = 1;
const HASH_TAG_INT: u8 = 2;
const HASH_TAG_LONG: u8 = 3;
const HASH_TAG_DOUBLE: u8 = 4;
const HASH_TAG_TEXT: u8 = 5;

/// How cells of join columns are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ComparisonMode {
    /// Equal only if type and value agree.
    #[default]
    Strict,
    /// Compare the canonical string representation, ignoring types.
    AsString,
    /// Like `Strict`, but integral cells compare by their 64-bit value.
    NumericAsLong,
}

impl ComparisonMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::AsString => "as_string",
            Self::NumericAsLong => "numeric_as_long",
        }
    }

    /// Cell equality under this mode. A missing cell equals nothing.
    #[must_use]
    pub fn cells_equal(self, a: &Value, b: &Value) -> bool {
        if a.is_missing() || b.is_missing() {
            return false;
        }
        match self {
            Self::Strict => a == b,
            Self::AsString => match (a, b) {
                (Value::Text(x), Value::Text(y)) => x == y,
                _ => a.canonical_string() == b.canonical_string(),
            },
            Self::NumericAsLong => match (a.as_long(), b.as_long()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
        }
    }

    /// Tuple equality: same arity and every position equal.
    #[must_use]
    pub fn tuples_equal(self, a: &[Value], b: &[Value]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| self.cells_equal(x, y))
    }

    /// Hash of a tuple, consistent with [`ComparisonMode::tuples_equal`].
    ///
    /// Different seeds give independent hash functions, which is what the
    /// recursive repartitioning of skewed partitions relies on.
    #[must_use]
    pub fn hash_tuple(self, tuple: &[Value], seed: u64) -> u64 {
        let mut hasher = Xxh3::with_seed(seed);
        for cell in tuple {
            self.hash_cell(&mut hasher, cell);
        }
        hasher.digest()
    }

    fn hash_cell(self, hasher: &mut Xxh3, cell: &Value) {
        if self == Self::AsString && !cell.is_missing() {
            let s = cell.canonical_string();
            hasher.update(&[HASH_TAG_TEXT]);
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
            return;
        }
        if self == Self::NumericAsLong {
            if let Some(v) = cell.as_long() {
                hasher.update(&[HASH_TAG_LONG]);
                hasher.update(&v.to_le_bytes());
                return;
            }
        }
        match cell {
            Value::Missing => hasher.update(&[HASH_TAG_MISSING]),
            Value::Boolean(b) => hasher.update(&[HASH_TAG_BOOLEAN, u8::from(*b)]),
            Value::Int(v) => {
                hasher.update(&[HASH_TAG_INT]);
                hasher.update(&v.to_le_bytes());
            }
            Value::Long(v) => {
                hasher.update(&[HASH_TAG_LONG]);
                hasher.update(&v.to_le_bytes());
            }
            Value::Double(d) => {
                hasher.update(&[HASH_TAG_DOUBLE]);
                hasher.update(&d.to_bits().to_le_bytes());
            }
            Value::Text(s) => {
                hasher.update(&[HASH_TAG_TEXT]);
                hasher.update(&(s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
}

impl fmt::Display for ComparisonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
