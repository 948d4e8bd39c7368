//! Typed cell values.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int,
    Long,
    Double,
    Text,
}

impl DataType {
    /// Stable label used in logs and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "Boolean",
            Self::Int => "Int",
            Self::Long => "Long",
            Self::Double => "Double",
            Self::Text => "Text",
        }
    }

    /// Whether values of this type have an exact 64-bit integer view.
    #[must_use]
    pub const fn is_integral(self) -> bool {
        matches!(self, Self::Int | Self::Long)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell.
///
/// Equality is structural: two cells are equal only when both the variant and
/// the payload agree. Doubles compare by bit pattern so that `Eq` and `Hash`
/// stay consistent (`NaN == NaN`, `0.0 != -0.0`). Note that `Missing == Missing`
/// under this impl; join semantics that treat missing values as never equal
/// live in the comparison strategy, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Missing,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
}

impl Value {
    /// Whether this cell holds no value.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Declared type of the payload, `None` for a missing cell.
    #[must_use]
    pub const fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Missing => None,
            Self::Boolean(_) => Some(DataType::Boolean),
            Self::Int(_) => Some(DataType::Int),
            Self::Long(_) => Some(DataType::Long),
            Self::Double(_) => Some(DataType::Double),
            Self::Text(_) => Some(DataType::Text),
        }
    }

    /// The widened 64-bit integer view of an integral cell.
    #[must_use]
    pub const fn as_long(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v as i64),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Text payload, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical string form used by string-based comparison.
    ///
    /// Integral doubles keep a trailing `.0` so that `1.0` and `1` stay
    /// distinguishable.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        match self {
            Self::Missing => "?".to_owned(),
            Self::Boolean(b) => b.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Long(v) => v.to_string(),
            Self::Double(d) => {
                let mut s = d.to_string();
                if d.is_finite() && !s.contains(['.', 'e', 'E']) {
                    s.push_str(".0");
                }
                s
            }
            Self::Text(s) => s.clone(),
        }
    }

    /// Rough in-memory footprint, used for memory accounting.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + match self {
                Self::Text(s) => s.capacity(),
                _ => 0,
            }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Missing, Self::Missing) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Missing => {}
            Self::Boolean(b) => b.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Long(v) => v.hash(state),
            Self::Double(d) => d.to_bits().hash(state),
            Self::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            other => f.write_str(&other.canonical_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Missing, Into::into)
    }
}
