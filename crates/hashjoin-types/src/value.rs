//! Cell values.
//!
//! Doubles compare by canonical bit pattern so that equality and hashing stay
//! consistent: `-0.0` equals `0.0` and every NaN equals every other NaN.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    Boolean,
    Int,
    Long,
    Double,
    String,
}

impl CellType {
    /// Stable label used in logs and spec dumps.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
        }
    }
}

/// A single value in a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataCell {
    /// Missing value. Never takes part in a join match.
    Missing,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl DataCell {
    /// Whether this is the missing value.
    #[inline]
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Type of the value, `None` for missing.
    #[must_use]
    pub const fn cell_type(&self) -> Option<CellType> {
        match self {
            Self::Missing => None,
            Self::Boolean(_) => Some(CellType::Boolean),
            Self::Int(_) => Some(CellType::Int),
            Self::Long(_) => Some(CellType::Long),
            Self::Double(_) => Some(CellType::Double),
            Self::String(_) => Some(CellType::String),
        }
    }

    /// Convenience constructor for string cells.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Parse a textual cell the way test fixtures write them: `?` is missing,
    /// integers become `Int`, decimals `Double`, anything else `String`.
    #[must_use]
    pub fn parse_loose(text: &str) -> Self {
        if text == "?" {
            return Self::Missing;
        }
        if let Ok(v) = text.parse::<i32>() {
            return Self::Int(v);
        }
        if let Ok(v) = text.parse::<i64>() {
            return Self::Long(v);
        }
        if text.contains('.') {
            if let Ok(v) = text.parse::<f64>() {
                return Self::Double(v);
            }
        }
        Self::String(text.to_owned())
    }

    /// Widen integer cells to `Long`; other cells are returned unchanged.
    #[must_use]
    pub fn widened_to_long(&self) -> Self {
        match self {
            Self::Int(v) => Self::Long(i64::from(*v)),
            other => other.clone(),
        }
    }
}

/// Bit pattern used for double equality and hashing.
#[must_use]
pub fn canonical_double_bits(v: f64) -> u64 {
    if v == 0.0 {
        0.0_f64.to_bits()
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

impl PartialEq for DataCell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Missing, Self::Missing) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => {
                canonical_double_bits(*a) == canonical_double_bits(*b)
            }
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for DataCell {}

impl Hash for DataCell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Missing => {}
            Self::Boolean(v) => v.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Long(v) => v.hash(state),
            Self::Double(v) => canonical_double_bits(*v).hash(state),
            Self::String(v) => v.hash(state),
        }
    }
}

impl fmt::Display for DataCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("?"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

impl From<i32> for DataCell {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for DataCell {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for DataCell {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for DataCell {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for DataCell {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for DataCell {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
