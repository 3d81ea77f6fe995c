//! Core type definitions for the hash join engine.

pub mod cx;
pub mod row;
pub mod table;
pub mod value;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cx::{CancelHandle, Cx};
pub use row::{DataRow, RowKey, RowRef};
pub use table::{ColumnSpec, DataTable, TableSpec};
pub use value::{CellType, DataCell, canonical_double_bits};

/// The two logical inputs of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InputTable {
    Left,
    Right,
}

impl InputTable {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    #[must_use]
    pub const fn is_left(self) -> bool {
        matches!(self, Self::Left)
    }

    /// Both sides, left first.
    #[must_use]
    pub const fn both() -> [Self; 2] {
        [Self::Left, Self::Right]
    }

    /// Array slot for per-side storage.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

impl fmt::Display for InputTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
