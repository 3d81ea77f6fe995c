//! Row keys and immutable rows.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::DataCell;

/// Identifier of a row, unique within its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(String);

impl RowKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Sequential key of the form `Row{n}`.
    #[must_use]
    pub fn sequence(n: u64) -> Self {
        Self(format!("Row{n}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// An immutable row: a key plus a fixed-arity sequence of cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRow {
    key: RowKey,
    cells: Vec<DataCell>,
}

/// Shared handle to a row. Indexes hold these, never cell copies.
pub type RowRef = Arc<DataRow>;

impl DataRow {
    #[must_use]
    pub fn new(key: RowKey, cells: Vec<DataCell>) -> Self {
        Self { key, cells }
    }

    /// Parse the comma-separated fixture notation `key,cell,cell,...`.
    ///
    /// Cells are parsed with [`DataCell::parse_loose`].
    #[must_use]
    pub fn parse_fixture(line: &str) -> Self {
        let mut parts = line.split(',');
        let key = RowKey::new(parts.next().unwrap_or_default());
        let cells = parts.map(DataCell::parse_loose).collect();
        Self { key, cells }
    }

    #[must_use]
    pub fn into_ref(self) -> RowRef {
        Arc::new(self)
    }

    #[must_use]
    pub const fn key(&self) -> &RowKey {
        &self.key
    }

    #[must_use]
    pub fn cells(&self) -> &[DataCell] {
        &self.cells
    }

    /// Cell at `index`; out-of-range positions read as missing.
    #[must_use]
    pub fn cell(&self, index: usize) -> &DataCell {
        static MISSING: DataCell = DataCell::Missing;
        self.cells.get(index).unwrap_or(&MISSING)
    }

    #[must_use]
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }
}

impl fmt::Display for DataRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        for cell in &self.cells {
            write!(f, ",{cell}")?;
        }
        Ok(())
    }
}
