//! Table specifications and in-memory tables.

use serde::{Deserialize, Serialize};

use crate::row::{DataRow, RowRef};
use crate::value::CellType;

/// Name and declared type of one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub cell_type: CellType,
}

impl ColumnSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, cell_type: CellType) -> Self {
        Self {
            name: name.into(),
            cell_type,
        }
    }
}

/// Ordered column layout of a table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSpec {
    columns: Vec<ColumnSpec>,
}

impl TableSpec {
    #[must_use]
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    /// Spec with all columns typed as strings, from a comma-separated header.
    #[must_use]
    pub fn from_header(header: &str) -> Self {
        Self::new(
            header
                .split(',')
                .map(|name| ColumnSpec::new(name, CellType::String))
                .collect(),
        )
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn column(&self, index: usize) -> Option<&ColumnSpec> {
        self.columns.get(index)
    }

    /// Index of the column called `name`.
    #[must_use]
    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.find_column_index(name).is_some()
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// An in-memory table: spec plus rows in table order.
///
/// A row's offset is its position in `rows`.
#[derive(Debug, Clone, Default)]
pub struct DataTable {
    spec: TableSpec,
    rows: Vec<RowRef>,
}

impl DataTable {
    #[must_use]
    pub fn new(spec: TableSpec, rows: Vec<RowRef>) -> Self {
        Self { spec, rows }
    }

    /// Build a table from a header and fixture rows (see [`DataRow::parse_fixture`]).
    #[must_use]
    pub fn from_fixture(header: &str, rows: &[&str]) -> Self {
        Self::new(
            TableSpec::from_header(header),
            rows.iter()
                .map(|line| DataRow::parse_fixture(line).into_ref())
                .collect(),
        )
    }

    #[must_use]
    pub const fn spec(&self) -> &TableSpec {
        &self.spec
    }

    #[must_use]
    pub fn rows(&self) -> &[RowRef] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows paired with their offsets, in table order.
    pub fn iter_with_offsets(&self) -> impl Iterator<Item = (u64, &RowRef)> + '_ {
        self.rows.iter().enumerate().map(|(i, row)| (i as u64, row))
    }
}
