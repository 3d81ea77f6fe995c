//! Per-input join settings: join clauses, included columns, and the column
//! mappings derived from them.

use std::fmt;

use tracing::debug;

use hashjoin_error::{JoinError, Result};
use hashjoin_types::{DataCell, DataRow, DataTable, InputTable, TableSpec};

use crate::tuple::{CellComparisonMode, JoinTuple};

/// Column name that stands for the row key in join clauses.
pub const ROW_KEY_COLUMN_NAME: &str = "$RowID$";

/// One side of a join clause: a named column or the row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JoinColumn {
    Column(String),
    RowKey,
}

impl JoinColumn {
    /// Parse a column name; [`ROW_KEY_COLUMN_NAME`] selects the row key.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name == ROW_KEY_COLUMN_NAME {
            Self::RowKey
        } else {
            Self::Column(name.to_owned())
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Column(name) => name,
            Self::RowKey => ROW_KEY_COLUMN_NAME,
        }
    }

    #[must_use]
    pub const fn is_column(&self) -> bool {
        matches!(self, Self::Column(_))
    }

    /// Build a list of join columns from names.
    #[must_use]
    pub fn list(names: &[&str]) -> Vec<Self> {
        names.iter().map(|n| Self::from_name(n)).collect()
    }
}

impl fmt::Display for JoinColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved position of a join clause column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRef {
    Index(usize),
    RowKey,
}

/// Settings of one join input.
#[derive(Debug, Clone)]
pub struct JoinTableSettings {
    side: InputTable,
    retain_unmatched: bool,
    join_clauses: Vec<JoinColumn>,
    join_clause_columns: Vec<ColumnRef>,
    include_column_names: Vec<String>,
    include_columns: Vec<usize>,
    materialize_columns: Vec<usize>,
    table_spec: TableSpec,
    materialized_cells: Option<u64>,
}

impl JoinTableSettings {
    /// Validate and resolve settings against `spec`.
    ///
    /// # Errors
    /// [`JoinError::InvalidSettings`] if no join columns are given or a named
    /// join or include column does not exist in `spec`.
    pub fn new(
        retain_unmatched: bool,
        join_columns: Vec<JoinColumn>,
        include_columns: &[&str],
        side: InputTable,
        spec: &TableSpec,
    ) -> Result<Self> {
        if join_columns.is_empty() {
            return Err(JoinError::invalid_settings("no join columns passed"));
        }

        validate_names(
            include_columns.iter().copied(),
            "include",
            spec,
        )?;
        validate_names(
            join_columns
                .iter()
                .filter_map(|c| match c {
                    JoinColumn::Column(name) => Some(name.as_str()),
                    JoinColumn::RowKey => None,
                }),
            "join",
            spec,
        )?;

        let join_clause_columns: Vec<ColumnRef> = join_columns
            .iter()
            .map(|c| match c {
                JoinColumn::RowKey => Ok(ColumnRef::RowKey),
                JoinColumn::Column(name) => spec
                    .find_column_index(name)
                    .map(ColumnRef::Index)
                    .ok_or_else(|| JoinError::internal(format!("column {name} vanished"))),
            })
            .collect::<Result<_>>()?;

        let include_indices: Vec<usize> = include_columns
            .iter()
            .filter_map(|name| spec.find_column_index(name))
            .collect();

        // Every real column is materialized once, in table order.
        let mut materialize_columns: Vec<usize> = join_clause_columns
            .iter()
            .filter_map(|c| match c {
                ColumnRef::Index(i) => Some(*i),
                ColumnRef::RowKey => None,
            })
            .chain(include_indices.iter().copied())
            .collect();
        materialize_columns.sort_unstable();
        materialize_columns.dedup();

        debug!(
            side = %side,
            clauses = join_columns.len(),
            includes = include_indices.len(),
            materialized = materialize_columns.len(),
            "join table settings resolved"
        );

        Ok(Self {
            side,
            retain_unmatched,
            join_clauses: join_columns,
            join_clause_columns,
            include_column_names: include_columns.iter().map(|s| (*s).to_owned()).collect(),
            include_columns: include_indices,
            materialize_columns,
            table_spec: spec.clone(),
            materialized_cells: None,
        })
    }

    /// Attach the input table: adopt its spec and estimate its size as
    /// materialized columns times rows.
    #[must_use]
    pub fn with_table(mut self, table: &DataTable) -> Self {
        self.materialized_cells =
            Some(self.materialize_columns.len() as u64 * table.len() as u64);
        self.table_spec = table.spec().clone();
        self
    }

    /// The same settings reduced to the single join clause `clause`.
    ///
    /// # Errors
    /// [`JoinError::InvalidSettings`] if `clause` is out of range.
    pub fn using_only_join_clause(&self, clause: usize) -> Result<Self> {
        let column = self.join_clauses.get(clause).ok_or_else(|| {
            JoinError::invalid_settings(format!(
                "cannot reduce join input table settings to join clause {clause}, it does not exist"
            ))
        })?;
        let includes: Vec<&str> = self.include_column_names.iter().map(String::as_str).collect();
        let mut reduced = Self::new(
            self.retain_unmatched,
            vec![column.clone()],
            &includes,
            self.side,
            &self.table_spec,
        )?;
        reduced.materialized_cells = self.materialized_cells;
        Ok(reduced)
    }

    /// Project `row` onto the join clause columns, normalized by `mode`.
    /// `None` if any of those cells is missing.
    #[must_use]
    pub fn join_tuple(&self, row: &DataRow, mode: CellComparisonMode) -> Option<JoinTuple> {
        JoinTuple::from_cells(self.join_clause_columns.iter().map(|c| match c {
            ColumnRef::RowKey => DataCell::string(row.key().as_str()),
            ColumnRef::Index(i) => mode.normalize(row.cell(*i)),
        }))
    }

    #[must_use]
    pub const fn side(&self) -> InputTable {
        self.side
    }

    #[must_use]
    pub const fn is_retain_unmatched(&self) -> bool {
        self.retain_unmatched
    }

    pub(crate) fn set_retain_unmatched(&mut self, retain: bool) {
        self.retain_unmatched = retain;
    }

    #[must_use]
    pub fn join_clauses(&self) -> &[JoinColumn] {
        &self.join_clauses
    }

    #[must_use]
    pub fn join_clause_columns(&self) -> &[ColumnRef] {
        &self.join_clause_columns
    }

    #[must_use]
    pub fn include_column_names(&self) -> &[String] {
        &self.include_column_names
    }

    #[must_use]
    pub fn include_columns(&self) -> &[usize] {
        &self.include_columns
    }

    #[must_use]
    pub fn materialize_columns(&self) -> &[usize] {
        &self.materialize_columns
    }

    #[must_use]
    pub const fn table_spec(&self) -> &TableSpec {
        &self.table_spec
    }

    /// Size estimate, present once a table was attached.
    #[must_use]
    pub const fn materialized_cells(&self) -> Option<u64> {
        self.materialized_cells
    }
}

fn validate_names<'a>(
    names: impl Iterator<Item = &'a str>,
    column_type: &str,
    spec: &TableSpec,
) -> Result<()> {
    let invalid: Vec<&str> = names.filter(|n| !spec.contains_name(n)).collect();
    if invalid.is_empty() {
        return Ok(());
    }
    Err(JoinError::invalid_settings(format!(
        "the {column_type} column names {invalid:?} do not exist in the target table, \
         which only specifies the column names {:?}",
        spec.column_names()
    )))
}
