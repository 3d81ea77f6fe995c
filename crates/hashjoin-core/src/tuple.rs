//! Join tuples and the hashing strategies that key them.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use hashjoin_error::Result;
use hashjoin_types::DataCell;

use crate::codec::encode_cell;

/// How join column values are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CellComparisonMode {
    /// Type and value must agree.
    #[default]
    Strict,
    /// Cells are compared by their string rendering.
    AsString,
    /// `Int` cells are widened to `Long` before comparing.
    NumericAsLong,
}

impl CellComparisonMode {
    /// Normalize `cell` so that cells equal under this mode are equal as values.
    #[must_use]
    pub fn normalize(self, cell: &DataCell) -> DataCell {
        match self {
            Self::Strict => cell.clone(),
            Self::AsString => match cell {
                DataCell::Missing | DataCell::String(_) => cell.clone(),
                other => DataCell::String(other.to_string()),
            },
            Self::NumericAsLong => cell.widened_to_long(),
        }
    }
}

/// The normalized join column values of one row, one per join clause.
///
/// Never contains a missing cell: rows with a missing join value have no tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinTuple(SmallVec<[DataCell; 4]>);

impl JoinTuple {
    /// Build a tuple, or `None` if any cell is missing.
    pub fn from_cells<I>(cells: I) -> Option<Self>
    where
        I: IntoIterator<Item = DataCell>,
    {
        let cells: SmallVec<[DataCell; 4]> = cells.into_iter().collect();
        if cells.iter().any(DataCell::is_missing) {
            return None;
        }
        Some(Self(cells))
    }

    #[must_use]
    pub fn cells(&self) -> &[DataCell] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sub-tuple made of the given positions, in the given order.
    #[must_use]
    pub fn project(&self, positions: &[usize]) -> Self {
        Self(positions.iter().map(|&p| self.0[p].clone()).collect())
    }

    /// xxh3 of the canonical encoding of the cells at `positions`.
    pub fn hash_positions(&self, positions: Option<&[usize]>) -> Result<u64> {
        let mut buf = Vec::with_capacity(16 * self.0.len());
        match positions {
            None => {
                for cell in &self.0 {
                    encode_cell(cell, true, &mut buf)?;
                }
            }
            Some(positions) => {
                for &p in positions {
                    encode_cell(&self.0[p], true, &mut buf)?;
                }
            }
        }
        Ok(xxh3_64(&buf))
    }
}

impl fmt::Display for JoinTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, cell) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{cell}")?;
        }
        f.write_str(")")
    }
}

/// Which tuple positions take part in hashing and equality.
///
/// A conjunctive join uses every position. A disjunctive join keeps one index
/// per clause group and each of those only looks at the group's positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashingStrategy {
    Conjunctive,
    Clause {
        group: usize,
        positions: Vec<usize>,
    },
}

impl HashingStrategy {
    /// Canonical key for hash map lookups under this strategy.
    #[must_use]
    pub fn key(&self, tuple: &JoinTuple) -> JoinTuple {
        match self {
            Self::Conjunctive => tuple.clone(),
            Self::Clause { positions, .. } => tuple.project(positions),
        }
    }

    /// Partition hash. Tuples with equal keys hash identically.
    pub fn hash(&self, tuple: &JoinTuple) -> Result<u64> {
        match self {
            Self::Conjunctive => tuple.hash_positions(None),
            Self::Clause { positions, .. } => tuple.hash_positions(Some(positions)),
        }
    }

    /// Partition in `0..num_partitions` for `tuple`.
    pub fn partition(&self, tuple: &JoinTuple, num_partitions: usize) -> Result<usize> {
        let n = num_partitions.max(1) as u64;
        Ok((self.hash(tuple)? % n) as usize)
    }
}
