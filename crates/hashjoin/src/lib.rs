//! Hash-based equi-join of two tables.
//!
//! ```ignore
//! let spec = JoinSpecification::builder(left_settings, right_settings)
//!     .join_mode(JoinMode::FullOuter)
//!     .build()?;
//! let results = hashjoin::join_tables(&spec, &left, &right)?;
//! for row in results.single_table().rows() {
//!     println!("{row}");
//! }
//! ```

pub use hashjoin_core::{
    CellComparisonMode, ColumnRef, DEFAULT_DISAMBIGUATOR_SUFFIX, DiskBucket, HashIndex,
    HashingStrategy, HybridHashJoin, JoinColumn, JoinConfig, JoinContainer, JoinMetricsSnapshot,
    JoinMode, JoinResult, JoinResults, JoinSpecification, JoinSpecificationBuilder,
    JoinTableSettings, JoinTuple, OutputRowOrder, ROW_KEY_COLUMN_NAME, RowKeyFactory,
    RowKeyGenerator, join_metrics_snapshot, reset_join_metrics,
};
pub use hashjoin_error::{JoinError, Result};
pub use hashjoin_types::{
    CancelHandle, CellType, ColumnSpec, Cx, DataCell, DataRow, DataTable, InputTable, RowKey,
    RowRef, TableSpec,
};

/// Join `left` with `right` using the default [`JoinConfig`] and a context
/// that is never canceled.
///
/// # Errors
/// Spill I/O and corruption errors; see [`join_tables_with`].
pub fn join_tables(
    spec: &JoinSpecification,
    left: &DataTable,
    right: &DataTable,
) -> Result<JoinResults> {
    join_tables_with(spec, left, right, JoinConfig::default(), &Cx::new())
}

/// Join `left` with `right` under `config`, polling `cx` for cancellation.
///
/// # Errors
/// [`JoinError::Config`] for an invalid `config`, [`JoinError::Canceled`]
/// when `cx` is canceled, spill I/O and corruption errors otherwise.
pub fn join_tables_with(
    spec: &JoinSpecification,
    left: &DataTable,
    right: &DataTable,
    config: JoinConfig,
    cx: &Cx,
) -> Result<JoinResults> {
    tracing::debug!(
        left_rows = left.len(),
        right_rows = right.len(),
        conjunctive = spec.is_conjunctive(),
        order = %spec.output_row_order(),
        "joining tables"
    );
    HybridHashJoin::new(spec.clone(), config, cx)?.join(left, right)
}
