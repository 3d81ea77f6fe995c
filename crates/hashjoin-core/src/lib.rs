//! Hash-based equi-join engine.
//!
//! - [`hash_index`]: in-memory index over one input, probed row by row.
//! - [`results`]: sinks that collect, de-duplicate and order join output.
//! - [`hybrid`]: the partitioned join that spills to disk under memory pressure.

pub mod codec;
pub mod config;
pub mod hash_index;
pub mod hybrid;
pub mod instrumentation;
pub mod results;
pub mod settings;
pub mod spec;
pub mod spill;
pub mod tuple;

pub use config::JoinConfig;
pub use hash_index::{HashIndex, MatchedBits, RowHandle};
pub use hybrid::HybridHashJoin;
pub use instrumentation::{JoinMetricsSnapshot, join_metrics_snapshot, reset_join_metrics};
pub use results::{JoinContainer, JoinResult, JoinResults};
pub use settings::{ColumnRef, JoinColumn, JoinTableSettings, ROW_KEY_COLUMN_NAME};
pub use spec::{
    DEFAULT_DISAMBIGUATOR_SUFFIX, JoinMode, JoinSpecification, JoinSpecificationBuilder,
    OutputRowOrder, RowKeyFactory, RowKeyGenerator,
};
pub use spill::DiskBucket;
pub use tuple::{CellComparisonMode, HashingStrategy, JoinTuple};
