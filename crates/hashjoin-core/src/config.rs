//! Execution settings of the hybrid hash join.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hashjoin_error::{JoinError, Result};

/// Tuning knobs for [`crate::HybridHashJoin`].
///
/// Missing fields take their default when parsed from TOML:
///
/// ```toml
/// num_partitions = 32
/// memory_budget_cells = 50000000
/// spill_dir = "/var/tmp/hashjoin"
/// cancel_check_interval = 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Number of hash partitions; each can spill independently.
    pub num_partitions: usize,
    /// Materialized cells the in-memory partitions may hold before the next
    /// one is moved to disk.
    pub memory_budget_cells: u64,
    /// Directory for spill files; the system temp directory if unset.
    pub spill_dir: Option<PathBuf>,
    /// Poll the cancel flag every this many checkpoints.
    pub cancel_check_interval: u32,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            num_partitions: 32,
            memory_budget_cells: 50_000_000,
            spill_dir: None,
            cancel_check_interval: 1,
        }
    }
}

impl JoinConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| JoinError::Config {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the join cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(JoinError::Config {
                detail: "num_partitions must be at least 1".to_owned(),
            });
        }
        if self.cancel_check_interval == 0 {
            return Err(JoinError::Config {
                detail: "cancel_check_interval must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_num_partitions(mut self, n: usize) -> Self {
        self.num_partitions = n;
        self
    }

    #[must_use]
    pub const fn with_memory_budget_cells(mut self, cells: u64) -> Self {
        self.memory_budget_cells = cells;
        self
    }

    #[must_use]
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }
}
