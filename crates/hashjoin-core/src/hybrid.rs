//! Hybrid hash join.
//!
//! The smaller input is hashed into partitions held as in-memory
//! [`HashIndex`]es. When the partitions outgrow the memory budget, the lowest
//! in-memory partition is moved to disk, and every later hash row that falls
//! into it goes straight to its disk bucket.
//!
//! 1. Index the hash input, spilling partitions as needed.
//! 2. Stream the probe input. Rows of in-memory partitions are joined right
//!    away; rows of spilled partitions are written to the partition's probe
//!    bucket. Then the in-memory indexes report their unmatched rows.
//! 3. Join every spilled partition by reloading its hash bucket into a fresh
//!    index and probing it with the partition's probe bucket. A hash bucket
//!    larger than the budget is reloaded in blocks, each probed with the
//!    whole probe bucket.
//!
//! Each step ends a sorted chunk, so the [`JoinContainer`] can restore the
//! requested output order with an n-way merge.

use std::path::PathBuf;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, debug_span, info, warn};

use hashjoin_error::{JoinError, Result};
use hashjoin_types::{Cx, DataTable, InputTable, RowRef};

use crate::config::JoinConfig;
use crate::hash_index::{HashIndex, MatchedBits};
use crate::instrumentation;
use crate::results::{JoinContainer, JoinResult, JoinResults};
use crate::spec::JoinSpecification;
use crate::spill::DiskBucket;
use crate::tuple::{HashingStrategy, JoinTuple};

/// Partitioned, disk-spilling equi-join of two tables.
#[derive(Debug)]
pub struct HybridHashJoin {
    spec: JoinSpecification,
    config: JoinConfig,
    cx: Cx,
}

impl HybridHashJoin {
    /// Prepare a join. `cx` is sampled every `config.cancel_check_interval`
    /// checkpoints.
    ///
    /// # Errors
    /// [`JoinError::Config`] if `config` is invalid.
    pub fn new(spec: JoinSpecification, config: JoinConfig, cx: &Cx) -> Result<Self> {
        config.validate()?;
        let cx = cx.restrict(config.cancel_check_interval);
        Ok(Self { spec, config, cx })
    }

    #[must_use]
    pub const fn spec(&self) -> &JoinSpecification {
        &self.spec
    }

    #[must_use]
    pub const fn config(&self) -> &JoinConfig {
        &self.config
    }

    /// Join `left` with `right`.
    ///
    /// # Errors
    /// [`JoinError::Canceled`] if cancellation was requested, spill I/O or
    /// corruption errors otherwise.
    pub fn join(&self, left: &DataTable, right: &DataTable) -> Result<JoinResults> {
        let result = self.run(left, right);
        if let Err(err) = &result {
            if err.is_canceled() {
                instrumentation::record_cancellation();
                info!("hybrid hash join canceled");
            } else {
                warn!(error = %err, "hybrid hash join failed");
            }
        }
        result
    }

    fn run(&self, left: &DataTable, right: &DataTable) -> Result<JoinResults> {
        let spec = Arc::new(self.spec.clone().with_tables(left, right));
        if spec.is_empty_join() {
            debug!("nothing retained, skipping join");
            return Ok(JoinResults::empty(&spec));
        }

        let probe_side = HashIndex::bigger_table(&spec);
        let hash_side = probe_side.other();
        let (hash_table, probe_table) = if probe_side.is_left() {
            (right, left)
        } else {
            (left, right)
        };

        let _span = debug_span!(
            "hybrid_hash_join",
            probe = %probe_side,
            hash_rows = hash_table.len(),
            probe_rows = probe_table.len(),
            partitions = self.config.num_partitions,
        )
        .entered();

        let mut container = JoinContainer::new(Arc::clone(&spec), probe_side);
        let mut partitions = Partitions::new(spec, hash_side, &self.config, &self.cx);

        self.phase1(hash_table, &mut partitions, &mut container)?;
        self.phase2(probe_table, &mut partitions, &mut container)?;
        let spilled = partitions.first_in_memory;
        self.phase3(partitions, &mut container)?;

        let results = container.finish();
        info!(
            matches = results.matches().len(),
            left_unmatched = results.left_outer().len(),
            right_unmatched = results.right_outer().len(),
            spilled_partitions = spilled,
            "hybrid hash join finished"
        );
        Ok(results)
    }

    fn phase1(
        &self,
        hash_table: &DataTable,
        partitions: &mut Partitions,
        sink: &mut dyn JoinResult,
    ) -> Result<()> {
        for (offset, row) in hash_table.iter_with_offsets() {
            self.cx.checkpoint_with("phase 1")?;
            if partitions.in_memory_cells > self.config.memory_budget_cells {
                partitions.flush_next()?;
            }
            partitions.add_hash(row, offset, sink)?;
        }
        // Hash rows without a join tuple came in table order.
        sink.sorted_chunk_end();
        debug!(
            in_memory = partitions.num_in_memory(),
            on_disk = partitions.first_in_memory,
            cells = partitions.in_memory_cells,
            "phase 1 done: hash input partitioned"
        );
        Ok(())
    }

    fn phase2(
        &self,
        probe_table: &DataTable,
        partitions: &mut Partitions,
        sink: &mut dyn JoinResult,
    ) -> Result<()> {
        for (offset, row) in probe_table.iter_with_offsets() {
            self.cx.checkpoint_with("phase 2")?;
            partitions.process_probe(row, offset, sink)?;
        }
        sink.sorted_chunk_end();

        for index in partitions.in_memory.iter().flatten() {
            index.report_unmatched(sink)?;
            sink.sorted_chunk_end();
        }
        debug!(
            deferred_probe_rows = partitions.probe_buckets.iter().map(DiskBucket::len).sum::<u64>(),
            "phase 2 done: probe input processed"
        );
        Ok(())
    }

    fn phase3(&self, partitions: Partitions, sink: &mut dyn JoinResult) -> Result<()> {
        let Partitions {
            spec,
            hash_side,
            hash_on_disk,
            probe_buckets,
            first_in_memory,
            ..
        } = partitions;

        let cells_per_row = spec.settings(hash_side).materialize_columns().len().max(1) as u64;
        let block_rows = (self.config.memory_budget_cells / cells_per_row).max(1);

        for (partition, (hash_bucket, mut probe_bucket)) in hash_on_disk
            .into_iter()
            .zip(probe_buckets)
            .take(first_in_memory)
            .enumerate()
        {
            let mut hash_bucket = hash_bucket.ok_or_else(|| {
                JoinError::internal(format!("spilled partition {partition} has no hash bucket"))
            })?;
            let _span = debug_span!(
                "spilled_partition",
                partition,
                hash_rows = hash_bucket.len(),
                probe_rows = probe_bucket.len(),
            )
            .entered();

            if hash_bucket.len() <= block_rows {
                self.join_whole_bucket(&spec, hash_side, &mut hash_bucket, &mut probe_bucket, sink)?;
            } else {
                self.join_in_blocks(
                    &spec,
                    hash_side,
                    block_rows,
                    &mut hash_bucket,
                    &mut probe_bucket,
                    sink,
                )?;
            }
        }
        Ok(())
    }

    /// Reload the whole hash bucket into one index and probe it.
    fn join_whole_bucket(
        &self,
        spec: &Arc<JoinSpecification>,
        hash_side: InputTable,
        hash_bucket: &mut DiskBucket,
        probe_bucket: &mut DiskBucket,
        sink: &mut dyn JoinResult,
    ) -> Result<()> {
        let mut index = HashIndex::new(Arc::clone(spec), hash_side, self.cx.clone());
        for record in hash_bucket.records()? {
            let (row, offset) = record?;
            index.add_row(row, offset, sink)?;
        }
        for record in probe_bucket.records()? {
            self.cx.checkpoint_with("phase 3")?;
            let (row, offset) = record?;
            index.join_single_row(&row, offset, sink)?;
        }
        index.report_unmatched(sink)?;
        sink.sorted_chunk_end();
        debug!(matches = index.emitted_matches(), "spilled partition joined");
        Ok(())
    }

    /// Block nested loop over a hash bucket that does not fit the budget:
    /// each block of at most `block_rows` hash rows is indexed and probed with
    /// the whole probe bucket. Hash rows belong to exactly one block, so their
    /// unmatched sweep runs per block. A probe row is unmatched only if no
    /// block matched it, which is settled after the last block.
    fn join_in_blocks(
        &self,
        spec: &Arc<JoinSpecification>,
        hash_side: InputTable,
        block_rows: u64,
        hash_bucket: &mut DiskBucket,
        probe_bucket: &mut DiskBucket,
        sink: &mut dyn JoinResult,
    ) -> Result<()> {
        let probe_side = hash_side.other();
        let probe_rows = usize::try_from(probe_bucket.len())
            .map_err(|_| JoinError::internal("probe bucket too large to track"))?;
        let block_len = usize::try_from(block_rows).unwrap_or(usize::MAX);
        let mut probe_matched = MatchedBits::with_len(probe_rows);
        let mut hash_rows = hash_bucket.records()?;
        let mut blocks = 0_u64;

        loop {
            let mut index = HashIndex::new(Arc::clone(spec), hash_side, self.cx.clone());
            let mut loaded = 0_usize;
            for record in hash_rows.by_ref().take(block_len) {
                let (row, offset) = record?;
                index.add_row(row, offset, sink)?;
                loaded += 1;
            }
            if loaded == 0 {
                break;
            }
            blocks += 1;

            let mut block_sink = ProbeMatchTracker {
                inner: &mut *sink,
                probe_side,
                matched: false,
            };
            for (position, record) in probe_bucket.records()?.enumerate() {
                self.cx.checkpoint_with("phase 3 block")?;
                let (row, offset) = record?;
                block_sink.matched = false;
                index.join_single_row(&row, offset, &mut block_sink)?;
                if block_sink.matched {
                    probe_matched.set(position);
                }
            }
            index.report_unmatched(sink)?;
            sink.sorted_chunk_end();
            debug!(
                block = blocks,
                hash_rows = loaded,
                matches = index.emitted_matches(),
                "spilled block joined"
            );
        }

        if spec.is_retain_unmatched(probe_side) {
            for (position, record) in probe_bucket.records()?.enumerate() {
                let (row, offset) = record?;
                if !probe_matched.is_set(position) {
                    sink.add_unmatched(probe_side, &row, offset)?;
                }
            }
            sink.sorted_chunk_end();
        }
        instrumentation::record_spill_blocks(blocks);
        debug!(blocks, block_rows, "spilled partition joined block-wise");
        Ok(())
    }
}

/// Forwards everything except probe-side unmatched reports, and notes whether
/// the current probe row matched.
struct ProbeMatchTracker<'a, S: JoinResult + ?Sized> {
    inner: &'a mut S,
    probe_side: InputTable,
    matched: bool,
}

impl<S: JoinResult + ?Sized> JoinResult for ProbeMatchTracker<'_, S> {
    fn add_match(
        &mut self,
        left: &RowRef,
        left_offset: u64,
        right: &RowRef,
        right_offset: u64,
    ) -> Result<bool> {
        self.matched = true;
        self.inner.add_match(left, left_offset, right, right_offset)
    }

    fn add_unmatched(&mut self, side: InputTable, row: &RowRef, offset: u64) -> Result<bool> {
        if side == self.probe_side {
            return Ok(false);
        }
        self.inner.add_unmatched(side, row, offset)
    }

    fn sorted_chunk_end(&mut self) {
        self.inner.sorted_chunk_end();
    }
}

/// Hash partitions of the hash input, some in memory and the lowest
/// `first_in_memory` on disk.
struct Partitions {
    spec: Arc<JoinSpecification>,
    hash_side: InputTable,
    strategies: Vec<HashingStrategy>,
    in_memory: Vec<Option<HashIndex>>,
    hash_on_disk: Vec<Option<DiskBucket>>,
    probe_buckets: Vec<DiskBucket>,
    first_in_memory: usize,
    in_memory_cells: u64,
    spill_dir: Option<PathBuf>,
}

impl Partitions {
    fn new(spec: Arc<JoinSpecification>, hash_side: InputTable, config: &JoinConfig, cx: &Cx) -> Self {
        let n = config.num_partitions.max(1);
        let spill_dir = config.spill_dir.clone();
        Self {
            strategies: spec.hashing_strategies(),
            in_memory: (0..n)
                .map(|_| Some(HashIndex::new(Arc::clone(&spec), hash_side, cx.clone())))
                .collect(),
            hash_on_disk: (0..n).map(|_| None).collect(),
            probe_buckets: (0..n)
                .map(|_| DiskBucket::new(hash_side.other(), spill_dir.as_deref()))
                .collect(),
            first_in_memory: 0,
            in_memory_cells: 0,
            spill_dir,
            spec,
            hash_side,
        }
    }

    fn num_partitions(&self) -> usize {
        self.in_memory.len()
    }

    fn num_in_memory(&self) -> usize {
        self.num_partitions() - self.first_in_memory
    }

    /// Partitions a tuple belongs to, ascending and distinct. One for a
    /// conjunctive join; one per clause group hash for a disjunctive join.
    fn covered_partitions(&self, tuple: &JoinTuple) -> Result<SmallVec<[usize; 4]>> {
        let n = self.num_partitions();
        let mut covered = self
            .strategies
            .iter()
            .map(|s| s.partition(tuple, n))
            .collect::<Result<SmallVec<[usize; 4]>>>()?;
        covered.sort_unstable();
        covered.dedup();
        Ok(covered)
    }

    fn add_hash(&mut self, row: &RowRef, offset: u64, sink: &mut dyn JoinResult) -> Result<()> {
        let Some(tuple) = self.spec.join_tuple(self.hash_side, row) else {
            sink.add_unmatched(self.hash_side, row, offset)?;
            return Ok(());
        };
        for partition in self.covered_partitions(&tuple)? {
            if partition >= self.first_in_memory {
                let index = self.in_memory[partition].as_mut().ok_or_else(|| {
                    JoinError::internal(format!("in-memory partition {partition} missing"))
                })?;
                let before = index.materialized_cells();
                index.add_hash_row(Some(tuple.clone()), Arc::clone(row), offset, sink)?;
                self.in_memory_cells += index.materialized_cells() - before;
            } else {
                let bucket = self.hash_on_disk[partition].as_mut().ok_or_else(|| {
                    JoinError::internal(format!("spilled partition {partition} has no hash bucket"))
                })?;
                bucket.add(row, offset)?;
            }
        }
        Ok(())
    }

    fn process_probe(&mut self, row: &RowRef, offset: u64, sink: &mut dyn JoinResult) -> Result<()> {
        let probe_side = self.hash_side.other();
        let Some(tuple) = self.spec.join_tuple(probe_side, row) else {
            sink.add_unmatched(probe_side, row, offset)?;
            return Ok(());
        };
        for partition in self.covered_partitions(&tuple)? {
            if partition >= self.first_in_memory {
                let index = self.in_memory[partition].as_mut().ok_or_else(|| {
                    JoinError::internal(format!("in-memory partition {partition} missing"))
                })?;
                index.join_single_row(row, offset, sink)?;
            } else {
                self.probe_buckets[partition].add(row, offset)?;
            }
        }
        Ok(())
    }

    /// Move the lowest in-memory partition to disk. No-op once all are on disk.
    fn flush_next(&mut self) -> Result<()> {
        let partition = self.first_in_memory;
        if partition >= self.num_partitions() {
            return Ok(());
        }
        let mut bucket = DiskBucket::new(self.hash_side, self.spill_dir.as_deref());
        if let Some(index) = self.in_memory[partition].take() {
            self.in_memory_cells = self
                .in_memory_cells
                .saturating_sub(index.materialized_cells());
            index.to_disk(&mut bucket)?;
        }
        debug!(
            partition,
            rows = bucket.len(),
            bytes = bucket.bytes_written(),
            "hash partition spilled"
        );
        self.hash_on_disk[partition] = Some(bucket);
        self.first_in_memory += 1;
        instrumentation::record_partition_spilled();
        Ok(())
    }
}
