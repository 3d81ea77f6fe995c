//! In-memory hash index over the rows of the hash input.
//!
//! The index stores each hash row once, in insertion order, and refers to it
//! through a [`RowHandle`]. A conjunctive join keeps one map from the full
//! join tuple to handles. A disjunctive join keeps one map per clause group,
//! keyed by the group's projection of the tuple; a probe looks up every map
//! and merges the handles by original row offset, dropping duplicates.
//!
//! When the hash side retains unmatched rows, a bitset records which rows
//! found a partner, so the leftovers can be swept after probing.
//!
//! Rows without a join tuple (a missing join value) are never indexed; they
//! are reported as unmatched right away.

use std::sync::Arc;

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use hashjoin_error::{JoinError, Result};
use hashjoin_types::{Cx, InputTable, RowRef};

use crate::instrumentation;
use crate::results::JoinResult;
use crate::spec::JoinSpecification;
use crate::spill::DiskBucket;
use crate::tuple::{HashingStrategy, JoinTuple};

/// Position of a row in a [`HashIndex`]'s row list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowHandle(u32);

impl RowHandle {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

type Bucket = SmallVec<[RowHandle; 2]>;

// ── Matched-row bitset ─────────────────────────────────────────────────────

/// Growable bit vector. Bits only ever go from clear to set.
#[derive(Debug, Clone, Default)]
pub struct MatchedBits {
    words: Vec<u64>,
    len: usize,
}

impl MatchedBits {
    /// `len` clear bits.
    #[must_use]
    pub fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Append a clear bit.
    pub fn push(&mut self) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        self.len += 1;
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len, "bit {index} out of range {}", self.len);
        self.words[index / 64] |= 1 << (index % 64);
    }

    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First clear bit at or after `from`.
    #[must_use]
    pub fn next_clear_bit(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }
        let mut word_index = from / 64;
        // Treat bits below `from` as set.
        let mut word = self.words[word_index] | ((1_u64 << (from % 64)) - 1);
        loop {
            if word != u64::MAX {
                let bit = word_index * 64 + (!word).trailing_zeros() as usize;
                return (bit < self.len).then_some(bit);
            }
            word_index += 1;
            word = *self.words.get(word_index)?;
        }
    }
}

// ── Hash index ─────────────────────────────────────────────────────────────

/// Hash index over one partition of the hash input.
#[derive(Debug)]
pub struct HashIndex {
    spec: Arc<JoinSpecification>,
    hash_side: InputTable,
    strategies: Vec<HashingStrategy>,
    indexes: Vec<HashMap<JoinTuple, Bucket>>,
    rows: Vec<RowRef>,
    row_offsets: Vec<u64>,
    matched: Option<MatchedBits>,
    cells_per_row: u64,
    emitted_matches: u64,
    cx: Cx,
}

impl HashIndex {
    /// Empty index for rows of `hash_side`.
    #[must_use]
    pub fn new(spec: Arc<JoinSpecification>, hash_side: InputTable, cx: Cx) -> Self {
        let strategies = spec.hashing_strategies();
        let indexes = strategies.iter().map(|_| HashMap::new()).collect();
        let matched = spec
            .is_retain_unmatched(hash_side)
            .then(MatchedBits::default);
        let cells_per_row = spec.settings(hash_side).materialize_columns().len() as u64;
        Self {
            spec,
            hash_side,
            strategies,
            indexes,
            rows: Vec::new(),
            row_offsets: Vec::new(),
            matched,
            cells_per_row,
            emitted_matches: 0,
            cx,
        }
    }

    #[must_use]
    pub const fn hash_side(&self) -> InputTable {
        self.hash_side
    }

    #[must_use]
    pub const fn probe_side(&self) -> InputTable {
        self.hash_side.other()
    }

    /// Number of indexed rows. Rows without a join tuple are not counted.
    #[must_use]
    pub fn num_added_rows(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Materialized cells held, for memory accounting.
    #[must_use]
    pub fn materialized_cells(&self) -> u64 {
        self.rows.len() as u64 * self.cells_per_row
    }

    /// Matching pairs handed to a sink so far.
    #[must_use]
    pub const fn emitted_matches(&self) -> u64 {
        self.emitted_matches
    }

    /// Whether unmatched hash rows are tracked.
    #[must_use]
    pub const fn tracks_unmatched(&self) -> bool {
        self.matched.is_some()
    }

    /// Index `row`, or report it unmatched to `sink` if `tuple` is `None`.
    ///
    /// `tuple` must be the row's join tuple as extracted for the hash side.
    pub fn add_hash_row(
        &mut self,
        tuple: Option<JoinTuple>,
        row: RowRef,
        offset: u64,
        sink: &mut dyn JoinResult,
    ) -> Result<()> {
        let Some(tuple) = tuple else {
            trace!(side = %self.hash_side, offset, "hash row without join tuple");
            sink.add_unmatched(self.hash_side, &row, offset)?;
            return Ok(());
        };

        let handle = u32::try_from(self.rows.len())
            .map(RowHandle)
            .map_err(|_| JoinError::internal("hash index holds more than u32::MAX rows"))?;

        if let [HashingStrategy::Conjunctive] = self.strategies.as_slice() {
            self.indexes[0].entry(tuple).or_default().push(handle);
        } else {
            for (strategy, index) in self.strategies.iter().zip(&mut self.indexes) {
                index.entry(strategy.key(&tuple)).or_default().push(handle);
            }
        }

        self.rows.push(row);
        self.row_offsets.push(offset);
        if let Some(matched) = &mut self.matched {
            matched.push();
        }
        instrumentation::record_row_indexed();
        Ok(())
    }

    /// Extract the hash-side tuple of `row` and index it.
    pub fn add_row(&mut self, row: RowRef, offset: u64, sink: &mut dyn JoinResult) -> Result<()> {
        let tuple = self.spec.join_tuple(self.hash_side, &row);
        self.add_hash_row(tuple, row, offset, sink)
    }

    /// Handles of every indexed row matching `tuple`, ordered by original
    /// offset and free of duplicates.
    fn merged_clause_matches(&self, tuple: &JoinTuple) -> SmallVec<[RowHandle; 4]> {
        let mut hits: SmallVec<[(u64, RowHandle); 4]> = SmallVec::new();
        for (strategy, index) in self.strategies.iter().zip(&self.indexes) {
            if let Some(bucket) = index.get(&strategy.key(tuple)) {
                hits.extend(bucket.iter().map(|&h| (self.row_offsets[h.index()], h)));
            }
        }
        hits.sort_unstable();
        hits.dedup();
        hits.into_iter().map(|(_, h)| h).collect()
    }

    /// Join `probe_row` against the index, reporting matches to `sink` in
    /// insertion order, or the probe row as unmatched if there are none.
    pub fn join_single_row(
        &mut self,
        probe_row: &RowRef,
        probe_offset: u64,
        sink: &mut dyn JoinResult,
    ) -> Result<()> {
        let probe_side = self.probe_side();
        let Some(tuple) = self.spec.join_tuple(probe_side, probe_row) else {
            sink.add_unmatched(probe_side, probe_row, probe_offset)?;
            instrumentation::record_probe();
            return Ok(());
        };

        let merged;
        let matches: &[RowHandle] = if let [HashingStrategy::Conjunctive] =
            self.strategies.as_slice()
        {
            self.indexes[0]
                .get(&tuple)
                .map(|bucket| bucket.as_slice())
                .unwrap_or(&[])
        } else {
            merged = self.merged_clause_matches(&tuple);
            &merged
        };

        instrumentation::record_probe();
        if matches.is_empty() {
            sink.add_unmatched(probe_side, probe_row, probe_offset)?;
            return Ok(());
        }

        for &handle in matches {
            self.cx.checkpoint_with("hash index probe")?;
            if let Some(bits) = &mut self.matched {
                bits.set(handle.index());
            }
            let hash_row = &self.rows[handle.index()];
            let hash_offset = self.row_offsets[handle.index()];
            if self.hash_side.is_left() {
                sink.add_match(hash_row, hash_offset, probe_row, probe_offset)?;
            } else {
                sink.add_match(probe_row, probe_offset, hash_row, hash_offset)?;
            }
            self.emitted_matches += 1;
            instrumentation::record_match();
        }
        Ok(())
    }

    /// Call `handler` for every indexed row that never matched, in insertion
    /// order. Does nothing unless unmatched rows are tracked.
    pub fn for_unmatched_hash_rows<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(&RowRef, u64) -> Result<()>,
    {
        let Some(bits) = &self.matched else {
            return Ok(());
        };
        let mut next = bits.next_clear_bit(0);
        while let Some(i) = next {
            self.cx.checkpoint_with("unmatched hash rows")?;
            handler(&self.rows[i], self.row_offsets[i])?;
            next = bits.next_clear_bit(i + 1);
        }
        Ok(())
    }

    /// Report every unmatched hash row to `sink`.
    pub fn report_unmatched(&self, sink: &mut dyn JoinResult) -> Result<()> {
        let side = self.hash_side;
        self.for_unmatched_hash_rows(|row, offset| sink.add_unmatched(side, row, offset).map(drop))
    }

    /// The input to probe with: the one with more materialized cells, left on
    /// a tie. Missing estimates count as zero.
    #[must_use]
    pub fn bigger_table(spec: &JoinSpecification) -> InputTable {
        let cells = |side| spec.settings(side).materialized_cells().unwrap_or(0);
        if cells(InputTable::Left) >= cells(InputTable::Right) {
            InputTable::Left
        } else {
            InputTable::Right
        }
    }

    /// The input to index: the other one.
    #[must_use]
    pub fn smaller_table(spec: &JoinSpecification) -> InputTable {
        Self::bigger_table(spec).other()
    }

    /// Move every indexed row to `bucket`, in insertion order. The index is
    /// consumed; its maps are dropped.
    pub fn to_disk(self, bucket: &mut DiskBucket) -> Result<()> {
        debug!(
            side = %self.hash_side,
            rows = self.rows.len(),
            "hash index moved to disk"
        );
        for (row, &offset) in self.rows.iter().zip(&self.row_offsets) {
            self.cx.checkpoint_with("hash index to disk")?;
            bucket.add(row, offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{JoinColumn, JoinTableSettings};
    use crate::spec::JoinMode;
    use hashjoin_types::{DataRow, DataTable, TableSpec};
    use proptest::prelude::*;

    /// Records every report, in order.
    #[derive(Default)]
    struct Recorder {
        matches: Vec<(String, u64, String, u64)>,
        unmatched: Vec<(InputTable, String, u64)>,
    }

    impl JoinResult for Recorder {
        fn add_match(&mut self, l: &RowRef, lo: u64, r: &RowRef, ro: u64) -> Result<bool> {
            self.matches
                .push((l.key().to_string(), lo, r.key().to_string(), ro));
            Ok(true)
        }

        fn add_unmatched(&mut self, side: InputTable, row: &RowRef, offset: u64) -> Result<bool> {
            self.unmatched.push((side, row.key().to_string(), offset));
            Ok(true)
        }
    }

    const HEADER: &str = "a,b";

    fn spec(join: &[&str], conjunctive: bool, mode: JoinMode) -> Arc<JoinSpecification> {
        let table = TableSpec::from_header(HEADER);
        let side = |s| {
            JoinTableSettings::new(true, JoinColumn::list(join), &["a", "b"], s, &table).unwrap()
        };
        Arc::new(
            JoinSpecification::builder(side(InputTable::Left), side(InputTable::Right))
                .conjunctive(conjunctive)
                .join_mode(mode)
                .build()
                .unwrap(),
        )
    }

    fn row(line: &str) -> RowRef {
        DataRow::parse_fixture(line).into_ref()
    }

    #[test]
    fn bitset_next_clear_bit() {
        let mut bits = MatchedBits::default();
        assert_eq!(bits.next_clear_bit(0), None);
        for _ in 0..130 {
            bits.push();
        }
        for i in 0..128 {
            bits.set(i);
        }
        bits.set(129);
        assert_eq!(bits.next_clear_bit(0), Some(128));
        assert_eq!(bits.next_clear_bit(129), None);
        assert_eq!(bits.next_clear_bit(500), None);
        assert!(bits.is_set(63) && !bits.is_set(128) && !bits.is_set(1000));

        let mut sparse = MatchedBits::default();
        for _ in 0..3 {
            sparse.push();
        }
        sparse.set(1);
        assert_eq!(sparse.next_clear_bit(1), Some(2));
        assert_eq!(sparse.len(), 3);
    }

    #[test]
    fn conjunctive_matches_come_in_insertion_order() {
        let spec = spec(&["a"], true, JoinMode::Inner);
        let mut index = HashIndex::new(spec, InputTable::Left, Cx::new());
        let mut sink = Recorder::default();
        index.add_row(row("h0,k,1"), 0, &mut sink).unwrap();
        index.add_row(row("h1,z,2"), 1, &mut sink).unwrap();
        index.add_row(row("h2,k,3"), 2, &mut sink).unwrap();
        assert_eq!(index.num_added_rows(), 3);

        index.join_single_row(&row("p0,k,9"), 7, &mut sink).unwrap();
        assert_eq!(
            sink.matches,
            vec![
                ("h0".into(), 0, "p0".into(), 7),
                ("h2".into(), 2, "p0".into(), 7),
            ],
            "hash side is left, so the hash row is reported first"
        );
    }

    #[test]
    fn probe_without_partner_is_unmatched() {
        let spec = spec(&["a"], true, JoinMode::FullOuter);
        let mut index = HashIndex::new(spec, InputTable::Right, Cx::new());
        let mut sink = Recorder::default();
        index.join_single_row(&row("p0,k,1"), 3, &mut sink).unwrap();
        index.join_single_row(&row("p1,?,1"), 4, &mut sink).unwrap();
        assert!(sink.matches.is_empty(), "empty index never matches");
        assert_eq!(
            sink.unmatched,
            vec![
                (InputTable::Left, "p0".into(), 3),
                (InputTable::Left, "p1".into(), 4),
            ]
        );
    }

    #[test]
    fn rows_without_tuple_are_not_indexed() {
        let spec = spec(&["a", "b"], true, JoinMode::FullOuter);
        let mut index = HashIndex::new(spec, InputTable::Right, Cx::new());
        let mut sink = Recorder::default();
        index.add_row(row("h0,?,1"), 0, &mut sink).unwrap();
        index.add_row(row("h1,x,1"), 1, &mut sink).unwrap();
        assert_eq!(index.num_added_rows(), 1);
        assert_eq!(sink.unmatched, vec![(InputTable::Right, "h0".into(), 0)]);

        sink.unmatched.clear();
        index.report_unmatched(&mut sink).unwrap();
        assert_eq!(
            sink.unmatched,
            vec![(InputTable::Right, "h1".into(), 1)],
            "the missing-value row is not swept a second time"
        );
    }

    #[test]
    fn disjunctive_union_is_deduplicated_and_offset_ordered() {
        let spec = spec(&["a", "b"], false, JoinMode::Inner);
        let mut index = HashIndex::new(spec, InputTable::Right, Cx::new());
        let mut sink = Recorder::default();
        // Offsets deliberately out of insertion order.
        index.add_row(row("h0,x,1"), 5, &mut sink).unwrap();
        index.add_row(row("h1,y,2"), 2, &mut sink).unwrap();
        index.add_row(row("h2,x,2"), 9, &mut sink).unwrap();
        index.add_row(row("h3,q,q"), 0, &mut sink).unwrap();

        index.join_single_row(&row("p0,x,2"), 1, &mut sink).unwrap();
        let hash_offsets: Vec<u64> = sink.matches.iter().map(|m| m.3).collect();
        assert_eq!(
            hash_offsets,
            vec![2, 5, 9],
            "h2 matches both clauses but is reported once"
        );
    }

    #[test]
    fn matched_bits_drive_the_sweep() {
        let spec = spec(&["a"], true, JoinMode::LeftOuter);
        let mut index = HashIndex::new(spec, InputTable::Left, Cx::new());
        assert!(index.tracks_unmatched());
        let mut sink = Recorder::default();
        for (i, line) in ["h0,a,1", "h1,b,1", "h2,c,1"].iter().enumerate() {
            index.add_row(row(line), i as u64, &mut sink).unwrap();
        }
        index.join_single_row(&row("p,b,1"), 0, &mut sink).unwrap();
        index.join_single_row(&row("p,b,1"), 1, &mut sink).unwrap();

        let mut swept = Vec::new();
        index
            .for_unmatched_hash_rows(|r, o| {
                swept.push((r.key().to_string(), o));
                Ok(())
            })
            .unwrap();
        assert_eq!(swept, vec![("h0".into(), 0), ("h2".into(), 2)]);
    }

    #[test]
    fn sweep_is_noop_without_tracking() {
        let spec = spec(&["a"], true, JoinMode::Inner);
        let mut index = HashIndex::new(spec, InputTable::Left, Cx::new());
        assert!(!index.tracks_unmatched());
        let mut sink = Recorder::default();
        index.add_row(row("h0,a,1"), 0, &mut sink).unwrap();
        let mut calls = 0;
        index
            .for_unmatched_hash_rows(|_, _| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn cancellation_stops_probing() {
        let spec = spec(&["a"], true, JoinMode::Inner);
        let cx = Cx::new();
        let mut index = HashIndex::new(spec, InputTable::Left, cx.clone());
        let mut sink = Recorder::default();
        index.add_row(row("h0,a,1"), 0, &mut sink).unwrap();
        cx.cancel_handle().cancel();
        let err = index
            .join_single_row(&row("p,a,1"), 0, &mut sink)
            .unwrap_err();
        assert!(err.is_canceled());
        assert!(sink.matches.is_empty());
    }

    /// Requests cancellation when it receives its first match.
    struct CancelOnFirstMatch {
        handle: hashjoin_types::CancelHandle,
        matches: usize,
    }

    impl JoinResult for CancelOnFirstMatch {
        fn add_match(&mut self, _: &RowRef, _: u64, _: &RowRef, _: u64) -> Result<bool> {
            self.matches += 1;
            self.handle.cancel();
            Ok(true)
        }

        fn add_unmatched(&mut self, _: InputTable, _: &RowRef, _: u64) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn cancellation_mid_match_list_stops_emitting() {
        let spec = spec(&["a"], true, JoinMode::Inner);
        let cx = Cx::new();
        let mut index = HashIndex::new(spec, InputTable::Left, cx.clone());
        let mut recorder = Recorder::default();
        for (offset, line) in ["h0,a,1", "h1,a,2", "h2,a,3"].iter().enumerate() {
            index.add_row(row(line), offset as u64, &mut recorder).unwrap();
        }

        let mut sink = CancelOnFirstMatch {
            handle: cx.cancel_handle(),
            matches: 0,
        };
        let err = index
            .join_single_row(&row("p,a,9"), 0, &mut sink)
            .unwrap_err();
        assert!(matches!(err, JoinError::Canceled), "got {err}");
        assert_eq!(sink.matches, 1);
        assert_eq!(index.emitted_matches(), 1);
    }

    #[test]
    fn bigger_table_prefers_left_on_tie() {
        let spec = spec(&["a"], true, JoinMode::Inner);
        assert_eq!(HashIndex::bigger_table(&spec), InputTable::Left);
        assert_eq!(HashIndex::smaller_table(&spec), InputTable::Right);

        let small = DataTable::from_fixture(HEADER, &["r0,a,1"]);
        let big = DataTable::from_fixture(HEADER, &["r0,a,1", "r1,b,2"]);
        let sized = (*spec).clone().with_tables(&small, &big);
        assert_eq!(HashIndex::bigger_table(&sized), InputTable::Right);
    }

    #[test]
    fn to_disk_preserves_rows_and_offsets() {
        let spec = spec(&["a"], true, JoinMode::Inner);
        let mut index = HashIndex::new(spec, InputTable::Right, Cx::new());
        let mut sink = Recorder::default();
        index.add_row(row("h0,a,1"), 4, &mut sink).unwrap();
        index.add_row(row("h1,b,2"), 1, &mut sink).unwrap();
        assert_eq!(index.materialized_cells(), 4);

        let mut bucket = DiskBucket::new(InputTable::Right, None);
        index.to_disk(&mut bucket).unwrap();
        let back = bucket.read_all().unwrap();
        let got: Vec<(String, u64)> = back
            .iter()
            .map(|(r, o)| (r.to_string(), *o))
            .collect();
        assert_eq!(got, vec![("h0,a,1".into(), 4), ("h1,b,2".into(), 1)]);
    }

    proptest! {
        #[test]
        fn next_clear_bit_agrees_with_bool_model(
            model in prop::collection::vec(any::<bool>(), 0..300),
            from in 0_usize..320,
        ) {
            let mut bits = MatchedBits::default();
            for _ in &model {
                bits.push();
            }
            let mut sized = MatchedBits::with_len(model.len());
            for (i, set) in model.iter().enumerate() {
                if *set {
                    bits.set(i);
                    sized.set(i);
                }
            }
            let expected = (from..model.len()).find(|&i| !model[i]);
            prop_assert_eq!(bits.next_clear_bit(from), expected);
            prop_assert_eq!(sized.next_clear_bit(from), expected);
            prop_assert_eq!(bits.len(), model.len());
            for (i, set) in model.iter().enumerate() {
                prop_assert_eq!(bits.is_set(i), *set);
            }
        }
    }
}
