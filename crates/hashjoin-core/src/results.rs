//! Join result sinks.
//!
//! [`JoinResult`] is what the hash index and the hybrid join report to.
//! [`JoinContainer`] is the sink that turns those reports into output tables:
//! it removes duplicate reports of disjunctive joins, holds back unmatched
//! rows until it is certain they never matched, and restores the requested
//! output order by merging sorted chunks.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use hashbrown::HashSet;
use tracing::debug;

use hashjoin_error::Result;
use hashjoin_types::{DataTable, InputTable, RowRef};

use crate::spec::{JoinSpecification, OutputRowOrder, RowKeyGenerator};

/// Receiver of join output.
pub trait JoinResult {
    /// Report a matching pair. Returns whether the pair was kept.
    fn add_match(
        &mut self,
        left: &RowRef,
        left_offset: u64,
        right: &RowRef,
        right_offset: u64,
    ) -> Result<bool>;

    /// Report a row of `side` that has no partner. Returns whether it was kept.
    fn add_unmatched(&mut self, side: InputTable, row: &RowRef, offset: u64) -> Result<bool>;

    /// Everything reported since the previous call forms one sorted run.
    fn sorted_chunk_end(&mut self) {}
}

#[derive(Debug, Clone)]
struct MatchRecord {
    left: RowRef,
    left_offset: u64,
    right: RowRef,
    right_offset: u64,
}

#[derive(Debug, Clone)]
struct UnmatchedRecord {
    row: RowRef,
    offset: u64,
}

#[derive(Debug, Default)]
struct Chunk {
    matches: Vec<MatchRecord>,
    unmatched: [Vec<UnmatchedRecord>; 2],
}

impl Chunk {
    fn is_empty(&self) -> bool {
        self.matches.is_empty() && self.unmatched.iter().all(Vec::is_empty)
    }
}

/// Unmatched rows of a disjunctive join may match in another partition or
/// clause index later, so they are only candidates until [`JoinContainer::finish`].
#[derive(Debug, Default)]
struct DeferredUnmatched {
    candidates: BTreeMap<u64, RowRef>,
    matched: HashSet<u64>,
}

impl DeferredUnmatched {
    fn matched(&mut self, offset: u64) {
        self.matched.insert(offset);
        self.candidates.remove(&offset);
    }

    fn unmatched(&mut self, row: &RowRef, offset: u64) -> bool {
        if self.matched.contains(&offset) || self.candidates.contains_key(&offset) {
            return false;
        }
        self.candidates.insert(offset, Arc::clone(row));
        true
    }
}

/// Sink that collects, de-duplicates and orders join output.
#[derive(Debug)]
pub struct JoinContainer {
    spec: Arc<JoinSpecification>,
    probe_side: InputTable,
    deferred: Option<[DeferredUnmatched; 2]>,
    seen_matches: HashSet<(u64, u64)>,
    chunks: Vec<Chunk>,
    current: Chunk,
}

impl JoinContainer {
    /// Container for a join that probes with rows of `probe_side`.
    ///
    /// Disjunctive joins get duplicate elimination and deferred unmatched rows.
    #[must_use]
    pub fn new(spec: Arc<JoinSpecification>, probe_side: InputTable) -> Self {
        let deferred = (!spec.is_conjunctive()).then(Default::default);
        Self {
            spec,
            probe_side,
            deferred,
            seen_matches: HashSet::new(),
            chunks: Vec::new(),
            current: Chunk::default(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &JoinSpecification {
        &self.spec
    }

    #[must_use]
    pub const fn probe_side(&self) -> InputTable {
        self.probe_side
    }

    /// Combine all chunks in the requested order and project them to rows.
    #[must_use]
    pub fn finish(mut self) -> JoinResults {
        self.sorted_chunk_end();
        let spec = Arc::clone(&self.spec);
        let order = spec.output_row_order();

        let mut match_runs = Vec::with_capacity(self.chunks.len());
        let mut unmatched_runs: [Vec<Vec<UnmatchedRecord>>; 2] = Default::default();
        for chunk in self.chunks {
            match_runs.push(chunk.matches);
            let [l, r] = chunk.unmatched;
            unmatched_runs[0].push(l);
            unmatched_runs[1].push(r);
        }
        if let Some(deferred) = self.deferred {
            for (side, d) in deferred.into_iter().enumerate() {
                unmatched_runs[side].push(
                    d.candidates
                        .into_iter()
                        .map(|(offset, row)| UnmatchedRecord { row, offset })
                        .collect(),
                );
            }
        }

        let probe_is_left = self.probe_side.is_left();
        let matches = match order {
            OutputRowOrder::Arbitrary => match_runs.into_iter().flatten().collect(),
            OutputRowOrder::Deterministic => merge_runs(match_runs, |m: &MatchRecord| {
                if probe_is_left {
                    (m.left_offset, m.right_offset)
                } else {
                    (m.right_offset, m.left_offset)
                }
            }),
            OutputRowOrder::LeftRight => {
                merge_runs(match_runs, |m: &MatchRecord| (m.left_offset, m.right_offset))
            }
        };
        let [left_runs, right_runs] = unmatched_runs;
        let unmatched = [left_runs, right_runs].map(|runs| match order {
            OutputRowOrder::Arbitrary => runs.into_iter().flatten().collect::<Vec<_>>(),
            OutputRowOrder::Deterministic | OutputRowOrder::LeftRight => {
                merge_runs(runs, |u: &UnmatchedRecord| u.offset)
            }
        });

        debug!(
            matches = matches.len(),
            left_unmatched = unmatched[0].len(),
            right_unmatched = unmatched[1].len(),
            order = ?order,
            "join container finished"
        );
        JoinResults::project(&spec, &matches, &unmatched)
    }
}

impl JoinResult for JoinContainer {
    fn add_match(
        &mut self,
        left: &RowRef,
        left_offset: u64,
        right: &RowRef,
        right_offset: u64,
    ) -> Result<bool> {
        if let Some([l, r]) = &mut self.deferred {
            l.matched(left_offset);
            r.matched(right_offset);
            if self.spec.is_retain_matched()
                && !self.seen_matches.insert((left_offset, right_offset))
            {
                return Ok(false);
            }
        }
        if !self.spec.is_retain_matched() {
            return Ok(false);
        }
        self.current.matches.push(MatchRecord {
            left: Arc::clone(left),
            left_offset,
            right: Arc::clone(right),
            right_offset,
        });
        Ok(true)
    }

    fn add_unmatched(&mut self, side: InputTable, row: &RowRef, offset: u64) -> Result<bool> {
        if !self.spec.is_retain_unmatched(side) {
            return Ok(false);
        }
        if let Some(deferred) = &mut self.deferred {
            return Ok(deferred[side.index()].unmatched(row, offset));
        }
        self.current.unmatched[side.index()].push(UnmatchedRecord {
            row: Arc::clone(row),
            offset,
        });
        Ok(true)
    }

    fn sorted_chunk_end(&mut self) {
        if !self.current.is_empty() {
            self.chunks.push(std::mem::take(&mut self.current));
        }
    }
}

/// N-way merge of runs by `key`. Runs that are not sorted are sorted first;
/// ties keep run order.
fn merge_runs<T, K, F>(mut runs: Vec<Vec<T>>, key: F) -> Vec<T>
where
    K: Ord + Copy,
    F: Fn(&T) -> K,
{
    runs.retain(|r| !r.is_empty());
    for run in &mut runs {
        if !run.is_sorted_by_key(&key) {
            run.sort_by_key(&key);
        }
    }
    if runs.len() <= 1 {
        return runs.pop().unwrap_or_default();
    }

    let total = runs.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut iters: Vec<std::vec::IntoIter<T>> = runs.into_iter().map(Vec::into_iter).collect();
    let mut heads: Vec<Option<T>> = iters.iter_mut().map(Iterator::next).collect();
    let mut heap = BinaryHeap::with_capacity(heads.len());
    for (run, head) in heads.iter().enumerate() {
        if let Some(item) = head {
            heap.push(Reverse((key(item), run)));
        }
    }
    while let Some(Reverse((_, run))) = heap.pop() {
        if let Some(item) = heads[run].take() {
            out.push(item);
        }
        heads[run] = iters[run].next();
        if let Some(next) = &heads[run] {
            heap.push(Reverse((key(next), run)));
        }
    }
    out
}

// ── Results ────────────────────────────────────────────────────────────────

/// Output of a finished join.
#[derive(Debug, Clone, Default)]
pub struct JoinResults {
    matches: DataTable,
    outer: [DataTable; 2],
    single_table: DataTable,
    match_offsets: Vec<(u64, u64)>,
    unmatched_offsets: [Vec<u64>; 2],
}

impl JoinResults {
    fn project(
        spec: &JoinSpecification,
        matches: &[MatchRecord],
        unmatched: &[Vec<UnmatchedRecord>; 2],
    ) -> Self {
        let mut keys = RowKeyGenerator::new(spec.row_key_factory().clone());
        let mut single_rows = Vec::with_capacity(
            matches.len() + unmatched[0].len() + unmatched[1].len(),
        );
        for m in matches {
            single_rows.push(spec.row_join(&m.left, &m.right, &mut keys).into_ref());
        }
        let match_rows = single_rows.clone();

        let mut outer_rows: [Vec<RowRef>; 2] = Default::default();
        for u in &unmatched[0] {
            single_rows.push(spec.left_to_single_table_format(&u.row, &mut keys).into_ref());
            outer_rows[0].push(spec.row_project_outer(InputTable::Left, &u.row).into_ref());
        }
        for u in &unmatched[1] {
            single_rows.push(spec.right_to_single_table_format(&u.row, &mut keys).into_ref());
            outer_rows[1].push(spec.row_project_outer(InputTable::Right, &u.row).into_ref());
        }

        let match_spec = spec.spec_for_match_table();
        let [left_rows, right_rows] = outer_rows;
        Self {
            matches: DataTable::new(match_spec.clone(), match_rows),
            outer: [
                DataTable::new(spec.spec_for_unmatched(InputTable::Left), left_rows),
                DataTable::new(spec.spec_for_unmatched(InputTable::Right), right_rows),
            ],
            single_table: DataTable::new(match_spec, single_rows),
            match_offsets: matches
                .iter()
                .map(|m| (m.left_offset, m.right_offset))
                .collect(),
            unmatched_offsets: [
                unmatched[0].iter().map(|u| u.offset).collect(),
                unmatched[1].iter().map(|u| u.offset).collect(),
            ],
        }
    }

    /// Empty output shaped like `spec`'s tables.
    #[must_use]
    pub fn empty(spec: &JoinSpecification) -> Self {
        Self::project(spec, &[], &Default::default())
    }

    /// Matching pairs in the match table format.
    #[must_use]
    pub const fn matches(&self) -> &DataTable {
        &self.matches
    }

    /// Unmatched rows of `side`, projected to that side's included columns.
    #[must_use]
    pub const fn outer(&self, side: InputTable) -> &DataTable {
        &self.outer[side.index()]
    }

    #[must_use]
    pub const fn left_outer(&self) -> &DataTable {
        &self.outer[0]
    }

    #[must_use]
    pub const fn right_outer(&self) -> &DataTable {
        &self.outer[1]
    }

    /// Matches, then left unmatched, then right unmatched rows, all in the
    /// match table format.
    #[must_use]
    pub const fn single_table(&self) -> &DataTable {
        &self.single_table
    }

    /// `(left offset, right offset)` of every match, in output order.
    #[must_use]
    pub fn match_offsets(&self) -> &[(u64, u64)] {
        &self.match_offsets
    }

    /// Offsets of the unmatched rows of `side`, in output order.
    #[must_use]
    pub fn unmatched_offsets(&self, side: InputTable) -> &[u64] {
        &self.unmatched_offsets[side.index()]
    }
}
