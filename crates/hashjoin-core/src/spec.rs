//! Join specification: both inputs' settings plus everything that shapes
//! matching and output.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use hashjoin_error::{JoinError, Result};
use hashjoin_types::{ColumnSpec, DataCell, DataRow, DataTable, InputTable, RowKey, TableSpec};

use crate::settings::JoinTableSettings;
use crate::tuple::{CellComparisonMode, HashingStrategy, JoinTuple};

/// Default suffix appended to right column names that clash with left ones.
pub const DEFAULT_DISAMBIGUATOR_SUFFIX: &str = " (#1)";

// ── Output options ──────────────────────────────────────────────────────────

/// Order of the rows in the join results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputRowOrder {
    /// Whatever order the join produces; may vary with partitioning.
    #[default]
    Arbitrary,
    /// Sorted by probe row offset, then hash row offset.
    Deterministic,
    /// Sorted by left row offset, then right row offset.
    LeftRight,
}

impl OutputRowOrder {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Arbitrary => "Arbitrary output order (may vary randomly)",
            Self::Deterministic => "Fast sort (use any table to determine output order)",
            Self::LeftRight => {
                "Left-right output order (sort by row offset in left table, then right table)"
            }
        }
    }
}

impl fmt::Display for OutputRowOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How output row keys are made.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RowKeyFactory {
    /// `Row0`, `Row1`, ... in output order.
    #[default]
    Sequence,
    /// Left and right key joined by the separator; an absent side reads `?`.
    Concat(String),
    /// Key of the left row if present, else of the right row.
    Retain,
}

impl RowKeyFactory {
    /// Whether two distinct output rows always get distinct keys.
    #[must_use]
    pub const fn creates_unique_keys(&self) -> bool {
        !matches!(self, Self::Retain)
    }
}

/// Stateful key source for one output table.
#[derive(Debug, Clone)]
pub struct RowKeyGenerator {
    factory: RowKeyFactory,
    next: u64,
}

impl RowKeyGenerator {
    #[must_use]
    pub const fn new(factory: RowKeyFactory) -> Self {
        Self { factory, next: 0 }
    }

    /// Key for an output row combining `left` and `right` (either may be absent).
    pub fn key(&mut self, left: Option<&DataRow>, right: Option<&DataRow>) -> RowKey {
        match &self.factory {
            RowKeyFactory::Sequence => {
                let key = RowKey::sequence(self.next);
                self.next += 1;
                key
            }
            RowKeyFactory::Concat(sep) => {
                let l = left.map_or("?", |r| r.key().as_str());
                let r = right.map_or("?", |r| r.key().as_str());
                RowKey::new(format!("{l}{sep}{r}"))
            }
            RowKeyFactory::Retain => left
                .or(right)
                .map_or_else(|| RowKey::new("?"), |row| row.key().clone()),
        }
    }
}

/// Shorthand for the retain flags of the common join flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMode {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftAnti,
    RightAnti,
    FullAnti,
    Empty,
}

impl JoinMode {
    pub const ALL: [Self; 8] = [
        Self::Inner,
        Self::LeftOuter,
        Self::RightOuter,
        Self::FullOuter,
        Self::LeftAnti,
        Self::RightAnti,
        Self::FullAnti,
        Self::Empty,
    ];

    /// `(retain_matched, retain_left_unmatched, retain_right_unmatched)`.
    #[must_use]
    pub const fn retain_flags(self) -> (bool, bool, bool) {
        match self {
            Self::Inner => (true, false, false),
            Self::LeftOuter => (true, true, false),
            Self::RightOuter => (true, false, true),
            Self::FullOuter => (true, true, true),
            Self::LeftAnti => (false, true, false),
            Self::RightAnti => (false, false, true),
            Self::FullAnti => (false, true, true),
            Self::Empty => (false, false, false),
        }
    }
}

// ── Specification ───────────────────────────────────────────────────────────

/// Everything needed to execute a join.
#[derive(Debug, Clone)]
pub struct JoinSpecification {
    settings: [JoinTableSettings; 2],
    conjunctive: bool,
    clause_groups: Vec<Vec<usize>>,
    retain_matched: bool,
    output_row_order: OutputRowOrder,
    comparison_mode: CellComparisonMode,
    row_key_factory: RowKeyFactory,
    disambiguator_suffix: String,
}

impl JoinSpecification {
    #[must_use]
    pub fn builder(left: JoinTableSettings, right: JoinTableSettings) -> JoinSpecificationBuilder {
        JoinSpecificationBuilder::new(left, right)
    }

    /// Attach both input tables, which sets their size estimates.
    #[must_use]
    pub fn with_tables(mut self, left: &DataTable, right: &DataTable) -> Self {
        let [l, r] = self.settings;
        self.settings = [l.with_table(left), r.with_table(right)];
        self
    }

    #[must_use]
    pub const fn settings(&self, side: InputTable) -> &JoinTableSettings {
        &self.settings[side.index()]
    }

    #[must_use]
    pub const fn is_conjunctive(&self) -> bool {
        self.conjunctive
    }

    #[must_use]
    pub const fn is_retain_matched(&self) -> bool {
        self.retain_matched
    }

    #[must_use]
    pub const fn is_retain_unmatched(&self, side: InputTable) -> bool {
        self.settings[side.index()].is_retain_unmatched()
    }

    /// Nothing would be retained, so the join can be skipped.
    #[must_use]
    pub const fn is_empty_join(&self) -> bool {
        !self.retain_matched
            && !self.is_retain_unmatched(InputTable::Left)
            && !self.is_retain_unmatched(InputTable::Right)
    }

    #[must_use]
    pub const fn output_row_order(&self) -> OutputRowOrder {
        self.output_row_order
    }

    #[must_use]
    pub const fn comparison_mode(&self) -> CellComparisonMode {
        self.comparison_mode
    }

    #[must_use]
    pub const fn row_key_factory(&self) -> &RowKeyFactory {
        &self.row_key_factory
    }

    #[must_use]
    pub fn disambiguator_suffix(&self) -> &str {
        &self.disambiguator_suffix
    }

    /// Number of join clauses, equal on both sides.
    #[must_use]
    pub fn num_join_clauses(&self) -> usize {
        self.settings[0].join_clauses().len()
    }

    /// Tuple positions per clause group. A conjunctive join has one group
    /// holding every position.
    #[must_use]
    pub fn clause_groups(&self) -> &[Vec<usize>] {
        &self.clause_groups
    }

    /// Join tuple of `row` as seen from `side`.
    #[must_use]
    pub fn join_tuple(&self, side: InputTable, row: &DataRow) -> Option<JoinTuple> {
        self.settings(side).join_tuple(row, self.comparison_mode)
    }

    /// One strategy per index a [`crate::HashIndex`] keeps.
    #[must_use]
    pub fn hashing_strategies(&self) -> Vec<HashingStrategy> {
        if self.conjunctive {
            return vec![HashingStrategy::Conjunctive];
        }
        self.clause_groups
            .iter()
            .enumerate()
            .map(|(group, positions)| HashingStrategy::Clause {
                group,
                positions: positions.clone(),
            })
            .collect()
    }

    // ── Output projection ──────────────────────────────────────────────────

    /// Left includes followed by right includes; right names that clash get
    /// the disambiguator suffix until they are unique.
    #[must_use]
    pub fn spec_for_match_table(&self) -> TableSpec {
        let left = self.settings(InputTable::Left);
        let right = self.settings(InputTable::Right);
        let mut columns: Vec<ColumnSpec> = left
            .include_columns()
            .iter()
            .filter_map(|&i| left.table_spec().column(i).cloned())
            .collect();
        let mut taken: HashSet<String> = columns.iter().map(|c| c.name.clone()).collect();
        for &i in right.include_columns() {
            let Some(column) = right.table_spec().column(i) else {
                continue;
            };
            let name = self.disambiguate(&column.name, &taken);
            taken.insert(name.clone());
            columns.push(ColumnSpec::new(name, column.cell_type));
        }
        TableSpec::new(columns)
    }

    /// Included columns of `side`, in include order.
    #[must_use]
    pub fn spec_for_unmatched(&self, side: InputTable) -> TableSpec {
        let settings = self.settings(side);
        TableSpec::new(
            settings
                .include_columns()
                .iter()
                .filter_map(|&i| settings.table_spec().column(i).cloned())
                .collect(),
        )
    }

    fn disambiguate(&self, name: &str, taken: &HashSet<String>) -> String {
        let mut candidate = name.to_owned();
        while taken.contains(&candidate) {
            let next = format!("{candidate}{}", self.disambiguator_suffix);
            // An empty or blank suffix would never terminate; double the name instead.
            candidate = if next.trim() == candidate {
                candidate.repeat(2)
            } else {
                next
            };
        }
        candidate
    }

    /// Output row for a matching pair.
    pub fn row_join(&self, left: &DataRow, right: &DataRow, keys: &mut RowKeyGenerator) -> DataRow {
        let cells = Self::included_cells(self.settings(InputTable::Left), Some(left))
            .chain(Self::included_cells(self.settings(InputTable::Right), Some(right)))
            .collect();
        DataRow::new(keys.key(Some(left), Some(right)), cells)
    }

    /// Unmatched left row padded to the match table format.
    pub fn left_to_single_table_format(&self, left: &DataRow, keys: &mut RowKeyGenerator) -> DataRow {
        let cells = Self::included_cells(self.settings(InputTable::Left), Some(left))
            .chain(Self::included_cells(self.settings(InputTable::Right), None))
            .collect();
        DataRow::new(keys.key(Some(left), None), cells)
    }

    /// Unmatched right row padded to the match table format.
    pub fn right_to_single_table_format(
        &self,
        right: &DataRow,
        keys: &mut RowKeyGenerator,
    ) -> DataRow {
        let cells = Self::included_cells(self.settings(InputTable::Left), None)
            .chain(Self::included_cells(self.settings(InputTable::Right), Some(right)))
            .collect();
        DataRow::new(keys.key(None, Some(right)), cells)
    }

    /// Unmatched row projected to its side's included columns; keeps its key.
    #[must_use]
    pub fn row_project_outer(&self, side: InputTable, row: &DataRow) -> DataRow {
        DataRow::new(
            row.key().clone(),
            Self::included_cells(self.settings(side), Some(row)).collect(),
        )
    }

    fn included_cells<'a>(
        settings: &'a JoinTableSettings,
        row: Option<&'a DataRow>,
    ) -> impl Iterator<Item = DataCell> + 'a {
        settings
            .include_columns()
            .iter()
            .map(move |&i| row.map_or(DataCell::Missing, |r| r.cell(i).clone()))
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Builder for [`JoinSpecification`]. Defaults: conjunctive, retain matches,
/// arbitrary order, strict comparison, sequential row keys.
#[derive(Debug, Clone)]
pub struct JoinSpecificationBuilder {
    left: JoinTableSettings,
    right: JoinTableSettings,
    conjunctive: bool,
    clause_groups: Option<Vec<Vec<usize>>>,
    retain_matched: bool,
    output_row_order: OutputRowOrder,
    comparison_mode: CellComparisonMode,
    row_key_factory: RowKeyFactory,
    disambiguator_suffix: String,
}

impl JoinSpecificationBuilder {
    fn new(left: JoinTableSettings, right: JoinTableSettings) -> Self {
        Self {
            left,
            right,
            conjunctive: true,
            clause_groups: None,
            retain_matched: true,
            output_row_order: OutputRowOrder::default(),
            comparison_mode: CellComparisonMode::default(),
            row_key_factory: RowKeyFactory::default(),
            disambiguator_suffix: DEFAULT_DISAMBIGUATOR_SUFFIX.to_owned(),
        }
    }

    /// Start from an existing specification.
    #[must_use]
    pub fn from_spec(spec: &JoinSpecification) -> Self {
        let [left, right] = spec.settings.clone();
        Self {
            left,
            right,
            conjunctive: spec.conjunctive,
            clause_groups: (!spec.conjunctive).then(|| spec.clause_groups.clone()),
            retain_matched: spec.retain_matched,
            output_row_order: spec.output_row_order,
            comparison_mode: spec.comparison_mode,
            row_key_factory: spec.row_key_factory.clone(),
            disambiguator_suffix: spec.disambiguator_suffix.clone(),
        }
    }

    #[must_use]
    pub const fn conjunctive(mut self, conjunctive: bool) -> Self {
        self.conjunctive = conjunctive;
        self
    }

    /// Disjunctive join over explicit clause groups: a pair matches if all
    /// clauses of at least one group agree.
    #[must_use]
    pub fn clause_groups(mut self, groups: Vec<Vec<usize>>) -> Self {
        self.conjunctive = false;
        self.clause_groups = Some(groups);
        self
    }

    #[must_use]
    pub const fn retain_matched(mut self, retain: bool) -> Self {
        self.retain_matched = retain;
        self
    }

    /// Set all three retain flags at once.
    #[must_use]
    pub fn join_mode(mut self, mode: JoinMode) -> Self {
        let (matched, left, right) = mode.retain_flags();
        self.retain_matched = matched;
        self.left.set_retain_unmatched(left);
        self.right.set_retain_unmatched(right);
        self
    }

    #[must_use]
    pub const fn output_row_order(mut self, order: OutputRowOrder) -> Self {
        self.output_row_order = order;
        self
    }

    #[must_use]
    pub const fn comparison_mode(mut self, mode: CellComparisonMode) -> Self {
        self.comparison_mode = mode;
        self
    }

    #[must_use]
    pub fn row_key_factory(mut self, factory: RowKeyFactory) -> Self {
        self.row_key_factory = factory;
        self
    }

    #[must_use]
    pub fn column_name_disambiguator_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.disambiguator_suffix = suffix.into();
        self
    }

    /// Reduce both sides to the single join clause `clause`.
    ///
    /// # Errors
    /// [`JoinError::InvalidSettings`] if the clause does not exist.
    pub fn using_only_join_clause(mut self, clause: usize) -> Result<Self> {
        self.left = self.left.using_only_join_clause(clause)?;
        self.right = self.right.using_only_join_clause(clause)?;
        self.clause_groups = None;
        Ok(self)
    }

    /// Validate and build.
    ///
    /// # Errors
    /// [`JoinError::InvalidSettings`] if the sides are swapped, the clause
    /// counts differ, or explicit clause groups do not partition the clauses.
    pub fn build(self) -> Result<JoinSpecification> {
        if !self.left.side().is_left() || self.right.side().is_left() {
            return Err(JoinError::invalid_settings(format!(
                "the first settings object must be declared as left and the other as right; \
                 first is declared as {} table, second as {} table",
                self.left.side(),
                self.right.side()
            )));
        }
        let left_clauses = self.left.join_clauses().len();
        let right_clauses = self.right.join_clauses().len();
        if left_clauses != right_clauses {
            return Err(JoinError::invalid_settings(format!(
                "left hand table specifies {left_clauses} join clauses, right hand table specifies \
                 {right_clauses}; each side has to specify the same number of join clauses"
            )));
        }

        let clause_groups = if self.conjunctive {
            vec![(0..left_clauses).collect()]
        } else if let Some(groups) = self.clause_groups {
            validate_clause_groups(&groups, left_clauses)?;
            groups
        } else {
            (0..left_clauses).map(|i| vec![i]).collect()
        };

        debug!(
            conjunctive = self.conjunctive,
            clauses = left_clauses,
            groups = clause_groups.len(),
            order = ?self.output_row_order,
            mode = ?self.comparison_mode,
            "join specification built"
        );

        Ok(JoinSpecification {
            settings: [self.left, self.right],
            conjunctive: self.conjunctive,
            clause_groups,
            retain_matched: self.retain_matched,
            output_row_order: self.output_row_order,
            comparison_mode: self.comparison_mode,
            row_key_factory: self.row_key_factory,
            disambiguator_suffix: self.disambiguator_suffix,
        })
    }
}

fn validate_clause_groups(groups: &[Vec<usize>], clauses: usize) -> Result<()> {
    if groups.is_empty() {
        return Err(JoinError::invalid_settings("no clause groups given"));
    }
    let mut seen = vec![false; clauses];
    for (g, group) in groups.iter().enumerate() {
        if group.is_empty() {
            return Err(JoinError::invalid_settings(format!("clause group {g} is empty")));
        }
        for &clause in group {
            let slot = seen.get_mut(clause).ok_or_else(|| {
                JoinError::invalid_settings(format!(
                    "clause group {g} references clause {clause}, only {clauses} exist"
                ))
            })?;
            if *slot {
                return Err(JoinError::invalid_settings(format!(
                    "clause {clause} appears in more than one clause group"
                )));
            }
            *slot = true;
        }
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(JoinError::invalid_settings(format!(
            "clause {missing} is not part of any clause group"
        )));
    }
    Ok(())
}
