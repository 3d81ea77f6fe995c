use hashjoin::{
    Cx, DataCell, DataRow, DataTable, InputTable, JoinColumn, JoinConfig, JoinMode,
    JoinSpecification, JoinTableSettings, OutputRowOrder, RowKey, RowKeyFactory, TableSpec,
    join_tables, join_tables_with,
};
use proptest::prelude::*;

const HEADER: &str = "k,v";

/// Join keys come from a small domain so that duplicates are common.
fn key_cell() -> impl Strategy<Value = Option<i64>> {
    prop_oneof![1 => Just(None), 6 => (0_i64..6).prop_map(Some)]
}

fn table(prefix: &str, keys: &[Option<i64>]) -> DataTable {
    let rows = keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let k = key.map_or(DataCell::Missing, DataCell::Long);
            DataRow::new(
                RowKey::new(format!("{prefix}{i}")),
                vec![k, DataCell::Long(i as i64)],
            )
            .into_ref()
        })
        .collect();
    DataTable::new(TableSpec::from_header(HEADER), rows)
}

fn spec(mode: JoinMode, order: OutputRowOrder) -> JoinSpecification {
    let table_spec = TableSpec::from_header(HEADER);
    let side = |s| {
        JoinTableSettings::new(true, JoinColumn::list(&["k"]), &["v"], s, &table_spec).unwrap()
    };
    JoinSpecification::builder(side(InputTable::Left), side(InputTable::Right))
        .join_mode(mode)
        .output_row_order(order)
        .row_key_factory(RowKeyFactory::Concat("+".into()))
        .build()
        .unwrap()
}

/// Nested-loop reference: matching pairs in (left, right) order and the
/// unmatched offsets of each side.
fn nested_loop(left: &[Option<i64>], right: &[Option<i64>]) -> (Vec<(u64, u64)>, Vec<u64>, Vec<u64>) {
    let mut pairs = Vec::new();
    let mut left_matched = vec![false; left.len()];
    let mut right_matched = vec![false; right.len()];
    for (l, lk) in left.iter().enumerate() {
        for (r, rk) in right.iter().enumerate() {
            if lk.is_some() && lk == rk {
                pairs.push((l as u64, r as u64));
                left_matched[l] = true;
                right_matched[r] = true;
            }
        }
    }
    let unmatched = |matched: &[bool]| {
        matched
            .iter()
            .enumerate()
            .filter(|(_, m)| !**m)
            .map(|(i, _)| i as u64)
            .collect()
    };
    (pairs, unmatched(&left_matched), unmatched(&right_matched))
}

const CLAUSE_HEADER: &str = "a,b,v";

/// Two join keys per row, each from a tiny domain and sometimes missing.
fn clause_keys() -> impl Strategy<Value = (Option<i64>, Option<i64>)> {
    let cell = || prop_oneof![1 => Just(None), 8 => (0_i64..4).prop_map(Some)];
    (cell(), cell())
}

fn clause_table(prefix: &str, keys: &[(Option<i64>, Option<i64>)]) -> DataTable {
    let cell = |k: Option<i64>| k.map_or(DataCell::Missing, DataCell::Long);
    let rows = keys
        .iter()
        .enumerate()
        .map(|(i, &(a, b))| {
            DataRow::new(
                RowKey::new(format!("{prefix}{i}")),
                vec![cell(a), cell(b), DataCell::Long(i as i64)],
            )
            .into_ref()
        })
        .collect();
    DataTable::new(TableSpec::from_header(CLAUSE_HEADER), rows)
}

/// `a = a OR b = b`, keeping every unmatched row.
fn disjunctive_spec(order: OutputRowOrder) -> JoinSpecification {
    let table_spec = TableSpec::from_header(CLAUSE_HEADER);
    let side = |s| {
        JoinTableSettings::new(true, JoinColumn::list(&["a", "b"]), &["v"], s, &table_spec).unwrap()
    };
    JoinSpecification::builder(side(InputTable::Left), side(InputTable::Right))
        .conjunctive(false)
        .join_mode(JoinMode::FullOuter)
        .output_row_order(order)
        .row_key_factory(RowKeyFactory::Concat("+".into()))
        .build()
        .unwrap()
}

type ClauseKeys = (Option<i64>, Option<i64>);

/// Nested-loop reference for the disjunctive join. A row with any missing
/// join cell has no join tuple and matches nothing.
fn disjunctive_nested_loop(
    left: &[ClauseKeys],
    right: &[ClauseKeys],
) -> (Vec<(u64, u64)>, Vec<u64>, Vec<u64>) {
    let complete = |&(a, b): &ClauseKeys| a.zip(b);
    let mut pairs = Vec::new();
    let mut left_matched = vec![false; left.len()];
    let mut right_matched = vec![false; right.len()];
    for (l, lk) in left.iter().enumerate() {
        for (r, rk) in right.iter().enumerate() {
            let hit = match (complete(lk), complete(rk)) {
                (Some((la, lb)), Some((ra, rb))) => la == ra || lb == rb,
                _ => false,
            };
            if hit {
                pairs.push((l as u64, r as u64));
                left_matched[l] = true;
                right_matched[r] = true;
            }
        }
    }
    let unmatched = |matched: &[bool]| {
        matched
            .iter()
            .enumerate()
            .filter(|(_, m)| !**m)
            .map(|(i, _)| i as u64)
            .collect()
    };
    (pairs, unmatched(&left_matched), unmatched(&right_matched))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn hybrid_join_agrees_with_nested_loop(
        left_keys in prop::collection::vec(key_cell(), 0..24),
        right_keys in prop::collection::vec(key_cell(), 0..24),
        partitions in 1_usize..6,
        budget in prop_oneof![Just(0_u64), Just(6_u64), Just(u64::MAX)],
    ) {
        let left = table("l", &left_keys);
        let right = table("r", &right_keys);
        let config = JoinConfig::default()
            .with_num_partitions(partitions)
            .with_memory_budget_cells(budget);
        let spec = spec(JoinMode::FullOuter, OutputRowOrder::LeftRight);
        let results = join_tables_with(&spec, &left, &right, config, &Cx::new()).unwrap();

        let (pairs, left_unmatched, right_unmatched) = nested_loop(&left_keys, &right_keys);
        prop_assert_eq!(results.match_offsets(), pairs.as_slice());
        prop_assert_eq!(results.unmatched_offsets(InputTable::Left), left_unmatched.as_slice());
        prop_assert_eq!(results.unmatched_offsets(InputTable::Right), right_unmatched.as_slice());
    }

    #[test]
    fn deterministic_order_is_probe_major(
        left_keys in prop::collection::vec(key_cell(), 0..24),
        right_keys in prop::collection::vec(key_cell(), 0..24),
        budget in prop_oneof![Just(0_u64), Just(u64::MAX)],
    ) {
        let left = table("l", &left_keys);
        let right = table("r", &right_keys);
        let config = JoinConfig::default().with_num_partitions(3).with_memory_budget_cells(budget);
        let spec = spec(JoinMode::Inner, OutputRowOrder::Deterministic);
        let results = join_tables_with(&spec, &left, &right, config, &Cx::new()).unwrap();

        // The bigger input probes; ties go to the left.
        let probe_is_left = left_keys.len() >= right_keys.len();
        let keys: Vec<(u64, u64)> = results
            .match_offsets()
            .iter()
            .map(|&(l, r)| if probe_is_left { (l, r) } else { (r, l) })
            .collect();
        prop_assert!(keys.windows(2).all(|w| w[0] < w[1]), "not sorted: {:?}", keys);
    }

    #[test]
    fn arbitrary_order_holds_the_same_rows(
        left_keys in prop::collection::vec(key_cell(), 0..16),
        right_keys in prop::collection::vec(key_cell(), 0..16),
    ) {
        let left = table("l", &left_keys);
        let right = table("r", &right_keys);
        let arbitrary = join_tables(&spec(JoinMode::FullOuter, OutputRowOrder::Arbitrary), &left, &right).unwrap();
        let ordered = join_tables(&spec(JoinMode::FullOuter, OutputRowOrder::LeftRight), &left, &right).unwrap();

        let mut a: Vec<String> = arbitrary.single_table().rows().iter().map(ToString::to_string).collect();
        let mut b: Vec<String> = ordered.single_table().rows().iter().map(ToString::to_string).collect();
        a.sort();
        b.sort();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn disjunctive_join_agrees_with_nested_loop(
        left_keys in prop::collection::vec(clause_keys(), 0..20),
        right_keys in prop::collection::vec(clause_keys(), 0..20),
        partitions in 1_usize..5,
        budget in prop_oneof![Just(0_u64), Just(4_u64), Just(u64::MAX)],
        deterministic in any::<bool>(),
    ) {
        let left = clause_table("l", &left_keys);
        let right = clause_table("r", &right_keys);
        let config = JoinConfig::default()
            .with_num_partitions(partitions)
            .with_memory_budget_cells(budget);
        let order = if deterministic {
            OutputRowOrder::Deterministic
        } else {
            OutputRowOrder::LeftRight
        };
        let results =
            join_tables_with(&disjunctive_spec(order), &left, &right, config, &Cx::new()).unwrap();

        let (pairs, left_unmatched, right_unmatched) =
            disjunctive_nested_loop(&left_keys, &right_keys);
        let mut left_actual = results.unmatched_offsets(InputTable::Left).to_vec();
        let mut right_actual = results.unmatched_offsets(InputTable::Right).to_vec();
        left_actual.sort_unstable();
        right_actual.sort_unstable();
        prop_assert_eq!(left_actual, left_unmatched);
        prop_assert_eq!(right_actual, right_unmatched);

        if deterministic {
            let probe_is_left = left_keys.len() >= right_keys.len();
            let keys: Vec<(u64, u64)> = results
                .match_offsets()
                .iter()
                .map(|&(l, r)| if probe_is_left { (l, r) } else { (r, l) })
                .collect();
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]), "not sorted: {:?}", keys);
            let mut actual = results.match_offsets().to_vec();
            actual.sort_unstable();
            prop_assert_eq!(actual, pairs);
        } else {
            prop_assert_eq!(results.match_offsets(), pairs.as_slice());
        }
    }
}
