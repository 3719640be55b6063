// Copyright © 2024 Pathway

#![allow(clippy::disallowed_methods)]

use std::collections::BTreeMap;
use std::sync::Arc;

use assert_matches::assert_matches;

use super::helpers::{
    capture_table, final_rows, final_state, ints, key, no_properties, path, row, row_at,
    run_graph, static_table, timeline, value_paths, Change,
};

use pathway_core::connectors::DataRow;
use pathway_core::engine::expression::BinaryOperator;
use pathway_core::engine::{
    ColumnPath, ColumnProperties, Error, Expression, ExpressionData, IxKeyPolicy, JoinType, Key,
    Reducer, ReducerData, ShardPolicy, Type, Value,
};

fn count_by_first_column() -> Vec<ReducerData> {
    vec![
        ReducerData::new(Reducer::Any, vec![path(&[0])]),
        ReducerData::new(Reducer::Count, vec![]),
    ]
}

#[test]
fn test_count_ignores_cancelled_pair() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(
            graph,
            vec![
                row_at(1, vec![Value::from("a")], 0, 1),
                row_at(1, vec![Value::from("a")], 0, -1),
                row(2, vec![Value::from("b")]),
            ],
        )?;
        let counts = graph.group_by_table(
            table,
            vec![path(&[0])],
            ShardPolicy::from_last_column_is_instance(false),
            count_by_first_column(),
            false,
            no_properties(),
        )?;
        capture_table(graph, counts, value_paths(2))
    })?;
    assert_eq!(
        timeline(&changes),
        vec![(0, vec![Value::from("b"), Value::Int(1)], 1)]
    );
    Ok(())
}

#[test]
fn test_count_follows_deletions() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(
            graph,
            vec![
                row_at(1, vec![Value::from("a")], 0, 1),
                row_at(2, vec![Value::from("a")], 0, 1),
                row_at(1, vec![Value::from("a")], 2, -1),
                row_at(2, vec![Value::from("a")], 4, -1),
            ],
        )?;
        let counts = graph.group_by_table(
            table,
            vec![path(&[0])],
            ShardPolicy::from_last_column_is_instance(false),
            count_by_first_column(),
            false,
            no_properties(),
        )?;
        capture_table(graph, counts, value_paths(2))
    })?;
    let a = Value::from("a");
    assert_eq!(
        timeline(&changes),
        vec![
            (0, vec![a.clone(), Value::Int(2)], 1),
            (2, vec![a.clone(), Value::Int(1)], 1),
            (2, vec![a.clone(), Value::Int(2)], -1),
            (4, vec![a, Value::Int(1)], -1),
        ]
    );
    assert!(final_state(&changes).is_empty());
    Ok(())
}

#[test]
fn test_group_by_does_not_depend_on_row_order() -> eyre::Result<()> {
    let rows: Vec<_> = (0..40)
        .map(|i: i64| row_at(i, ints(&[i % 3, i * 7 % 11]), (i % 4).unsigned_abs(), 1))
        .collect();
    let reducers = || {
        vec![
            ReducerData::new(Reducer::Any, vec![path(&[0])]),
            ReducerData::new(Reducer::IntSum, vec![path(&[1])]),
            ReducerData::new(Reducer::Min, vec![path(&[1])]),
            ReducerData::new(Reducer::Max, vec![path(&[1])]),
            ReducerData::new(Reducer::SortedTuple { skip_nones: false }, vec![path(&[1])]),
        ]
    };
    let run = |rows: Vec<_>| {
        run_graph(1, move |graph| {
            let table = static_table(graph, rows.clone())?;
            let grouped = graph.group_by_table(
                table,
                vec![path(&[0])],
                ShardPolicy::from_last_column_is_instance(false),
                reducers(),
                false,
                no_properties(),
            )?;
            capture_table(graph, grouped, value_paths(5))
        })
    };
    let forward = run(rows.clone())?;
    let backward = run(rows.into_iter().rev().collect())?;
    assert_eq!(final_rows(&forward), final_rows(&backward));
    assert_eq!(final_rows(&forward).len(), 3);
    Ok(())
}

#[test]
fn test_full_outer_join_keeps_unmatched_rows() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let left = static_table(
            graph,
            vec![
                row(1, vec![Value::from("a"), Value::Int(1)]),
                row(2, vec![Value::from("b"), Value::Int(2)]),
            ],
        )?;
        let right = static_table(graph, vec![row(3, vec![Value::from("a"), Value::Int(10)])])?;
        let joined = graph.join_tables(
            left,
            right,
            vec![path(&[0])],
            vec![path(&[0])],
            JoinType::FullOuter,
            ShardPolicy::from_last_column_is_instance(false),
            no_properties(),
        )?;
        capture_table(graph, joined, vec![path(&[1, 1]), path(&[3, 1])])
    })?;
    let mut expected = vec![
        vec![Value::Int(1), Value::Int(10)],
        vec![Value::Int(2), Value::None],
    ];
    expected.sort();
    assert_eq!(final_rows(&changes), expected);
    Ok(())
}

#[test]
fn test_outer_join_moves_row_between_matched_and_unmatched() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let left = static_table(graph, vec![row(1, vec![Value::from("a"), Value::Int(1)])])?;
        let right = static_table(
            graph,
            vec![
                row_at(2, vec![Value::from("a"), Value::Int(10)], 2, 1),
                row_at(2, vec![Value::from("a"), Value::Int(10)], 4, -1),
            ],
        )?;
        let joined = graph.join_tables(
            left,
            right,
            vec![path(&[0])],
            vec![path(&[0])],
            JoinType::LeftOuter,
            ShardPolicy::from_last_column_is_instance(false),
            no_properties(),
        )?;
        capture_table(graph, joined, vec![path(&[1, 1]), path(&[3, 1])])
    })?;
    assert_eq!(
        timeline(&changes),
        vec![
            (0, vec![Value::Int(1), Value::None], 1),
            (2, vec![Value::Int(1), Value::None], -1),
            (2, vec![Value::Int(1), Value::Int(10)], 1),
            (4, vec![Value::Int(1), Value::None], 1),
            (4, vec![Value::Int(1), Value::Int(10)], -1),
        ]
    );
    Ok(())
}

#[test]
fn test_join_rejects_different_condition_lengths() {
    let result = run_graph(1, |graph| {
        let left = static_table(graph, vec![row(1, ints(&[1, 2]))])?;
        let right = static_table(graph, vec![row(2, ints(&[1, 2]))])?;
        let joined = graph.join_tables(
            left,
            right,
            vec![path(&[0]), path(&[1])],
            vec![path(&[0])],
            JoinType::Inner,
            ShardPolicy::from_last_column_is_instance(false),
            no_properties(),
        )?;
        capture_table(graph, joined, vec![])
    });
    assert_matches!(result, Err(Error::DifferentJoinConditionLengths));
}

#[test]
fn test_join_skips_none_keys() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let left = static_table(graph, vec![row(1, vec![Value::None, Value::Int(1)])])?;
        let right = static_table(graph, vec![row(2, vec![Value::None, Value::Int(2)])])?;
        let joined = graph.join_tables(
            left,
            right,
            vec![path(&[0])],
            vec![path(&[0])],
            JoinType::Inner,
            ShardPolicy::from_last_column_is_instance(false),
            no_properties(),
        )?;
        capture_table(graph, joined, vec![path(&[1, 1]), path(&[3, 1])])
    })?;
    assert!(changes.is_empty());
    Ok(())
}

#[test]
fn test_concat_fails_on_shared_key() {
    let result = run_graph(1, |graph| {
        let first = static_table(graph, vec![row(1, ints(&[1]))])?;
        let second = static_table(graph, vec![row(1, ints(&[2]))])?;
        let concatenated = graph.concat_tables(vec![first, second], no_properties())?;
        capture_table(graph, concatenated, value_paths(1))
    });
    assert_matches!(result, Err(Error::DuplicateKey(duplicate)) if duplicate == key(1));
}

#[test]
fn test_intersect_and_subtract() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let all = static_table(graph, vec![row(1, ints(&[1])), row(2, ints(&[2])), row(3, ints(&[3]))])?;
        let some = static_table(graph, vec![row(2, ints(&[20])), row(3, ints(&[30]))])?;
        let other = static_table(graph, vec![row(3, ints(&[300]))])?;
        let intersection = graph.intersect_tables(all, vec![some, other], no_properties())?;
        let difference = graph.subtract_table(all, some, no_properties())?;
        let both = graph.concat_tables(vec![intersection, difference], no_properties())?;
        capture_table(graph, both, value_paths(1))
    })?;
    assert_eq!(final_rows(&changes), vec![ints(&[1]), ints(&[3])]);
    Ok(())
}

#[test]
fn test_restricted_column_follows_narrower_universe() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let all = static_table(graph, vec![row(1, ints(&[1])), row(2, ints(&[2])), row(3, ints(&[3]))])?;
        let some = static_table(
            graph,
            vec![row(2, ints(&[20])), row(3, ints(&[30])), row_at(3, ints(&[30]), 2, -1)],
        )?;
        let narrow = graph.intersect_tables(some, vec![all], no_properties())?;
        let universe = graph.table_universe(narrow)?;
        let column = graph.table_column(all, path(&[0]))?;
        let restricted = graph.restrict_column(universe, column)?;
        let table = graph.columns_to_table(universe, vec![restricted])?;
        capture_table(graph, table, value_paths(1))
    })?;
    assert_eq!(final_state(&changes), BTreeMap::from([(key(2), ints(&[2]))]));
    assert_eq!(
        timeline(&changes),
        vec![(0, ints(&[2]), 1), (0, ints(&[3]), 1), (2, ints(&[3]), -1)]
    );
    Ok(())
}

#[test]
fn test_ix_follows_pointed_rows() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let to_ix = static_table(
            graph,
            vec![
                row(1, ints(&[10])),
                row(2, ints(&[20])),
                row_at(1, ints(&[10]), 2, -1),
                row_at(1, ints(&[11]), 2, 1),
            ],
        )?;
        let pointers = static_table(
            graph,
            vec![
                row(100, vec![Value::from(key(1))]),
                row(101, vec![Value::from(key(2))]),
                row(102, vec![Value::from(key(1))]),
            ],
        )?;
        let looked_up = graph.ix_table(
            to_ix,
            pointers,
            path(&[0]),
            IxKeyPolicy::FailMissing,
            no_properties(),
        )?;
        capture_table(graph, looked_up, value_paths(1))
    })?;
    let state = final_state(&changes);
    assert_eq!(state.get(&key(100)), Some(&ints(&[11])));
    assert_eq!(state.get(&key(101)), Some(&ints(&[20])));
    assert_eq!(state.get(&key(102)), Some(&ints(&[11])));
    Ok(())
}

#[test]
fn test_ix_missing_key_policies() -> eyre::Result<()> {
    let build = |policy| {
        run_graph(1, move |graph| {
            let to_ix = static_table(graph, vec![row(1, ints(&[10]))])?;
            let pointers = static_table(
                graph,
                vec![
                    row(100, vec![Value::from(key(1))]),
                    row(101, vec![Value::from(key(7))]),
                ],
            )?;
            let looked_up = graph.ix_table(to_ix, pointers, path(&[0]), policy, no_properties())?;
            capture_table(graph, looked_up, value_paths(1))
        })
    };
    let skipped = build(IxKeyPolicy::SkipMissing)?;
    assert_eq!(final_state(&skipped).keys().copied().collect::<Vec<_>>(), vec![key(100)]);
    assert_matches!(
        build(IxKeyPolicy::FailMissing),
        Err(Error::KeyMissingInOutputTable(missing)) if missing == key(7)
    );
    Ok(())
}

#[test]
fn test_ix_forwards_none() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let to_ix = static_table(graph, vec![row(1, ints(&[10]))])?;
        let pointers = static_table(graph, vec![row(100, vec![Value::None])])?;
        let looked_up = graph.ix_table(
            to_ix,
            pointers,
            path(&[0]),
            IxKeyPolicy::ForwardNone,
            no_properties(),
        )?;
        capture_table(graph, looked_up, vec![ColumnPath::ValuePath(vec![])])
    })?;
    assert_eq!(final_state(&changes).get(&key(100)), Some(&vec![Value::None]));
    Ok(())
}

#[test]
fn test_update_rows_and_cells() -> eyre::Result<()> {
    let run = |cells: bool| {
        run_graph(1, move |graph| {
            let original = static_table(
                graph,
                vec![
                    row(1, vec![Value::Int(1), Value::from("a")]),
                    row(2, vec![Value::Int(2), Value::from("b")]),
                ],
            )?;
            let update = static_table(graph, vec![row(2, vec![Value::Int(20), Value::from("B")])])?;
            if cells {
                let updated = graph.update_cells_table(
                    original,
                    update,
                    vec![path(&[1])],
                    vec![path(&[1])],
                    no_properties(),
                )?;
                capture_table(graph, updated, vec![path(&[0, 0]), path(&[1])])
            } else {
                let updated = graph.update_rows_table(original, update, no_properties())?;
                capture_table(graph, updated, value_paths(2))
            }
        })
    };
    let rows = final_state(&run(false)?);
    assert_eq!(rows.get(&key(1)), Some(&vec![Value::Int(1), Value::from("a")]));
    assert_eq!(rows.get(&key(2)), Some(&vec![Value::Int(20), Value::from("B")]));
    let cells = final_state(&run(true)?);
    assert_eq!(cells.get(&key(1)), Some(&vec![Value::Int(1), Value::from("a")]));
    assert_eq!(cells.get(&key(2)), Some(&vec![Value::Int(2), Value::from("B")]));
    Ok(())
}

#[test]
fn test_restrict_or_override_universe() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let original = static_table(graph, vec![row(1, ints(&[1])), row(2, ints(&[2]))])?;
        let new = static_table(graph, vec![row(1, ints(&[10]))])?;
        let restricted =
            graph.restrict_or_override_table_universe(original, new, false, no_properties())?;
        capture_table(graph, restricted, vec![path(&[0, 0]), path(&[1, 0])])
    })?;
    assert_eq!(final_rows(&changes), vec![ints(&[10, 1])]);

    let result = run_graph(1, |graph| {
        let original = static_table(graph, vec![row(1, ints(&[1]))])?;
        let new = static_table(graph, vec![row(3, ints(&[30]))])?;
        let restricted =
            graph.restrict_or_override_table_universe(original, new, false, no_properties())?;
        capture_table(graph, restricted, vec![])
    });
    assert_matches!(result, Err(Error::KeyMissingInUniverse(missing)) if missing == key(3));
    Ok(())
}

#[test]
fn test_sort_links_neighbours() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(
            graph,
            vec![
                row(1, ints(&[30, 0])),
                row(2, ints(&[10, 0])),
                row(3, ints(&[20, 0])),
                row(4, ints(&[5, 1])),
                row_at(3, ints(&[20, 0]), 2, -1),
            ],
        )?;
        let sorted = graph.sort_table(table, path(&[0]), path(&[1]), no_properties())?;
        capture_table(graph, sorted, vec![path(&[1]), path(&[2])])
    })?;
    let state = final_state(&changes);
    assert_eq!(state.get(&key(2)), Some(&vec![Value::None, Value::from(key(1))]));
    assert_eq!(state.get(&key(1)), Some(&vec![Value::from(key(2)), Value::None]));
    assert_eq!(state.get(&key(4)), Some(&vec![Value::None, Value::None]));
    assert_eq!(state.len(), 3);
    // before the deletion the middle row linked both ends
    assert!(changes.iter().any(|change| change.key == key(2)
        && change.time == 0
        && change.values == vec![Value::None, Value::from(key(3))]));
    Ok(())
}

#[test]
fn test_flatten_assigns_keys_by_position() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(
            graph,
            vec![row(1, vec![Value::from(ints(&[4, 5, 6])), Value::from("x")])],
        )?;
        let flattened = graph.flatten_table(table, path(&[0]), no_properties())?;
        capture_table(graph, flattened, vec![path(&[1]), path(&[0, 1])])
    })?;
    let state = final_state(&changes);
    assert_eq!(state.len(), 3);
    let second = Key::for_values(&[Value::from(key(1)), Value::Int(1)]);
    assert_eq!(state.get(&second), Some(&vec![Value::Int(5), Value::from("x")]));
    Ok(())
}

#[test]
fn test_filter_on_computed_column() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(graph, (1..=10).map(|i| row(i, ints(&[i]))).collect())?;
        let above_five = Expression::binary(
            BinaryOperator::Gt,
            Arc::new(Expression::argument(0)),
            Arc::new(Expression::new_const(Value::Int(5))),
            &Type::Int,
            &Type::Int,
        )
        .ok_or_else(|| Error::ValueError("comparison not defined".into()))?;
        let computed = graph.expression_table(
            table,
            value_paths(1),
            vec![
                ExpressionData::new(
                    Arc::new(above_five),
                    Arc::new(ColumnProperties::with_dtype(Type::Bool)),
                ),
                ExpressionData::new(
                    Arc::new(Expression::argument(0)),
                    Arc::new(ColumnProperties::with_dtype(Type::Int)),
                ),
            ],
        )?;
        let filtered = graph.filter_table(computed, path(&[0]), no_properties())?;
        capture_table(graph, filtered, vec![path(&[1])])
    })?;
    assert_eq!(
        final_rows(&changes),
        (6..=10).map(|i| ints(&[i])).collect::<Vec<_>>()
    );
    Ok(())
}

fn divide_by_zero(dtype: Type) -> pathway_core::engine::Result<Vec<Vec<Value>>> {
    let changes = run_graph(1, move |graph| {
        let table = static_table(graph, vec![row(1, ints(&[7, 0]))])?;
        let quotient = Expression::binary(
            BinaryOperator::FloorDiv,
            Arc::new(Expression::argument(0)),
            Arc::new(Expression::argument(1)),
            &Type::Int,
            &Type::Int,
        )
        .ok_or_else(|| Error::ValueError("division not defined".into()))?;
        let computed = graph.expression_table(
            table,
            value_paths(2),
            vec![ExpressionData::new(
                Arc::new(quotient),
                Arc::new(ColumnProperties::with_dtype(dtype.clone())),
            )],
        )?;
        capture_table(graph, computed, value_paths(1))
    })?;
    Ok(final_rows(&changes))
}

#[test]
fn test_row_errors_follow_column_type() -> eyre::Result<()> {
    assert_eq!(divide_by_zero(Type::optional(Type::Int))?, vec![vec![Value::None]]);
    assert_eq!(divide_by_zero(Type::Any)?, vec![vec![Value::Error]]);
    assert_matches!(
        divide_by_zero(Type::Int),
        Err(Error::Data(pathway_core::engine::DataError::DivisionByZero))
    );
    Ok(())
}

#[test]
fn test_reindex_and_id_column() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(
            graph,
            vec![
                row(1, vec![Value::from(key(10)), Value::from("a")]),
                row(2, vec![Value::from(key(20)), Value::from("b")]),
            ],
        )?;
        let reindexed = graph.reindex_table(table, path(&[0]), no_properties())?;
        let universe = graph.table_universe(reindexed)?;
        let ids = graph.id_column(universe)?;
        let names = graph.table_column(reindexed, path(&[1]))?;
        let zipped = graph.columns_to_table(universe, vec![ids, names])?;
        capture_table(graph, zipped, value_paths(2))
    })?;
    let state = final_state(&changes);
    assert_eq!(
        state.get(&key(10)),
        Some(&vec![Value::from(key(10)), Value::from("a")])
    );
    assert_eq!(
        state.get(&key(20)),
        Some(&vec![Value::from(key(20)), Value::from("b")])
    );
    Ok(())
}

fn join_side(offset: i64) -> Vec<DataRow> {
    let mut rows = Vec::new();
    for i in 0..12 {
        let id = offset + i;
        let time = (i % 3).unsigned_abs();
        rows.push(row_at(id, ints(&[(i * offset) % 4, i]), time, 1));
        if i % 5 == 0 {
            rows.push(row_at(id, ints(&[(i * offset) % 4, i]), time + 2, -1));
        }
    }
    rows
}

fn state_at(rows: &[DataRow], time: u64) -> Vec<(Key, Value)> {
    let mut counts: BTreeMap<(Key, Value), isize> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.time <= time) {
        *counts.entry((row.key, row.values[0].clone())).or_default() += row.diff;
    }
    counts
        .into_iter()
        .filter(|(_row, count)| *count > 0)
        .map(|(row, _count)| row)
        .collect()
}

#[test]
fn test_inner_join_matches_recomputation() -> eyre::Result<()> {
    let (left_rows, right_rows) = (join_side(3), join_side(5));
    let (left_input, right_input) = (left_rows.clone(), right_rows.clone());
    let changes = run_graph(1, move |graph| {
        let left = static_table(graph, left_input.clone())?;
        let right = static_table(graph, right_input.clone())?;
        let joined = graph.join_tables(
            left,
            right,
            vec![path(&[0])],
            vec![path(&[0])],
            JoinType::Inner,
            ShardPolicy::from_last_column_is_instance(false),
            no_properties(),
        )?;
        capture_table(graph, joined, vec![path(&[0]), path(&[2])])
    })?;
    for time in 0..5 {
        let seen: Vec<Change> = changes
            .iter()
            .filter(|change| change.time <= time)
            .cloned()
            .collect();
        let mut expected = Vec::new();
        for (left_key, left_value) in state_at(&left_rows, time) {
            for (right_key, right_value) in state_at(&right_rows, time) {
                if left_value == right_value {
                    expected.push(vec![Value::from(left_key), Value::from(right_key)]);
                }
            }
        }
        expected.sort();
        assert_eq!(final_rows(&seen), expected, "state at time {time}");
    }
    Ok(())
}

#[test]
fn test_join_and_ix_policies_from_flags() {
    assert_eq!(
        JoinType::from_assign_left_right(false, true, true).unwrap(),
        JoinType::FullOuter
    );
    assert_eq!(
        JoinType::from_assign_left_right(true, true, false).unwrap(),
        JoinType::LeftKeysFull
    );
    assert_matches!(
        JoinType::from_assign_left_right(true, false, true),
        Err(Error::BadJoinType)
    );
    assert_eq!(
        IxKeyPolicy::from_strict_optional(true, true).unwrap(),
        IxKeyPolicy::ForwardNone
    );
    assert_matches!(
        IxKeyPolicy::from_strict_optional(false, true),
        Err(Error::BadIxKeyPolicy)
    );
}
