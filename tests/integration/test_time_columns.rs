// Copyright © 2024 Pathway

#![allow(clippy::disallowed_methods)]

use super::helpers::{
    capture_table, final_rows, ints, no_properties, path, row_at, run_graph, static_table,
    timeline, Change,
};

use pathway_core::connectors::DataRow;
use pathway_core::engine::{JoinType, Reducer, ReducerData, Result, ShardPolicy, Value};

// rows are (threshold, current time)
fn events() -> Vec<DataRow> {
    vec![
        row_at(1, ints(&[10, 1]), 0, 1),
        row_at(2, ints(&[20, 12]), 2, 1),
        row_at(3, ints(&[5, 12]), 4, 1),
    ]
}

#[test]
fn test_buffer_holds_rows_until_threshold() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(graph, events())?;
        let buffered = graph.buffer(table, path(&[0]), path(&[1]), no_properties())?;
        capture_table(graph, buffered, vec![path(&[0])])
    })?;
    // the row with threshold 20 is never released
    assert_eq!(
        timeline(&changes),
        vec![(2, ints(&[10]), 1), (4, ints(&[5]), 1)]
    );
    Ok(())
}

#[test]
fn test_freeze_drops_late_rows() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(graph, events())?;
        let frozen = graph.freeze(table, path(&[0]), path(&[1]), no_properties())?;
        capture_table(graph, frozen, vec![path(&[0])])
    })?;
    assert_eq!(
        timeline(&changes),
        vec![(0, ints(&[10]), 1), (2, ints(&[20]), 1)]
    );
    Ok(())
}

fn run_forget(mark_forgetting_records: bool, filter_out: bool) -> Result<Vec<Change>> {
    run_graph(1, move |graph| {
        let table = static_table(graph, events())?;
        let mut forgotten = graph.forget(
            table,
            path(&[0]),
            path(&[1]),
            mark_forgetting_records,
            no_properties(),
        )?;
        if filter_out {
            forgotten = graph.filter_out_results_of_forgetting(forgotten, no_properties())?;
        }
        capture_table(graph, forgotten, vec![path(&[0])])
    })
}

#[test]
fn test_forget_retracts_rows_past_threshold() -> eyre::Result<()> {
    let changes = run_forget(false, false)?;
    assert_eq!(
        timeline(&changes),
        vec![
            (0, ints(&[10]), 1),
            (2, ints(&[10]), -1),
            (2, ints(&[20]), 1),
        ]
    );
    assert_eq!(final_rows(&changes), vec![ints(&[20])]);
    Ok(())
}

#[test]
fn test_marked_forgetting_can_be_filtered_out() -> eyre::Result<()> {
    let marked = run_forget(true, false)?;
    assert_eq!(final_rows(&marked), vec![ints(&[20])]);
    let kept = run_forget(true, true)?;
    assert_eq!(final_rows(&kept), vec![ints(&[5]), ints(&[10]), ints(&[20])]);
    Ok(())
}

#[test]
fn test_forget_immediately_outputs_nothing() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(graph, events())?;
        let forgotten = graph.forget_immediately(table, no_properties())?;
        capture_table(graph, forgotten, vec![path(&[0])])
    })?;
    assert!(changes.is_empty());

    let changes = run_graph(1, |graph| {
        let table = static_table(graph, events())?;
        let forgotten = graph.forget_immediately(table, no_properties())?;
        let kept = graph.filter_out_results_of_forgetting(forgotten, no_properties())?;
        capture_table(graph, kept, vec![path(&[0])])
    })?;
    assert_eq!(final_rows(&changes).len(), 3);
    Ok(())
}

fn threshold(lower: f64, value: f64, upper: f64) -> Vec<Value> {
    vec![Value::from(lower), Value::from(value), Value::from(upper)]
}

#[test]
fn test_gradual_broadcast_moves_rows_to_upper_bound() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let input = static_table(
            graph,
            (1..=5)
                .map(|i| row_at(i, ints(&[i]), 0, 1))
                .chain([row_at(6, ints(&[6]), 4, 1)])
                .collect(),
        )?;
        let thresholds = static_table(
            graph,
            vec![
                row_at(100, threshold(10.0, 10.0, 20.0), 0, 1),
                row_at(100, threshold(10.0, 10.0, 20.0), 2, -1),
                row_at(100, threshold(10.0, 20.0, 20.0), 2, 1),
            ],
        )?;
        let broadcast = graph.gradual_broadcast(
            input,
            thresholds,
            path(&[0]),
            path(&[1]),
            path(&[2]),
            no_properties(),
        )?;
        capture_table(graph, broadcast, vec![path(&[0, 0]), path(&[1])])
    })?;
    let rows = final_rows(&changes);
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|row| row[1] == Value::from(20.0)));
    let at_start: Vec<_> = timeline(&changes)
        .into_iter()
        .filter(|(time, _values, _diff)| *time == 0)
        .collect();
    assert_eq!(at_start.len(), 5);
    assert!(at_start
        .iter()
        .all(|(_time, values, diff)| values[1] == Value::from(10.0) && *diff == 1));
    Ok(())
}

#[test]
fn test_deleting_a_forgotten_row_is_ignored() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let table = static_table(
            graph,
            vec![row_at(1, ints(&[7]), 0, 1), row_at(1, ints(&[7]), 2, -1)],
        )?;
        let forgotten = graph.forget_immediately(table, no_properties())?;
        let counts = graph.group_by_table(
            forgotten,
            vec![path(&[0])],
            ShardPolicy::from_last_column_is_instance(false),
            vec![
                ReducerData::new(Reducer::Any, vec![path(&[0])]),
                ReducerData::new(Reducer::Count, vec![]),
            ],
            false,
            no_properties(),
        )?;
        let kept = graph.filter_out_results_of_forgetting(counts, no_properties())?;
        capture_table(graph, kept, vec![path(&[0]), path(&[1])])
    })?;
    assert_eq!(timeline(&changes), vec![(0, ints(&[7, 1]), 1)]);
    Ok(())
}

// rows are (value, instance)
fn asof_now_data() -> Vec<DataRow> {
    vec![
        row_at(2, ints(&[4, 1]), 1, 1),
        row_at(2, ints(&[4, 1]), 4, -1),
        row_at(5, ints(&[5, 1]), 5, 1),
        row_at(7, ints(&[2, 2]), 7, 1),
        row_at(7, ints(&[2, 2]), 11, -1),
        row_at(11, ints(&[3, 2]), 12, 1),
        row_at(5, ints(&[5, 1]), 15, -1),
        row_at(14, ints(&[9, 1]), 16, 1),
    ]
}

fn asof_now_queries() -> Vec<DataRow> {
    // (value, instance, time)
    [
        (1, 1, 0), (2, 1, 2), (3, 1, 3), (4, 1, 6), (5, 2, 8), (6, 1, 9), (7, 2, 10), (8, 1, 13),
        (9, 2, 14),
    ]
    .into_iter()
    .map(|(value, instance, time)| row_at(100 + value, ints(&[value, instance]), time, 1))
    .collect()
}

#[test]
fn test_queries_join_the_data_current_at_their_time() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let queries = static_table(graph, asof_now_queries())?;
        let data = static_table(graph, asof_now_data())?;
        let forgotten = graph.forget_immediately(queries, no_properties())?;
        let joined = graph.join_tables(
            forgotten,
            data,
            vec![path(&[1])],
            vec![path(&[1])],
            JoinType::Inner,
            ShardPolicy::from_last_column_is_instance(false),
            no_properties(),
        )?;
        let answers = graph.filter_out_results_of_forgetting(joined, no_properties())?;
        capture_table(graph, answers, vec![path(&[1, 0]), path(&[3, 0])])
    })?;
    assert_eq!(
        final_rows(&changes),
        vec![
            ints(&[2, 4]),
            ints(&[3, 4]),
            ints(&[4, 5]),
            ints(&[5, 2]),
            ints(&[6, 5]),
            ints(&[7, 2]),
            ints(&[8, 5]),
            ints(&[9, 3]),
        ]
    );
    assert!(changes.iter().all(|change| change.diff == 1));
    Ok(())
}
