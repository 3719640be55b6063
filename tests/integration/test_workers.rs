// Copyright © 2024 Pathway

#![allow(clippy::disallowed_methods)]

use std::thread;
use std::time::Duration;

use super::helpers::{
    capture_table, final_state, ints, no_properties, path, row_at, run_graph, static_table,
    timeline, Change,
};

use pathway_core::connectors::{ConnectorMode, DataRow, InputSubject};
use pathway_core::engine::{
    DynResult, Graph, JoinType, Reducer, ReducerData, Result, ShardPolicy, TableHandle,
    Value,
};

fn orders() -> Vec<DataRow> {
    // (customer, amount), some removed later
    (0..60)
        .flat_map(|i: i64| {
            let inserted = row_at(i, ints(&[i % 7, i]), (i % 5).unsigned_abs(), 1);
            if i % 4 == 0 {
                let removed = row_at(i, ints(&[i % 7, i]), 6, -1);
                vec![inserted, removed]
            } else {
                vec![inserted]
            }
        })
        .collect()
}

fn customers() -> Vec<DataRow> {
    (0..7)
        .map(|i: i64| row_at(1000 + i, vec![Value::Int(i), Value::from(format!("c{i}"))], 0, 1))
        .collect()
}

/// Total amount per customer name.
fn totals(graph: &dyn Graph, orders: TableHandle, customers: TableHandle) -> Result<TableHandle> {
    let joined = graph.join_tables(
        orders,
        customers,
        vec![path(&[0])],
        vec![path(&[0])],
        JoinType::Inner,
        ShardPolicy::from_last_column_is_instance(false),
        no_properties(),
    )?;
    graph.group_by_table(
        joined,
        vec![path(&[3, 1])],
        ShardPolicy::from_last_column_is_instance(false),
        vec![
            ReducerData::new(Reducer::Any, vec![path(&[3, 1])]),
            ReducerData::new(Reducer::IntSum, vec![path(&[1, 1])]),
            ReducerData::new(Reducer::Count, vec![]),
        ],
        false,
        no_properties(),
    )
}

fn run_totals(workers: usize) -> Result<Vec<Change>> {
    run_graph(workers, |graph| {
        let orders = static_table(graph, orders())?;
        let customers = static_table(graph, customers())?;
        let totals = totals(graph, orders, customers)?;
        capture_table(graph, totals, vec![path(&[0]), path(&[1]), path(&[2])])
    })
}

#[test]
fn test_results_do_not_depend_on_worker_count() -> eyre::Result<()> {
    let single = run_totals(1)?;
    assert_eq!(final_state(&single).len(), 7);
    for workers in [2, 4] {
        let many = run_totals(workers)?;
        assert_eq!(final_state(&many), final_state(&single));
        assert_eq!(timeline(&many), timeline(&single));
    }
    Ok(())
}

fn run_sorted(workers: usize) -> Result<Vec<Change>> {
    run_graph(workers, |graph| {
        let table = static_table(graph, orders())?;
        let sorted = graph.sort_table(table, path(&[1]), path(&[0]), no_properties())?;
        capture_table(graph, sorted, vec![path(&[1]), path(&[2])])
    })
}

#[test]
fn test_sort_on_many_workers() -> eyre::Result<()> {
    assert_eq!(final_state(&run_sorted(3)?), final_state(&run_sorted(1)?));
    Ok(())
}

#[test]
fn test_explicitly_sharded_rows_are_all_processed() -> eyre::Result<()> {
    let rows: Vec<DataRow> = (0..10)
        .map(|i: i64| row_at(i, ints(&[i % 2, i]), 0, 1).with_shard(1))
        .collect();
    let changes = run_graph(2, move |graph| {
        let table = static_table(graph, rows.clone())?;
        let counts = graph.group_by_table(
            table,
            vec![path(&[0])],
            ShardPolicy::from_last_column_is_instance(false),
            vec![
                ReducerData::new(Reducer::Any, vec![path(&[0])]),
                ReducerData::new(Reducer::Count, vec![]),
            ],
            false,
            no_properties(),
        )?;
        capture_table(graph, counts, vec![path(&[0]), path(&[1])])
    })?;
    let mut finals: Vec<Vec<Value>> = final_state(&changes).into_values().collect();
    finals.sort();
    assert_eq!(finals, vec![ints(&[0, 5]), ints(&[1, 5])]);
    Ok(())
}

#[test]
fn test_streaming_input_on_many_workers() -> eyre::Result<()> {
    let subject = InputSubject::new();
    let feeder = subject.clone();
    let producer = thread::spawn(move || -> DynResult<()> {
        for time in 0..4u64 {
            for i in 0..5i64 {
                let id = i64::try_from(time)? * 10 + i;
                feeder.push(row_at(id, ints(&[i % 2, id]), time * 2, 1))?;
            }
            feeder.advance_to(time * 2 + 1);
            thread::sleep(Duration::from_millis(5));
        }
        feeder.close();
        Ok(())
    });
    let changes = run_graph(3, move |graph| {
        let input =
            graph.connector_table(subject.clone(), ConnectorMode::Streaming, no_properties(), None)?;
        let counts = graph.group_by_table(
            input,
            vec![path(&[0])],
            ShardPolicy::from_last_column_is_instance(false),
            vec![
                ReducerData::new(Reducer::Any, vec![path(&[0])]),
                ReducerData::new(Reducer::Count, vec![]),
            ],
            false,
            no_properties(),
        )?;
        capture_table(graph, counts, vec![path(&[0]), path(&[1])])
    })?;
    producer
        .join()
        .map_err(|_| eyre::eyre!("producer panicked"))?
        .map_err(|e| eyre::eyre!("{e}"))?;
    let mut finals: Vec<Vec<Value>> = final_state(&changes).into_values().collect();
    finals.sort();
    assert_eq!(finals, vec![ints(&[0, 12]), ints(&[1, 8])]);
    Ok(())
}

#[test]
fn test_times_beyond_signed_range_keep_their_value() -> eyre::Result<()> {
    let late = u64::MAX - 2;
    let subject = InputSubject::new();
    subject.push_all((0..6).map(|i: i64| row_at(i, ints(&[i]), late, 1)))?;
    subject.close();
    let changes = run_graph(2, move |graph| {
        let input =
            graph.connector_table(subject.clone(), ConnectorMode::Streaming, no_properties(), None)?;
        capture_table(graph, input, vec![path(&[0])])
    })?;
    assert_eq!(changes.len(), 6);
    assert!(changes.iter().all(|change| change.time == late));
    Ok(())
}
