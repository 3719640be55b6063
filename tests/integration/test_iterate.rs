// Copyright © 2024 Pathway

#![allow(clippy::disallowed_methods)]

use assert_matches::assert_matches;

use super::helpers::{
    capture_table, final_rows, final_state, ints, key, no_properties, path, row, row_at,
    static_table, Captured, Change,
};

use pathway_core::connectors::{ConnectorMode, InputSubject};
use pathway_core::engine::{
    run_with_new_dataflow_graph, Config, DynResult, Error, Graph, IterationStatus,
    IterationStatusHandle, JoinType, MonitoringLevel, Reducer, ReducerData, Result, ShardPolicy,
    TableHandle, Value,
};

fn run_iteration(
    workers: usize,
    logic: impl Fn(&dyn Graph) -> DynResult<Captured> + Send + Sync + 'static,
) -> Result<(Vec<Change>, Option<IterationStatus>)> {
    let results = run_with_new_dataflow_graph(
        move |graph| {
            let captured = logic(graph)?;
            Ok((captured, graph.iteration_status_handle()))
        },
        |(captured, status): (Captured, IterationStatusHandle)| (captured.take(), status.get()),
        Config::with_threads(workers)?,
        MonitoringLevel::None,
        None,
    )?;
    let status = results.first().and_then(|(_changes, status)| *status);
    let mut changes: Vec<Change> = results
        .into_iter()
        .flat_map(|(changes, _status)| changes)
        .collect();
    changes.sort();
    Ok((changes, status))
}

fn whole_key() -> ShardPolicy {
    ShardPolicy::from_last_column_is_instance(false)
}

/// One step of the smallest-label propagation: every node takes the
/// smallest label among its own and its neighbours'.
fn propagate_labels(
    scope: &dyn Graph,
    labels: TableHandle,
    edges: TableHandle,
) -> DynResult<TableHandle> {
    let joined = scope.join_tables(
        labels,
        edges,
        vec![path(&[0])],
        vec![path(&[0])],
        JoinType::Inner,
        whole_key(),
        no_properties(),
    )?;
    let offered = scope.flatten_table_storage(joined, vec![path(&[3, 1]), path(&[1, 1])])?;
    let candidates = scope.concat_tables(vec![labels, offered], no_properties())?;
    let smallest = scope.group_by_table(
        candidates,
        vec![path(&[0])],
        whole_key(),
        vec![
            ReducerData::new(Reducer::Any, vec![path(&[0])]),
            ReducerData::new(Reducer::Min, vec![path(&[1])]),
        ],
        true,
        no_properties(),
    )?;
    Ok(smallest)
}

fn node(id: i64) -> Vec<Value> {
    vec![Value::from(key(id)), Value::Int(id)]
}

fn undirected_chain(graph: &dyn Graph, length: i64) -> Result<TableHandle> {
    let mut edges = Vec::new();
    for i in 1..length {
        let (a, b) = (Value::from(key(i)), Value::from(key(i + 1)));
        edges.push(row(100 + 2 * i, vec![a.clone(), b.clone()]));
        edges.push(row(101 + 2 * i, vec![b, a]));
    }
    static_table(graph, edges)
}

#[test]
fn test_label_propagation_converges() -> eyre::Result<()> {
    let (changes, status) = run_iteration(1, |graph| {
        let labels = static_table(graph, (1..=4).map(|i| row(i, node(i))).collect())?;
        let edges = undirected_chain(graph, 4)?;
        let (results, _) = graph.iterate(
            vec![labels],
            vec![],
            vec![edges],
            None,
            Box::new(
                |scope: &dyn Graph,
                 iterated: Vec<TableHandle>,
                 _with_universe: Vec<TableHandle>,
                 extra: Vec<TableHandle>| {
                    let next = propagate_labels(scope, iterated[0], extra[0])?;
                    Ok((vec![next], vec![]))
                },
            ),
        )?;
        // no round has run while the graph is being built
        assert!(graph.iteration_status().is_none());
        capture_table(graph, results[0], vec![path(&[1])])
    })?;
    let state = final_state(&changes);
    assert_eq!(state.len(), 4);
    for id in 1..=4 {
        assert_eq!(state.get(&key(id)), Some(&ints(&[1])));
    }
    assert_eq!(status, Some(IterationStatus::Converged { iterations: 4 }));
    Ok(())
}

fn closure_step(
    scope: &dyn Graph,
    reach: TableHandle,
    edges: TableHandle,
) -> DynResult<TableHandle> {
    let joined = scope.join_tables(
        reach,
        edges,
        vec![path(&[1])],
        vec![path(&[0])],
        JoinType::Inner,
        whole_key(),
        no_properties(),
    )?;
    let extended = scope.flatten_table_storage(joined, vec![path(&[1, 0]), path(&[3, 1])])?;
    let all = scope.concat_tables(vec![reach, extended], no_properties())?;
    let distinct = scope.group_by_table(
        all,
        vec![path(&[0]), path(&[1])],
        whole_key(),
        vec![
            ReducerData::new(Reducer::Any, vec![path(&[0])]),
            ReducerData::new(Reducer::Any, vec![path(&[1])]),
        ],
        false,
        no_properties(),
    )?;
    Ok(distinct)
}

fn transitive_closure(limit: Option<u32>) -> Result<(Vec<Change>, Option<IterationStatus>)> {
    run_iteration(1, move |graph| {
        let edges = static_table(graph, (1..5).map(|i| row(i, ints(&[i, i + 1]))).collect())?;
        let (_, results) = graph.iterate(
            vec![],
            vec![edges],
            vec![edges],
            limit,
            Box::new(
                |scope: &dyn Graph,
                 _iterated: Vec<TableHandle>,
                 with_universe: Vec<TableHandle>,
                 extra: Vec<TableHandle>| {
                    let next = closure_step(scope, with_universe[0], extra[0])?;
                    Ok((vec![], vec![next]))
                },
            ),
        )?;
        capture_table(graph, results[0], vec![path(&[0]), path(&[1])])
    })
}

#[test]
fn test_transitive_closure() -> eyre::Result<()> {
    let (changes, status) = transitive_closure(None)?;
    let mut expected = Vec::new();
    for from in 1..=5 {
        for to in from + 1..=5 {
            expected.push(ints(&[from, to]));
        }
    }
    assert_eq!(final_rows(&changes), expected);
    assert_matches!(status, Some(IterationStatus::Converged { .. }));
    Ok(())
}

#[test]
fn test_iteration_limit_stops_early() -> eyre::Result<()> {
    let (changes, status) = transitive_closure(Some(2))?;
    // paths of up to three edges
    assert_eq!(final_rows(&changes).len(), 9);
    assert_eq!(status, Some(IterationStatus::LimitReached { iterations: 2 }));
    Ok(())
}

#[test]
fn test_iteration_reacts_to_later_changes() -> eyre::Result<()> {
    let (changes, _status) = run_iteration(1, |graph| {
        let edges = static_table(
            graph,
            vec![
                row(1, ints(&[1, 2])),
                row_at(2, ints(&[2, 3]), 2, 1),
                row_at(1, ints(&[1, 2]), 4, -1),
            ],
        )?;
        let (_, results) = graph.iterate(
            vec![],
            vec![edges],
            vec![edges],
            None,
            Box::new(
                |scope: &dyn Graph,
                 _iterated: Vec<TableHandle>,
                 with_universe: Vec<TableHandle>,
                 extra: Vec<TableHandle>| {
                    let next = closure_step(scope, with_universe[0], extra[0])?;
                    Ok((vec![], vec![next]))
                },
            ),
        )?;
        capture_table(graph, results[0], vec![path(&[0]), path(&[1])])
    })?;
    let at = |time: u64| {
        let before: Vec<Change> = changes
            .iter()
            .filter(|change| change.time <= time)
            .cloned()
            .collect();
        final_rows(&before)
    };
    assert_eq!(at(0), vec![ints(&[1, 2])]);
    assert_eq!(at(2), vec![ints(&[1, 2]), ints(&[1, 3]), ints(&[2, 3])]);
    assert_eq!(at(4), vec![ints(&[2, 3])]);
    Ok(())
}

fn identity_iteration(graph: &dyn Graph, limit: Option<u32>) -> Result<TableHandle> {
    let table = static_table(graph, vec![row(1, ints(&[1]))])?;
    let (results, _) = graph.iterate(
        vec![table],
        vec![],
        vec![],
        limit,
        Box::new(
            |_scope: &dyn Graph,
             iterated: Vec<TableHandle>,
             _with_universe: Vec<TableHandle>,
             _extra: Vec<TableHandle>| Ok((iterated, vec![])),
        ),
    )?;
    Ok(results[0])
}

#[test]
fn test_iteration_limit_must_exceed_one() {
    let result = run_iteration(1, |graph| {
        let table = identity_iteration(graph, Some(1))?;
        capture_table(graph, table, vec![path(&[0])])
    });
    assert_matches!(result, Err(Error::IterationLimitTooSmall));
}

#[test]
fn test_identity_iteration_converges_at_once() -> eyre::Result<()> {
    let (changes, status) = run_iteration(1, |graph| {
        let table = identity_iteration(graph, Some(2))?;
        capture_table(graph, table, vec![path(&[0])])
    })?;
    assert_eq!(final_rows(&changes), vec![ints(&[1])]);
    assert_eq!(status, Some(IterationStatus::Converged { iterations: 1 }));
    Ok(())
}

#[test]
fn test_nested_iteration_is_rejected() {
    let result = run_iteration(1, |graph| {
        let table = static_table(graph, vec![row(1, ints(&[1]))])?;
        let (results, _) = graph.iterate(
            vec![table],
            vec![],
            vec![],
            None,
            Box::new(
                |scope: &dyn Graph,
                 _iterated: Vec<TableHandle>,
                 _with_universe: Vec<TableHandle>,
                 _extra: Vec<TableHandle>| {
                    let inner = identity_iteration(scope, None)?;
                    Ok((vec![inner], vec![]))
                },
            ),
        )?;
        capture_table(graph, results[0], vec![path(&[0])])
    });
    assert_matches!(result, Err(Error::NotSupportedInIteration));
}

#[test]
fn test_inputs_are_rejected_inside_iteration() {
    let result = run_iteration(1, |graph| {
        let table = static_table(graph, vec![row(1, ints(&[1]))])?;
        let (results, _) = graph.iterate(
            vec![table],
            vec![],
            vec![],
            None,
            Box::new(
                |scope: &dyn Graph,
                 iterated: Vec<TableHandle>,
                 _with_universe: Vec<TableHandle>,
                 _extra: Vec<TableHandle>| {
                    scope.connector_table(
                        InputSubject::new(),
                        ConnectorMode::Static,
                        no_properties(),
                        None,
                    )?;
                    Ok((iterated, vec![]))
                },
            ),
        )?;
        capture_table(graph, results[0], vec![path(&[0])])
    });
    assert_matches!(result, Err(Error::NotSupportedInIteration));
}

#[test]
fn test_iteration_result_count_must_match() {
    let result = run_iteration(1, |graph| {
        let table = static_table(graph, vec![row(1, ints(&[1]))])?;
        let (results, _) = graph.iterate(
            vec![table],
            vec![],
            vec![],
            None,
            Box::new(
                |_scope: &dyn Graph,
                 iterated: Vec<TableHandle>,
                 _with_universe: Vec<TableHandle>,
                 _extra: Vec<TableHandle>| {
                    Ok((iterated.iter().chain(&iterated).copied().collect(), vec![]))
                },
            ),
        )?;
        capture_table(graph, results[0], vec![path(&[0])])
    });
    assert_matches!(result, Err(Error::LengthMismatch));
}

#[test]
fn test_iteration_on_many_workers() -> eyre::Result<()> {
    let (single, _) = transitive_closure(None)?;
    let (changes, status) = run_iteration(3, |graph| {
        let edges = static_table(graph, (1..5).map(|i| row(i, ints(&[i, i + 1]))).collect())?;
        let (_, results) = graph.iterate(
            vec![],
            vec![edges],
            vec![edges],
            None,
            Box::new(
                |scope: &dyn Graph,
                 _iterated: Vec<TableHandle>,
                 with_universe: Vec<TableHandle>,
                 extra: Vec<TableHandle>| {
                    let next = closure_step(scope, with_universe[0], extra[0])?;
                    Ok((vec![], vec![next]))
                },
            ),
        )?;
        capture_table(graph, results[0], vec![path(&[0]), path(&[1])])
    })?;
    assert_eq!(final_rows(&changes), final_rows(&single));
    assert_matches!(status, Some(IterationStatus::Converged { .. }));
    Ok(())
}
