// Copyright © 2024 Pathway

#![allow(clippy::disallowed_methods)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use futures::FutureExt;

use super::helpers::{
    capture_table, final_rows, ints, no_properties, path, row, row_at, run_graph,
    static_table, timeline,
};

use pathway_core::engine::{
    AsyncApplyFn, DataError, DynError, Error, Graph, Key, TableHandle, TableProperties, Trace, Type,
    Value,
};

/// Returns a fresh number on every call, so recomputing a deleted row would
/// produce a value that was never inserted.
fn ticket_counter() -> AsyncApplyFn {
    let next = Arc::new(AtomicI64::new(100));
    Arc::new(move |_key: Key, _args: &[Value]| {
        let next = next.clone();
        async move {
            tokio::task::yield_now().await;
            Ok::<_, DynError>(Value::Int(next.fetch_add(1, Ordering::SeqCst)))
        }
        .boxed()
    })
}

fn apply(
    graph: &dyn Graph,
    function: AsyncApplyFn,
    table: TableHandle,
    dtype: Type,
    trace: Trace,
) -> pathway_core::engine::Result<TableHandle> {
    graph.async_apply_table(
        function,
        table,
        vec![path(&[0])],
        Arc::new(TableProperties::of_types([dtype])),
        None,
        trace,
    )
}

#[test]
fn test_deletion_reuses_computed_value() -> eyre::Result<()> {
    let changes = run_graph(1, |graph| {
        let input = static_table(
            graph,
            vec![row(1, ints(&[1])), row_at(1, ints(&[1]), 2, -1)],
        )?;
        let applied = apply(graph, ticket_counter(), input, Type::Int, Trace::Empty)?;
        capture_table(graph, applied, vec![path(&[0])])
    })?;
    assert_eq!(
        timeline(&changes),
        vec![(0, ints(&[100]), 1), (2, ints(&[100]), -1)]
    );
    Ok(())
}

#[test]
fn test_every_row_gets_a_result() -> eyre::Result<()> {
    let changes = run_graph(2, |graph| {
        let input = static_table(graph, (1..=20).map(|i| row(i, ints(&[i]))).collect())?;
        let doubled: AsyncApplyFn = Arc::new(|_key: Key, args: &[Value]| {
            let argument = args[0].clone();
            async move {
                let doubled = argument.as_int()? * 2;
                Ok::<_, DynError>(Value::Int(doubled))
            }
            .boxed()
        });
        let applied = apply(graph, doubled, input, Type::Int, Trace::Empty)?;
        capture_table(graph, applied, vec![path(&[0])])
    })?;
    let expected: Vec<_> = (1..=20).map(|i| ints(&[2 * i])).collect();
    assert_eq!(final_rows(&changes), expected);
    Ok(())
}

fn failing() -> AsyncApplyFn {
    Arc::new(|_key: Key, _args: &[Value]| {
        async { Err::<Value, DynError>(DataError::ValueError("unavailable".to_string()).into()) }
            .boxed()
    })
}

#[test]
fn test_failures_follow_column_type() -> eyre::Result<()> {
    let optional = run_graph(1, |graph| {
        let input = static_table(graph, vec![row(1, ints(&[1]))])?;
        let applied = apply(
            graph,
            failing(),
            input,
            Type::Optional(Arc::new(Type::Int)),
            Trace::Empty,
        )?;
        capture_table(graph, applied, vec![path(&[0])])
    })?;
    assert_eq!(final_rows(&optional), vec![vec![Value::None]]);

    let any = run_graph(1, |graph| {
        let input = static_table(graph, vec![row(1, ints(&[1]))])?;
        let applied = apply(graph, failing(), input, Type::Any, Trace::Empty)?;
        capture_table(graph, applied, vec![path(&[0])])
    })?;
    assert_eq!(final_rows(&any), vec![vec![Value::Error]]);

    let strict = run_graph(1, |graph| {
        let input = static_table(graph, vec![row(1, ints(&[1]))])?;
        let applied = apply(graph, failing(), input, Type::Int, Trace::Empty)?;
        capture_table(graph, applied, vec![path(&[0])])
    });
    assert_matches!(
        strict,
        Err(Error::Data(DataError::ValueError(message))) if message == "unavailable"
    );
    Ok(())
}

#[test]
fn test_failure_carries_trace() {
    let trace = Trace::Frame {
        line: "table.select(x=fetch(table.a))".to_string(),
        file_name: "pipeline.py".to_string(),
        line_number: 12,
        function: "main".to_string(),
    };
    let result = run_graph(1, move |graph| {
        let input = static_table(graph, vec![row(1, ints(&[1]))])?;
        let applied = apply(graph, failing(), input, Type::Int, trace.clone())?;
        capture_table(graph, applied, vec![path(&[0])])
    });
    assert_matches!(
        result,
        Err(Error::WithTrace {
            trace: Trace::Frame {
                line_number: 12,
                ..
            },
            ..
        })
    );
}

#[test]
fn test_async_apply_is_rejected_inside_iteration() {
    let result = run_graph(1, |graph| {
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
                    let applied =
                        apply(scope, ticket_counter(), iterated[0], Type::Int, Trace::Empty)?;
                    Ok((vec![applied], vec![]))
                },
            ),
        )?;
        capture_table(graph, results[0], vec![path(&[0])])
    });
    assert_matches!(result, Err(Error::NotSupportedInIteration));
}
