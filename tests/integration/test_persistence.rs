// Copyright © 2024 Pathway

#![allow(clippy::disallowed_methods)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use futures::FutureExt;

use super::helpers::{
    capture_table, capture_table_skipping, final_rows, ints, key, no_properties, path, row_at,
    run_graph_with_persistence, static_table, timeline, Captured, Change,
};

use pathway_core::connectors::snapshot::chunk_key;
use pathway_core::connectors::{ConnectorMode, DataRow, InputSubject};
use pathway_core::engine::{
    AsyncApplyFn, DynError, Error, Key, Reducer, ReducerData, Result, ShardPolicy,
    SubscribeCallbacksBuilder, Trace, Value,
};
use pathway_core::persistence::backends::{MemoryKVStorage, PersistenceBackend};
use pathway_core::persistence::{
    IntoPersistentId, PersistenceConfig, PersistenceError, PersistenceMode,
    PersistentStorageConfig, SnapshotAccess,
};

fn persistence(storage: &MemoryKVStorage) -> PersistenceConfig {
    PersistenceConfig::new(
        PersistentStorageConfig::Memory(storage.clone()),
        SnapshotAccess::Full,
        PersistenceMode::Persisting,
        true,
    )
}

fn category(id: i64, name: &str, time: u64) -> DataRow {
    row_at(id, vec![Value::from(name)], time, 1)
}

/// Counts rows per category of a persisted input fed with `rows`.
fn count_categories(
    storage: &MemoryKVStorage,
    rows: Vec<DataRow>,
    skip_persisted_batch: bool,
) -> Result<Vec<Change>> {
    let subject = InputSubject::new();
    subject.push_all(rows)?;
    subject.close();
    run_graph_with_persistence(1, Some(persistence(storage)), move |graph| {
        let input = graph.connector_table(
            subject.clone(),
            ConnectorMode::Streaming,
            no_properties(),
            Some("events".into_persistent_id()),
        )?;
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
        capture_table_skipping(
            graph,
            counts,
            vec![path(&[0]), path(&[1])],
            skip_persisted_batch,
        )
    })
}

#[test]
fn test_restart_continues_from_snapshot() -> eyre::Result<()> {
    let storage = MemoryKVStorage::new();
    let first = count_categories(
        &storage,
        vec![category(1, "x", 2), category(2, "x", 4)],
        false,
    )?;
    assert_eq!(
        timeline(&first),
        vec![
            (2, vec![Value::from("x"), Value::Int(1)], 1),
            (4, vec![Value::from("x"), Value::Int(1)], -1),
            (4, vec![Value::from("x"), Value::Int(2)], 1),
        ]
    );

    // the source is read from the start again, already processed rows are
    // skipped and so is the output of the replayed state
    let second = count_categories(
        &storage,
        vec![category(1, "x", 2), category(2, "x", 4), category(3, "x", 6)],
        true,
    )?;
    assert_eq!(
        timeline(&second),
        vec![
            (6, vec![Value::from("x"), Value::Int(2)], -1),
            (6, vec![Value::from("x"), Value::Int(3)], 1),
        ]
    );
    Ok(())
}

#[test]
fn test_replayed_state_is_visible_without_skipping() -> eyre::Result<()> {
    let storage = MemoryKVStorage::new();
    count_categories(&storage, vec![category(1, "x", 2), category(2, "y", 4)], false)?;
    let second = count_categories(&storage, vec![], false)?;
    assert_eq!(
        timeline(&second),
        vec![
            (0, vec![Value::from("x"), Value::Int(1)], 1),
            (0, vec![Value::from("y"), Value::Int(1)], 1),
        ]
    );
    Ok(())
}

#[test]
fn test_corrupted_chunk_is_reported() -> eyre::Result<()> {
    let storage = MemoryKVStorage::new();
    count_categories(&storage, vec![category(1, "x", 2)], false)?;
    storage.overwrite(
        &chunk_key("events".into_persistent_id(), 0, 0),
        vec![0xff; 3],
    );
    let result = count_categories(&storage, vec![], false);
    assert_matches!(
        result,
        Err(Error::Persistence(PersistenceError::CorruptedChunk(_, _)))
    );
    Ok(())
}

#[test]
fn test_nothing_is_committed_when_another_worker_fails() -> eyre::Result<()> {
    let storage = MemoryKVStorage::new();
    let subject = InputSubject::new();
    subject.push_all((0..20).map(|id| category(id, "x", 2)))?;
    subject.close();
    let result = run_graph_with_persistence(2, Some(persistence(&storage)), move |graph| {
        let input = graph.connector_table(
            subject.clone(),
            ConnectorMode::Streaming,
            no_properties(),
            Some("events".into_persistent_id()),
        )?;
        // only the second worker's sink breaks; the snapshot is written by the first one
        let fails = graph.worker_index() == 1;
        graph.subscribe_table(
            input,
            vec![path(&[0])],
            SubscribeCallbacksBuilder::new()
                .on_time_end(Box::new(move |_time| {
                    if fails {
                        Err("sink unavailable".into())
                    } else {
                        Ok(())
                    }
                }))
                .build(),
            false,
        )?;
        Ok(Captured::default())
    });
    assert_matches!(result, Err(Error::Other(error)) if error.to_string() == "sink unavailable");
    assert_eq!(storage.list_keys()?, Vec::<String>::new());
    Ok(())
}

#[test]
fn test_persistent_id_requires_storage() {
    let result = run_graph_with_persistence(1, None, |graph| {
        let input = graph.connector_table(
            InputSubject::new(),
            ConnectorMode::Static,
            no_properties(),
            Some("events".into_persistent_id()),
        )?;
        capture_table(graph, input, vec![path(&[0])])
    });
    assert_matches!(result, Err(Error::NoPersistentStorage(_)));
}

#[test]
fn test_persistent_id_used_twice() {
    let storage = MemoryKVStorage::new();
    let result = run_graph_with_persistence(1, Some(persistence(&storage)), |graph| {
        let subject = InputSubject::new();
        subject.close();
        let first = graph.connector_table(
            subject.clone(),
            ConnectorMode::Static,
            no_properties(),
            Some("events".into_persistent_id()),
        )?;
        graph.connector_table(
            subject,
            ConnectorMode::Static,
            no_properties(),
            Some("events".into_persistent_id()),
        )?;
        capture_table(graph, first, vec![path(&[0])])
    });
    assert_matches!(result, Err(Error::ValueError(_)));
}

fn counting_function(calls: Arc<AtomicUsize>) -> AsyncApplyFn {
    Arc::new(move |_key: Key, args: &[Value]| {
        let calls = calls.clone();
        let argument = args[0].clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DynError>(Value::from(vec![argument.clone(), argument]))
        }
        .boxed()
    })
}

fn apply_cached(storage: &MemoryKVStorage, calls: &Arc<AtomicUsize>) -> Result<Vec<Change>> {
    let function = counting_function(calls.clone());
    run_graph_with_persistence(1, Some(persistence(storage)), move |graph| {
        let input = static_table(
            graph,
            vec![
                row_at(1, vec![Value::Int(1)], 0, 1),
                row_at(2, vec![Value::Int(2)], 0, 1),
            ],
        )?;
        let applied = graph.async_apply_table(
            function.clone(),
            input,
            vec![path(&[0])],
            no_properties(),
            Some("doubler".into_persistent_id()),
            Trace::Empty,
        )?;
        capture_table(graph, applied, vec![path(&[0])])
    })
}

#[test]
fn test_function_results_are_cached_between_runs() -> eyre::Result<()> {
    let storage = MemoryKVStorage::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let first = apply_cached(&storage, &calls)?;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let second = apply_cached(&storage, &calls)?;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first, second);
    assert_eq!(
        first.iter().find(|change| change.key == key(2)).map(|change| &change.values),
        Some(&vec![Value::from(vec![Value::Int(2), Value::Int(2)])])
    );
    Ok(())
}

fn forget_events(storage: &MemoryKVStorage, rows: Vec<DataRow>) -> Result<Vec<Change>> {
    let subject = InputSubject::new();
    subject.push_all(rows)?;
    subject.close();
    run_graph_with_persistence(1, Some(persistence(storage)), move |graph| {
        let input = graph.connector_table(
            subject.clone(),
            ConnectorMode::Streaming,
            no_properties(),
            Some("forgotten".into_persistent_id()),
        )?;
        let kept = graph.forget(input, path(&[0]), path(&[1]), false, no_properties())?;
        capture_table(graph, kept, vec![path(&[0])])
    })
}

#[test]
fn test_forget_after_replay_keeps_same_rows() -> eyre::Result<()> {
    let storage = MemoryKVStorage::new();
    // rows are (threshold, current time)
    let live = forget_events(
        &storage,
        vec![
            row_at(1, ints(&[10, 1]), 0, 1),
            row_at(2, ints(&[20, 12]), 2, 1),
            row_at(3, ints(&[5, 12]), 4, 1),
        ],
    )?;
    let replayed = forget_events(&storage, vec![])?;
    assert_eq!(final_rows(&live), vec![ints(&[20])]);
    assert_eq!(final_rows(&replayed), final_rows(&live));
    Ok(())
}
