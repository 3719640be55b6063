// Copyright © 2024 Pathway

#![allow(clippy::disallowed_methods)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use pathway_core::connectors::DataRow;
use pathway_core::engine::{
    run_with_new_dataflow_graph, ColumnPath, Config, DynResult, Graph, Key, MonitoringLevel,
    Result, SubscribeCallbacksBuilder, TableHandle, TableProperties, Value,
};
use pathway_core::persistence::PersistenceConfig;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Change {
    pub key: Key,
    pub values: Vec<Value>,
    pub time: u64,
    pub diff: isize,
}

pub type Captured = Rc<RefCell<Vec<Change>>>;

pub fn key(id: i64) -> Key {
    Key::for_value(&Value::from(id))
}

pub fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().copied().map(Value::from).collect()
}

pub fn row(id: i64, values: Vec<Value>) -> DataRow {
    DataRow::from_engine(key(id), values, 0, 1)
}

pub fn row_at(id: i64, values: Vec<Value>, time: u64, diff: isize) -> DataRow {
    DataRow::from_engine(key(id), values, time, diff)
}

pub fn value_paths(count: usize) -> Vec<ColumnPath> {
    (0..count).map(|i| ColumnPath::ValuePath(vec![i])).collect()
}

pub fn path(indices: &[usize]) -> ColumnPath {
    ColumnPath::ValuePath(indices.to_vec())
}

pub fn no_properties() -> Arc<TableProperties> {
    Arc::new(TableProperties::Empty)
}

pub fn static_table(graph: &dyn Graph, rows: Vec<DataRow>) -> Result<TableHandle> {
    graph.static_table(rows, no_properties())
}

pub fn capture_table(
    graph: &dyn Graph,
    table: TableHandle,
    column_paths: Vec<ColumnPath>,
) -> DynResult<Captured> {
    capture_table_skipping(graph, table, column_paths, false)
}

pub fn capture_table_skipping(
    graph: &dyn Graph,
    table: TableHandle,
    column_paths: Vec<ColumnPath>,
    skip_persisted_batch: bool,
) -> DynResult<Captured> {
    let captured: Captured = Rc::default();
    let sink = captured.clone();
    graph.subscribe_table(
        table,
        column_paths,
        SubscribeCallbacksBuilder::new()
            .on_data(Box::new(move |key, values, time, diff| {
                sink.borrow_mut().push(Change {
                    key,
                    values: values.to_vec(),
                    time,
                    diff,
                });
                Ok(())
            }))
            .build(),
        skip_persisted_batch,
    )?;
    Ok(captured)
}

pub fn run_graph(
    workers: usize,
    logic: impl Fn(&dyn Graph) -> DynResult<Captured> + Send + Sync + 'static,
) -> Result<Vec<Change>> {
    run_graph_with_persistence(workers, None, logic)
}

/// Runs `logic` on `workers` threads and returns the changes captured on
/// all of them, sorted.
pub fn run_graph_with_persistence(
    workers: usize,
    persistence_config: Option<PersistenceConfig>,
    logic: impl Fn(&dyn Graph) -> DynResult<Captured> + Send + Sync + 'static,
) -> Result<Vec<Change>> {
    let results = run_with_new_dataflow_graph(
        logic,
        |captured: Captured| captured.take(),
        Config::with_threads(workers)?,
        MonitoringLevel::None,
        persistence_config,
    )?;
    let mut changes: Vec<Change> = results.into_iter().flatten().collect();
    changes.sort();
    Ok(changes)
}

/// Table contents after applying all changes.
pub fn final_state(changes: &[Change]) -> BTreeMap<Key, Vec<Value>> {
    let mut counts: BTreeMap<(Key, Vec<Value>), isize> = BTreeMap::new();
    for change in changes {
        *counts
            .entry((change.key, change.values.clone()))
            .or_default() += change.diff;
    }
    let mut state = BTreeMap::new();
    for ((key, values), count) in counts {
        match count {
            0 => {}
            1 => {
                let previous = state.insert(key, values);
                assert!(previous.is_none(), "key {key} present twice");
            }
            count => panic!("row {values:?} has multiplicity {count}"),
        }
    }
    state
}

/// Values of the final table, ignoring keys.
pub fn final_rows(changes: &[Change]) -> Vec<Vec<Value>> {
    let mut rows: Vec<Vec<Value>> = final_state(changes).into_values().collect();
    rows.sort();
    rows
}

/// Changes ordered by time, without keys.
pub fn timeline(changes: &[Change]) -> Vec<(u64, Vec<Value>, isize)> {
    let mut timeline: Vec<_> = changes
        .iter()
        .map(|change| (change.time, change.values.clone(), change.diff))
        .collect();
    timeline.sort();
    timeline
}
