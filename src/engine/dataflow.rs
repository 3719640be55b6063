// Copyright © 2024 Pathway

pub mod async_transformer;
pub mod config;
pub mod exchange;
pub mod input;
pub mod iterate;
pub mod monitoring;
pub mod operators;
pub mod persist;
pub mod shard;

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use id_arena::Arena;
use log::{debug, info, warn};
use timely::execute;
use tokio::runtime::Runtime as TokioRuntime;

use crate::async_runtime::create_async_tokio_runtime;
use crate::connectors::data_format::Formatter;
use crate::connectors::data_storage::Writer;
use crate::connectors::{ConnectorMode, DataRow, InputSubject};
use crate::persistence::config::{PersistenceConfig, SharedBackend};
use crate::persistence::tracker::WorkerPersistentStorage;
use crate::persistence::{PersistenceError, PersistentId};

use self::async_transformer::AsyncApplyOperator;
use self::config::Config;
use self::exchange::WorkerContext;
use self::input::{Source, StaticSource, SubjectSource};
use self::iterate::{IterateOperator, IterationLayout};
pub use self::monitoring::MonitoringLevel;
use self::monitoring::{ProbeOperator, Probes, Prober, ProgressLogger};
use self::operators::gradual_broadcast::GradualBroadcastOperator;
use self::operators::group_by::GroupByOperator;
use self::operators::join::JoinOperator;
use self::operators::output::{FormattedSink, SinkOperator};
use self::operators::prev_next::SortOperator;
use self::operators::time_column::{
    BufferOperator, ForgetOperator, FreezeOperator, TimeColumns,
};
use self::operators::{
    column_logic, concat_logic, expression_logic, filter_logic, intersect_logic, new_pending,
    override_logic, reindex_logic, restrict_logic, select_logic, subtract_logic,
    update_cells_logic, update_rows_logic, zip_columns_logic, Batch, DebugOperator,
    FeedOperator, FilterOutForgettingOperator, FlattenOperator, ForgetImmediatelyOperator,
    IxOperator, KeyCombineOperator, MapLogic, MapOperator, NodeId, Operator, StepContext,
};
use self::persist::SourcePersistence;

use super::error::{DynResult, Trace};
use super::graph::{
    AsyncApplyFn, ColumnHandle, ColumnPath, ColumnProperties, ExpressionData, Graph,
    IterationLogic, IterationStatus, IterationStatusHandle, IxKeyPolicy, JoinType, ProberStats,
    ReducerData, SubscribeCallbacks, TableHandle, TableProperties, UniverseHandle,
};
use super::value::{ShardPolicy, Type};
use super::{Error, Result, Timestamp, Value};

const SOURCE_WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Operators of one dataflow, in creation order.
#[derive(Default)]
pub struct Nodes {
    operators: Vec<Box<dyn Operator>>,
}

impl Nodes {
    pub fn add(&mut self, operator: impl Operator + 'static) -> NodeId {
        self.add_boxed(Box::new(operator))
    }

    pub fn add_boxed(&mut self, operator: Box<dyn Operator>) -> NodeId {
        self.operators.push(operator);
        self.operators.len() - 1
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Steps every operator once and returns what each of them produced.
    pub fn run_step(&mut self, time: Timestamp, worker: &WorkerContext) -> Result<Vec<Batch>> {
        let mut outputs: Vec<Batch> = Vec::with_capacity(self.operators.len());
        for operator in &mut self.operators {
            let batch = {
                let ctx = StepContext::new(time, worker, &outputs);
                operator.step(&ctx)?
            };
            outputs.push(batch);
        }
        Ok(outputs)
    }

    pub fn time_end(&mut self, time: u64) -> Result<()> {
        for operator in &mut self.operators {
            operator.on_time_end(time)?;
        }
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        for operator in &mut self.operators {
            operator.on_end()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Universe {
    node: NodeId,
}

#[derive(Debug, Clone, Copy)]
struct Column {
    universe: UniverseHandle,
    node: NodeId,
}

#[derive(Debug, Clone)]
struct Table {
    universe: UniverseHandle,
    node: NodeId,
    properties: Arc<TableProperties>,
}

struct DataflowGraphInner {
    worker: WorkerContext,
    nodes: Nodes,
    universes: Arena<Universe, UniverseHandle>,
    columns: Arena<Column, ColumnHandle>,
    tables: Arena<Table, TableHandle>,
    sources: Vec<Box<dyn Source>>,
    in_iteration: bool,
    persistence: Option<WorkerPersistentStorage>,
    persisted_horizon: Rc<Cell<Option<u64>>>,
    iteration_status: Rc<Cell<Option<IterationStatus>>>,
    probes: Probes,
    probers: Vec<Prober>,
    progress_logger: ProgressLogger,
    async_runtime: Option<Rc<TokioRuntime>>,
}

impl DataflowGraphInner {
    fn new(
        worker: WorkerContext,
        monitoring_level: MonitoringLevel,
        persistence: Option<WorkerPersistentStorage>,
    ) -> Self {
        Self {
            worker,
            nodes: Nodes::default(),
            universes: Arena::new(),
            columns: Arena::new(),
            tables: Arena::new(),
            sources: Vec::new(),
            in_iteration: false,
            persistence,
            persisted_horizon: Rc::new(Cell::new(None)),
            iteration_status: Rc::new(Cell::new(None)),
            probes: Probes::default(),
            probers: Vec::new(),
            progress_logger: ProgressLogger::new(monitoring_level),
            async_runtime: None,
        }
    }

    fn new_iteration_scope(worker: WorkerContext) -> Self {
        Self {
            in_iteration: true,
            ..Self::new(worker, MonitoringLevel::None, None)
        }
    }

    fn ensure_not_in_iteration(&self) -> Result<()> {
        if self.in_iteration {
            Err(Error::NotSupportedInIteration)
        } else {
            Ok(())
        }
    }

    fn table(&self, table_handle: TableHandle) -> Result<&Table> {
        self.tables
            .get(table_handle)
            .ok_or(Error::InvalidTableHandle)
    }

    fn universe(&self, universe_handle: UniverseHandle) -> Result<&Universe> {
        self.universes
            .get(universe_handle)
            .ok_or(Error::InvalidUniverseHandle)
    }

    fn column(&self, column_handle: ColumnHandle) -> Result<&Column> {
        self.columns
            .get(column_handle)
            .ok_or(Error::InvalidColumnHandle)
    }

    fn alloc_table(
        &mut self,
        universe: Option<UniverseHandle>,
        node: NodeId,
        properties: Arc<TableProperties>,
    ) -> TableHandle {
        let universe = universe.unwrap_or_else(|| self.universes.alloc(Universe { node }));
        self.tables.alloc(Table {
            universe,
            node,
            properties,
        })
    }

    /// Adds a row-by-row transformation of a table.
    fn map_table(
        &mut self,
        table_handle: TableHandle,
        logic: MapLogic,
        same_universe: bool,
        properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let table = self.table(table_handle)?;
        let (input, universe) = (table.node, same_universe.then_some(table.universe));
        let node = self.nodes.add(MapOperator::new(input, logic));
        Ok(self.alloc_table(universe, node, properties))
    }

    fn column_trace(properties: &TableProperties, path: &ColumnPath) -> Trace {
        properties
            .column(path)
            .map_or(Trace::Empty, |column| column.trace.clone())
    }

    fn empty_table(&mut self, table_properties: Arc<TableProperties>) -> TableHandle {
        let node = self.nodes.add(FeedOperator::new(new_pending()));
        self.alloc_table(None, node, table_properties)
    }

    fn static_table(
        &mut self,
        data: Vec<DataRow>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.ensure_not_in_iteration()?;
        let pending = new_pending();
        let node = self.nodes.add(FeedOperator::new(pending.clone()));
        self.sources
            .push(Box::new(StaticSource::new(data, &self.worker, pending)));
        Ok(self.alloc_table(None, node, table_properties))
    }

    fn connector_table(
        &mut self,
        subject: InputSubject,
        mode: ConnectorMode,
        table_properties: Arc<TableProperties>,
        persistent_id: Option<PersistentId>,
    ) -> Result<TableHandle> {
        self.ensure_not_in_iteration()?;
        let persistence = match persistent_id {
            Some(persistent_id) => {
                let storage = self
                    .persistence
                    .as_mut()
                    .ok_or_else(|| Error::NoPersistentStorage(format!("{persistent_id:032x}")))?;
                if !storage.register(persistent_id) {
                    return Err(Error::ValueError(format!(
                        "persistent id {persistent_id:032x} is used by more than one source"
                    )));
                }
                if self.worker.index() == 0 {
                    Some(SourcePersistence::new(storage, persistent_id)?)
                } else {
                    None
                }
            }
            None => None,
        };
        let pending = new_pending();
        let node = self.nodes.add(FeedOperator::new(pending.clone()));
        self.sources.push(Box::new(SubjectSource::new(
            subject,
            mode,
            persistence,
            &self.worker,
            pending,
        )));
        Ok(self.alloc_table(None, node, table_properties))
    }

    fn expression_table(
        &mut self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        expressions: Vec<ExpressionData>,
    ) -> Result<TableHandle> {
        let properties = Arc::new(TableProperties::flat(
            expressions
                .iter()
                .map(|expression| expression.column_properties.clone())
                .collect(),
        ));
        self.map_table(
            table_handle,
            expression_logic(column_paths, expressions),
            true,
            properties,
        )
    }

    fn columns_to_table(
        &mut self,
        universe_handle: UniverseHandle,
        columns: Vec<ColumnHandle>,
    ) -> Result<TableHandle> {
        let mut inputs = vec![self.universe(universe_handle)?.node];
        for column_handle in columns {
            let column = self.column(column_handle)?;
            if column.universe != universe_handle {
                return Err(Error::UniverseMismatch);
            }
            inputs.push(column.node);
        }
        let properties = Arc::new(TableProperties::flat(
            (1..inputs.len())
                .map(|_| Arc::new(ColumnProperties::default()))
                .collect(),
        ));
        let node = self
            .nodes
            .add(KeyCombineOperator::new(inputs, zip_columns_logic()));
        Ok(self.alloc_table(Some(universe_handle), node, properties))
    }

    fn table_column(
        &mut self,
        table_handle: TableHandle,
        column_path: ColumnPath,
    ) -> Result<ColumnHandle> {
        let table = self.table(table_handle)?;
        let (input, universe) = (table.node, table.universe);
        let node = self
            .nodes
            .add(MapOperator::new(input, column_logic(column_path)));
        Ok(self.columns.alloc(Column { universe, node }))
    }

    fn flatten_table_storage(
        &mut self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
    ) -> Result<TableHandle> {
        let table = self.table(table_handle)?;
        let properties = Arc::new(TableProperties::flat(
            column_paths
                .iter()
                .map(|path| {
                    table
                        .properties
                        .column(path)
                        .cloned()
                        .unwrap_or_default()
                })
                .collect(),
        ));
        self.map_table(table_handle, select_logic(column_paths), true, properties)
    }

    fn async_runtime(&mut self) -> Result<Rc<TokioRuntime>> {
        if let Some(runtime) = self.async_runtime.as_ref() {
            return Ok(runtime.clone());
        }
        let threads = thread::available_parallelism().map_or(1, |threads| {
            threads.get().div_ceil(self.worker.count())
        });
        let runtime =
            Rc::new(create_async_tokio_runtime(threads).map_err(|e| Error::Other(e.into()))?);
        self.async_runtime = Some(runtime.clone());
        Ok(runtime)
    }

    fn async_apply_table(
        &mut self,
        function: AsyncApplyFn,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        table_properties: Arc<TableProperties>,
        persistent_id: Option<PersistentId>,
        trace: Trace,
    ) -> Result<TableHandle> {
        self.ensure_not_in_iteration()?;
        let udf_cache = match persistent_id {
            Some(persistent_id) => self
                .persistence
                .as_ref()
                .ok_or_else(|| Error::NoPersistentStorage(format!("{persistent_id:032x}")))?
                .udf_cache(persistent_id),
            None => None,
        };
        let dtype = table_properties
            .column(&ColumnPath::ValuePath(vec![0]))
            .map_or(Type::Any, |column| column.dtype.clone());
        let runtime = self.async_runtime()?;
        let table = self.table(table_handle)?;
        let (input, universe) = (table.node, table.universe);
        let node = self.nodes.add(AsyncApplyOperator::new(
            input,
            function,
            column_paths,
            dtype,
            trace,
            runtime,
            udf_cache,
        ));
        Ok(self.alloc_table(Some(universe), node, table_properties))
    }

    fn skip_until(&self, skip_persisted_batch: bool) -> Option<Rc<Cell<Option<u64>>>> {
        skip_persisted_batch.then(|| self.persisted_horizon.clone())
    }

    fn subscribe_table(
        &mut self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        callbacks: SubscribeCallbacks,
        skip_persisted_batch: bool,
    ) -> Result<()> {
        self.ensure_not_in_iteration()?;
        let input = self.table(table_handle)?.node;
        let skip_until = self.skip_until(skip_persisted_batch);
        self.nodes.add(SinkOperator::new(
            input,
            column_paths,
            Box::new(callbacks),
            skip_until,
        ));
        Ok(())
    }

    fn output_table(
        &mut self,
        data_sink: Box<dyn Writer>,
        data_formatter: Box<dyn Formatter>,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        skip_persisted_batch: bool,
    ) -> Result<()> {
        self.ensure_not_in_iteration()?;
        let input = self.table(table_handle)?.node;
        let skip_until = self.skip_until(skip_persisted_batch);
        self.nodes.add(SinkOperator::new(
            input,
            column_paths,
            Box::new(FormattedSink::new(data_sink, data_formatter)),
            skip_until,
        ));
        Ok(())
    }

    fn filter_table(
        &mut self,
        table_handle: TableHandle,
        filtering_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let trace = Self::column_trace(&self.table(table_handle)?.properties, &filtering_column_path);
        self.map_table(
            table_handle,
            filter_logic(filtering_column_path, trace),
            false,
            table_properties,
        )
    }

    fn add_unary(
        &mut self,
        table_handle: TableHandle,
        operator: impl FnOnce(NodeId) -> Box<dyn Operator>,
        same_universe: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let table = self.table(table_handle)?;
        let (input, universe) = (table.node, same_universe.then_some(table.universe));
        let node = self.nodes.add_boxed(operator(input));
        Ok(self.alloc_table(universe, node, table_properties))
    }

    fn forget(
        &mut self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        mark_forgetting_records: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.ensure_not_in_iteration()?;
        let columns = TimeColumns::new(threshold_time_column_path, current_time_column_path);
        self.add_unary(
            table_handle,
            |input| {
                Box::new(ForgetOperator::new(
                    input,
                    columns,
                    mark_forgetting_records,
                ))
            },
            false,
            table_properties,
        )
    }

    fn freeze(
        &mut self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.ensure_not_in_iteration()?;
        let columns = TimeColumns::new(threshold_time_column_path, current_time_column_path);
        self.add_unary(
            table_handle,
            |input| Box::new(FreezeOperator::new(input, columns)),
            false,
            table_properties,
        )
    }

    fn buffer(
        &mut self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.ensure_not_in_iteration()?;
        let columns = TimeColumns::new(threshold_time_column_path, current_time_column_path);
        self.add_unary(
            table_handle,
            |input| Box::new(BufferOperator::new(input, columns)),
            false,
            table_properties,
        )
    }

    fn gradual_broadcast(
        &mut self,
        input_table_handle: TableHandle,
        threshold_table_handle: TableHandle,
        lower_path: ColumnPath,
        value_path: ColumnPath,
        upper_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let threshold_input = self.table(threshold_table_handle)?.node;
        self.add_unary(
            input_table_handle,
            |input| {
                Box::new(GradualBroadcastOperator::new(
                    input,
                    threshold_input,
                    lower_path,
                    value_path,
                    upper_path,
                ))
            },
            true,
            table_properties,
        )
    }

    fn restrict_column(
        &mut self,
        universe_handle: UniverseHandle,
        column_handle: ColumnHandle,
    ) -> Result<ColumnHandle> {
        let universe = self.universe(universe_handle)?.node;
        let column = *self.column(column_handle)?;
        if column.universe == universe_handle {
            return Ok(column_handle);
        }
        let node = self.nodes.add(KeyCombineOperator::new(
            vec![universe, column.node],
            restrict_logic(),
        ));
        Ok(self.columns.alloc(Column {
            universe: universe_handle,
            node,
        }))
    }

    fn restrict_or_override_table_universe(
        &mut self,
        original_table_handle: TableHandle,
        new_table_handle: TableHandle,
        same_universes: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let original = self.table(original_table_handle)?;
        let universe = original.universe;
        let inputs = vec![original.node, self.table(new_table_handle)?.node];
        let node = self
            .nodes
            .add(KeyCombineOperator::new(inputs, override_logic(same_universes)));
        let universe = same_universes.then_some(universe);
        Ok(self.alloc_table(universe, node, table_properties))
    }

    fn id_column(&mut self, universe_handle: UniverseHandle) -> Result<ColumnHandle> {
        let universe = self.universe(universe_handle)?.node;
        let node = self.nodes.add(MapOperator::new(
            universe,
            Box::new(|key, _value| Ok(Some((*key, Value::Pointer(*key))))),
        ));
        Ok(self.columns.alloc(Column {
            universe: universe_handle,
            node,
        }))
    }

    fn combine_tables(
        &mut self,
        table_handles: impl IntoIterator<Item = TableHandle>,
        logic: operators::CombineLogic,
        universe: Option<UniverseHandle>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let inputs = table_handles
            .into_iter()
            .map(|handle| Ok(self.table(handle)?.node))
            .collect::<Result<Vec<_>>>()?;
        let node = self.nodes.add(KeyCombineOperator::new(inputs, logic));
        Ok(self.alloc_table(universe, node, table_properties))
    }

    fn update_cells_table(
        &mut self,
        table_handle: TableHandle,
        update_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        update_paths: Vec<ColumnPath>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        if column_paths.len() != update_paths.len() {
            return Err(Error::LengthMismatch);
        }
        let universe = self.table(table_handle)?.universe;
        self.combine_tables(
            [table_handle, update_handle],
            update_cells_logic(column_paths, update_paths),
            Some(universe),
            table_properties,
        )
    }

    fn sort_table(
        &mut self,
        table_handle: TableHandle,
        key_column_path: ColumnPath,
        instance_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.add_unary(
            table_handle,
            |input| {
                Box::new(SortOperator::new(
                    input,
                    key_column_path,
                    instance_column_path,
                ))
            },
            true,
            table_properties,
        )
    }

    fn group_by_table(
        &mut self,
        table_handle: TableHandle,
        grouping_columns_paths: Vec<ColumnPath>,
        shard_policy: ShardPolicy,
        reducers: Vec<ReducerData>,
        set_id: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let trace = table_properties
            .columns()
            .into_iter()
            .flatten()
            .map(|column| column.trace.clone())
            .find(|trace| *trace != Trace::Empty)
            .unwrap_or_default();
        self.add_unary(
            table_handle,
            |input| {
                Box::new(GroupByOperator::new(
                    input,
                    grouping_columns_paths,
                    shard_policy,
                    reducers,
                    set_id,
                    trace,
                ))
            },
            false,
            table_properties,
        )
    }

    fn ix_table(
        &mut self,
        to_ix_handle: TableHandle,
        key_handle: TableHandle,
        key_column_path: ColumnPath,
        ix_key_policy: IxKeyPolicy,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let to_ix = self.table(to_ix_handle)?.node;
        let key_table = self.table(key_handle)?;
        let key_input = key_table.node;
        let universe = match ix_key_policy {
            IxKeyPolicy::FailMissing | IxKeyPolicy::ForwardNone => Some(key_table.universe),
            IxKeyPolicy::SkipMissing => None,
        };
        let node = self.nodes.add(IxOperator::new(
            to_ix,
            key_input,
            key_column_path,
            ix_key_policy,
        ));
        Ok(self.alloc_table(universe, node, table_properties))
    }

    #[allow(clippy::too_many_arguments)]
    fn join_tables(
        &mut self,
        left_table_handle: TableHandle,
        right_table_handle: TableHandle,
        left_column_paths: Vec<ColumnPath>,
        right_column_paths: Vec<ColumnPath>,
        join_type: JoinType,
        shard_policy: ShardPolicy,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let left = self.table(left_table_handle)?;
        let universe = (join_type == JoinType::LeftKeysFull).then_some(left.universe);
        let left = left.node;
        let right = self.table(right_table_handle)?.node;
        let node = self.nodes.add(JoinOperator::new(
            left,
            right,
            left_column_paths,
            right_column_paths,
            join_type,
            shard_policy,
        )?);
        Ok(self.alloc_table(universe, node, table_properties))
    }

    fn debug(
        &mut self,
        tag: String,
        table_handle: TableHandle,
        column_path: Option<ColumnPath>,
    ) -> Result<()> {
        let input = self.table(table_handle)?.node;
        self.nodes.add(DebugOperator::new(input, tag, column_path));
        Ok(())
    }

    fn probe_table(&mut self, table_handle: TableHandle, operator_id: usize) -> Result<()> {
        let input = self.table(table_handle)?.node;
        self.nodes
            .add(ProbeOperator::new(input, operator_id, self.probes.clone()));
        Ok(())
    }

    /// Agrees on the last time restored from snapshots by any source.
    fn settle_persisted_horizon(&mut self) -> Result<()> {
        let local = self
            .sources
            .iter()
            .filter_map(|source| source.replay_horizon())
            .max();
        let horizon = self.worker.all_gather(local)?.into_iter().flatten().max();
        if let Some(horizon) = horizon {
            info!(
                "worker {} resumes after persisted time {horizon}",
                self.worker.index()
            );
        }
        self.persisted_horizon.set(horizon);
        Ok(())
    }

    fn process_time(&mut self, time: u64) -> Result<()> {
        for source in &mut self.sources {
            source.feed(time)?;
        }
        self.nodes
            .run_step(Timestamp::original(time), &self.worker)?;
        self.nodes
            .run_step(Timestamp::retraction(time), &self.worker)?;
        self.nodes.time_end(time)?;
        // nothing is committed unless every worker has finished the time
        self.worker.barrier()?;
        for source in &mut self.sources {
            source.commit(time)?;
        }
        let probes = self.probes.borrow();
        for prober in &mut self.probers {
            prober.update(Some(time), Some(time), &probes, false);
        }
        self.progress_logger
            .time_processed(self.worker.index(), time, &probes);
        Ok(())
    }

    /// Processes logical times in order until every source is exhausted.
    fn run(&mut self) -> Result<()> {
        debug!(
            "worker {} runs a dataflow of {} operators and {} sources",
            self.worker.index(),
            self.nodes.len(),
            self.sources.len()
        );
        self.settle_persisted_horizon()?;
        loop {
            for source in &mut self.sources {
                source.poll(&self.worker)?;
            }
            let local_next = self
                .sources
                .iter()
                .filter_map(|source| source.next_time())
                .min()
                .unwrap_or(u64::MAX);
            let next = self.worker.all_reduce_min(local_next)?;
            let frontier = self
                .sources
                .iter()
                .map(|source| source.frontier())
                .min()
                .unwrap_or(u64::MAX);
            let frontier = self.worker.all_reduce_min(frontier)?;
            if next < frontier {
                self.process_time(next)?;
            } else if frontier == u64::MAX {
                break;
            } else {
                for source in &mut self.sources {
                    source.wait(SOURCE_WAIT_TIMEOUT);
                }
            }
        }

        self.nodes.end()?;
        for source in &mut self.sources {
            source.finish()?;
        }
        let probes = self.probes.borrow();
        for prober in &mut self.probers {
            prober.update(None, None, &probes, true);
        }
        info!("worker {} finished", self.worker.index());
        Ok(())
    }
}

pub struct DataflowGraph(RefCell<DataflowGraphInner>);

impl DataflowGraph {
    fn new(
        worker: WorkerContext,
        monitoring_level: MonitoringLevel,
        persistence: Option<WorkerPersistentStorage>,
    ) -> Self {
        Self(RefCell::new(DataflowGraphInner::new(
            worker,
            monitoring_level,
            persistence,
        )))
    }

    fn run(&self) -> Result<()> {
        self.0.borrow_mut().run()
    }

    /// Adds an import slot of an outer table to an iteration scope.
    fn import(&self, properties: Arc<TableProperties>) -> (TableHandle, operators::Pending) {
        let mut inner = self.0.borrow_mut();
        let pending = new_pending();
        let node = inner.nodes.add(FeedOperator::new(pending.clone()));
        (inner.alloc_table(None, node, properties), pending)
    }
}

fn variable_logic(index: usize) -> Result<MapLogic> {
    let index = i64::try_from(index).map_err(|e| Error::ValueError(e.to_string()))?;
    Ok(Box::new(move |key, value| {
        let tagged = value.as_tuple()?;
        match tagged.as_ref() {
            [Value::Int(tag), value] if *tag == index => Ok(Some((*key, value.clone()))),
            _ => Ok(None),
        }
    }))
}

impl Graph for DataflowGraph {
    fn worker_index(&self) -> usize {
        self.0.borrow().worker.index()
    }

    fn worker_count(&self) -> usize {
        self.0.borrow().worker.count()
    }

    fn empty_table(&self, table_properties: Arc<TableProperties>) -> Result<TableHandle> {
        Ok(self.0.borrow_mut().empty_table(table_properties))
    }

    fn static_table(
        &self,
        data: Vec<DataRow>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().static_table(data, table_properties)
    }

    fn connector_table(
        &self,
        subject: InputSubject,
        mode: ConnectorMode,
        table_properties: Arc<TableProperties>,
        persistent_id: Option<PersistentId>,
    ) -> Result<TableHandle> {
        self.0
            .borrow_mut()
            .connector_table(subject, mode, table_properties, persistent_id)
    }

    fn expression_table(
        &self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        expressions: Vec<ExpressionData>,
    ) -> Result<TableHandle> {
        self.0
            .borrow_mut()
            .expression_table(table_handle, column_paths, expressions)
    }

    fn columns_to_table(
        &self,
        universe_handle: UniverseHandle,
        columns: Vec<ColumnHandle>,
    ) -> Result<TableHandle> {
        self.0
            .borrow_mut()
            .columns_to_table(universe_handle, columns)
    }

    fn table_column(
        &self,
        table_handle: TableHandle,
        column_path: ColumnPath,
    ) -> Result<ColumnHandle> {
        self.0.borrow_mut().table_column(table_handle, column_path)
    }

    fn table_universe(&self, table_handle: TableHandle) -> Result<UniverseHandle> {
        Ok(self.0.borrow().table(table_handle)?.universe)
    }

    fn table_properties(&self, table_handle: TableHandle) -> Result<Arc<TableProperties>> {
        Ok(self.0.borrow().table(table_handle)?.properties.clone())
    }

    fn flatten_table_storage(
        &self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
    ) -> Result<TableHandle> {
        self.0
            .borrow_mut()
            .flatten_table_storage(table_handle, column_paths)
    }

    fn async_apply_table(
        &self,
        function: AsyncApplyFn,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        table_properties: Arc<TableProperties>,
        persistent_id: Option<PersistentId>,
        trace: Trace,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().async_apply_table(
            function,
            table_handle,
            column_paths,
            table_properties,
            persistent_id,
            trace,
        )
    }

    fn subscribe_table(
        &self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        callbacks: SubscribeCallbacks,
        skip_persisted_batch: bool,
    ) -> Result<()> {
        self.0.borrow_mut().subscribe_table(
            table_handle,
            column_paths,
            callbacks,
            skip_persisted_batch,
        )
    }

    fn output_table(
        &self,
        data_sink: Box<dyn Writer>,
        data_formatter: Box<dyn Formatter>,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        skip_persisted_batch: bool,
    ) -> Result<()> {
        self.0.borrow_mut().output_table(
            data_sink,
            data_formatter,
            table_handle,
            column_paths,
            skip_persisted_batch,
        )
    }

    fn filter_table(
        &self,
        table_handle: TableHandle,
        filtering_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0
            .borrow_mut()
            .filter_table(table_handle, filtering_column_path, table_properties)
    }

    fn forget(
        &self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        mark_forgetting_records: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().forget(
            table_handle,
            threshold_time_column_path,
            current_time_column_path,
            mark_forgetting_records,
            table_properties,
        )
    }

    fn forget_immediately(
        &self,
        table_handle: TableHandle,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        let mut inner = self.0.borrow_mut();
        inner.ensure_not_in_iteration()?;
        inner.add_unary(
            table_handle,
            |input| Box::new(ForgetImmediatelyOperator::new(input)),
            false,
            table_properties,
        )
    }

    fn filter_out_results_of_forgetting(
        &self,
        table_handle: TableHandle,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().add_unary(
            table_handle,
            |input| Box::new(FilterOutForgettingOperator::new(input)),
            false,
            table_properties,
        )
    }

    fn freeze(
        &self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().freeze(
            table_handle,
            threshold_time_column_path,
            current_time_column_path,
            table_properties,
        )
    }

    fn buffer(
        &self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().buffer(
            table_handle,
            threshold_time_column_path,
            current_time_column_path,
            table_properties,
        )
    }

    fn gradual_broadcast(
        &self,
        input_table_handle: TableHandle,
        threshold_table_handle: TableHandle,
        lower_path: ColumnPath,
        value_path: ColumnPath,
        upper_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().gradual_broadcast(
            input_table_handle,
            threshold_table_handle,
            lower_path,
            value_path,
            upper_path,
            table_properties,
        )
    }

    fn restrict_column(
        &self,
        universe_handle: UniverseHandle,
        column_handle: ColumnHandle,
    ) -> Result<ColumnHandle> {
        self.0
            .borrow_mut()
            .restrict_column(universe_handle, column_handle)
    }

    fn restrict_or_override_table_universe(
        &self,
        original_table_handle: TableHandle,
        new_table_handle: TableHandle,
        same_universes: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().restrict_or_override_table_universe(
            original_table_handle,
            new_table_handle,
            same_universes,
            table_properties,
        )
    }

    fn id_column(&self, universe_handle: UniverseHandle) -> Result<ColumnHandle> {
        self.0.borrow_mut().id_column(universe_handle)
    }

    fn intersect_tables(
        &self,
        table_handle: TableHandle,
        other_table_handles: Vec<TableHandle>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        if other_table_handles.is_empty() {
            return Err(Error::EmptyIntersection);
        }
        self.0.borrow_mut().combine_tables(
            std::iter::once(table_handle).chain(other_table_handles),
            intersect_logic(),
            None,
            table_properties,
        )
    }

    fn subtract_table(
        &self,
        left_table_handle: TableHandle,
        right_table_handle: TableHandle,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().combine_tables(
            [left_table_handle, right_table_handle],
            subtract_logic(),
            None,
            table_properties,
        )
    }

    fn concat_tables(
        &self,
        table_handles: Vec<TableHandle>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0
            .borrow_mut()
            .combine_tables(table_handles, concat_logic(), None, table_properties)
    }

    fn flatten_table(
        &self,
        table_handle: TableHandle,
        flatten_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().add_unary(
            table_handle,
            |input| Box::new(FlattenOperator::new(input, flatten_column_path)),
            false,
            table_properties,
        )
    }

    fn sort_table(
        &self,
        table_handle: TableHandle,
        key_column_path: ColumnPath,
        instance_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().sort_table(
            table_handle,
            key_column_path,
            instance_column_path,
            table_properties,
        )
    }

    fn reindex_table(
        &self,
        table_handle: TableHandle,
        reindexing_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().map_table(
            table_handle,
            reindex_logic(reindexing_column_path),
            false,
            table_properties,
        )
    }

    fn update_rows_table(
        &self,
        table_handle: TableHandle,
        update_handle: TableHandle,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().combine_tables(
            [table_handle, update_handle],
            update_rows_logic(),
            None,
            table_properties,
        )
    }

    fn update_cells_table(
        &self,
        table_handle: TableHandle,
        update_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        update_paths: Vec<ColumnPath>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().update_cells_table(
            table_handle,
            update_handle,
            column_paths,
            update_paths,
            table_properties,
        )
    }

    fn group_by_table(
        &self,
        table_handle: TableHandle,
        grouping_columns_paths: Vec<ColumnPath>,
        shard_policy: ShardPolicy,
        reducers: Vec<ReducerData>,
        set_id: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().group_by_table(
            table_handle,
            grouping_columns_paths,
            shard_policy,
            reducers,
            set_id,
            table_properties,
        )
    }

    fn ix_table(
        &self,
        to_ix_handle: TableHandle,
        key_handle: TableHandle,
        key_column_path: ColumnPath,
        ix_key_policy: IxKeyPolicy,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().ix_table(
            to_ix_handle,
            key_handle,
            key_column_path,
            ix_key_policy,
            table_properties,
        )
    }

    fn join_tables(
        &self,
        left_table_handle: TableHandle,
        right_table_handle: TableHandle,
        left_column_paths: Vec<ColumnPath>,
        right_column_paths: Vec<ColumnPath>,
        join_type: JoinType,
        shard_policy: ShardPolicy,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle> {
        self.0.borrow_mut().join_tables(
            left_table_handle,
            right_table_handle,
            left_column_paths,
            right_column_paths,
            join_type,
            shard_policy,
            table_properties,
        )
    }

    fn iterate<'a>(
        &'a self,
        iterated: Vec<TableHandle>,
        iterated_with_universe: Vec<TableHandle>,
        extra: Vec<TableHandle>,
        limit: Option<u32>,
        logic: IterationLogic<'a>,
    ) -> Result<(Vec<TableHandle>, Vec<TableHandle>)> {
        let (worker, outer_tables) = {
            let outer = self.0.borrow();
            outer.ensure_not_in_iteration()?;
            let tables = iterated
                .iter()
                .chain(&iterated_with_universe)
                .chain(&extra)
                .map(|handle| outer.table(*handle).cloned())
                .collect::<Result<Vec<_>>>()?;
            (outer.worker.clone(), tables)
        };
        if limit.is_some_and(|limit| limit <= 1) {
            return Err(Error::IterationLimitTooSmall);
        }

        let scope = Self(RefCell::new(DataflowGraphInner::new_iteration_scope(worker)));
        let mut imports = Vec::with_capacity(outer_tables.len());
        let mut inner_handles = Vec::with_capacity(outer_tables.len());
        for table in &outer_tables {
            let (handle, pending) = scope.import(table.properties.clone());
            inner_handles.push(handle);
            imports.push(pending);
        }
        let extra_handles = inner_handles.split_off(iterated.len() + iterated_with_universe.len());
        let with_universe_handles = inner_handles.split_off(iterated.len());

        let (results, results_with_universe) = logic(
            &scope,
            inner_handles,
            with_universe_handles,
            extra_handles,
        )
        .map_err(Error::from)?;
        if results.len() != iterated.len() || results_with_universe.len() != iterated_with_universe.len() {
            return Err(Error::LengthMismatch);
        }

        let scope = scope.0.into_inner();
        let result_tables = results
            .iter()
            .chain(&results_with_universe)
            .map(|handle| scope.table(*handle).cloned())
            .collect::<Result<Vec<_>>>()?;
        let layout = IterationLayout {
            inputs: outer_tables.iter().map(|table| table.node).collect(),
            imports,
            results: result_tables.iter().map(|table| table.node).collect(),
            fixed_universe: iterated.len(),
        };
        debug!(
            "iteration over {} variables with {} inner operators",
            layout.results.len(),
            scope.nodes.len()
        );

        let mut outer = self.0.borrow_mut();
        let status = outer.iteration_status.clone();
        let node = outer
            .nodes
            .add(IterateOperator::new(layout, scope.nodes, limit, status));
        let mut outputs = Vec::with_capacity(result_tables.len());
        for (index, (result, input)) in result_tables.iter().zip(&outer_tables).enumerate() {
            let universe = (index < iterated.len()).then_some(input.universe);
            let variable = outer
                .nodes
                .add(MapOperator::new(node, variable_logic(index)?));
            outputs.push(outer.alloc_table(universe, variable, result.properties.clone()));
        }
        let outputs_with_universe = outputs.split_off(iterated.len());
        Ok((outputs, outputs_with_universe))
    }

    fn iteration_status(&self) -> Option<IterationStatus> {
        self.0.borrow().iteration_status.get()
    }

    fn iteration_status_handle(&self) -> IterationStatusHandle {
        IterationStatusHandle::new(self.0.borrow().iteration_status.clone())
    }

    fn debug_universe(&self, tag: String, table_handle: TableHandle) -> Result<()> {
        self.0.borrow_mut().debug(tag, table_handle, None)
    }

    fn debug_column(
        &self,
        tag: String,
        table_handle: TableHandle,
        column_path: ColumnPath,
    ) -> Result<()> {
        self.0
            .borrow_mut()
            .debug(tag, table_handle, Some(column_path))
    }

    fn attach_prober(
        &self,
        logic: Box<dyn FnMut(ProberStats)>,
        intermediate_probes_required: bool,
        run_callback_every_time: bool,
    ) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        inner.ensure_not_in_iteration()?;
        inner.probers.push(Prober::new(
            logic,
            intermediate_probes_required,
            run_callback_every_time,
        ));
        Ok(())
    }

    fn probe_table(&self, table_handle: TableHandle, operator_id: usize) -> Result<()> {
        self.0.borrow_mut().probe_table(table_handle, operator_id)
    }
}

fn run_worker<R, R2>(
    worker: WorkerContext,
    logic: &(impl Fn(&dyn Graph) -> DynResult<R> + Sync),
    finish: &(impl Fn(R) -> R2 + Sync),
    monitoring_level: MonitoringLevel,
    persistence: Option<WorkerPersistentStorage>,
) -> Result<R2> {
    let graph = DataflowGraph::new(worker, monitoring_level, persistence);
    let res = logic(&graph).map_err(Error::from)?;
    graph.run()?;
    Ok(finish(res))
}

/// Builds the dataflow with `logic` on every timely worker, runs it until
/// all inputs are exhausted and returns the results of `finish`, ordered by
/// worker. The first failing worker aborts the others.
pub fn run_with_new_dataflow_graph<R, R2>(
    logic: impl Fn(&dyn Graph) -> DynResult<R> + Send + Sync + 'static,
    finish: impl Fn(R) -> R2 + Send + Sync + 'static,
    config: Config,
    monitoring_level: MonitoringLevel,
    persistence_config: Option<PersistenceConfig>,
) -> Result<Vec<R2>>
where
    R: 'static,
    R2: Send + 'static,
{
    info!("Preparing computation on {} workers", config.workers());
    let backend: Option<SharedBackend> = persistence_config
        .as_ref()
        .map(PersistenceConfig::create_backend)
        .transpose()
        .map_err(PersistenceError::from)?;

    let guards = execute(config.to_timely_config(), move |worker| {
        let index = worker.index();
        let context = WorkerContext::new(worker);
        let persistence = persistence_config
            .as_ref()
            .zip(backend.as_ref())
            .map(|(config, backend)| {
                WorkerPersistentStorage::new(config.clone(), backend.clone(), index)
            });
        let result = catch_unwind(AssertUnwindSafe(|| {
            run_worker(context.clone(), &logic, &finish, monitoring_level, persistence)
        }))
        .unwrap_or_else(|panic_payload| Err(Error::from_panic_payload(panic_payload)));
        if let Err(error) = &result {
            if !matches!(error, Error::Aborted) {
                warn!("worker {index} failed: {error}");
            }
            context.abort();
        }
        result
    })
    .map_err(Error::Dataflow)?;

    let mut results = Vec::new();
    let mut first_error: Option<Error> = None;
    for (index, result) in guards.join().into_iter().enumerate() {
        match result.map_err(Error::WorkerPanic).and_then(|result| result) {
            Ok(value) => results.push(value),
            Err(error) => {
                let replace = match &first_error {
                    None => true,
                    Some(Error::Aborted) => !matches!(error, Error::Aborted),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(error);
                } else {
                    debug!("worker {index} also failed: {error}");
                }
            }
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(results),
    }
}

/// Convenience wrapper for a single-threaded run without persistence.
pub fn run_single_worker<R>(
    logic: impl Fn(&dyn Graph) -> DynResult<R> + Send + Sync + 'static,
) -> Result<R>
where
    R: Send + 'static,
{
    let mut results = run_with_new_dataflow_graph(
        logic,
        |res| res,
        Config::default(),
        MonitoringLevel::None,
        None,
    )?;
    results.pop().ok_or(Error::Aborted)
}
