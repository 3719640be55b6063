// Copyright © 2024 Pathway

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use futures::future::BoxFuture;
use id_arena::ArenaBehavior;

use crate::connectors::data_format::Formatter;
use crate::connectors::data_storage::Writer;
use crate::connectors::{ConnectorMode, DataRow, InputSubject};
use crate::persistence::PersistentId;

use super::error::{DynResult, Trace};
use super::value::ShardPolicy;
use super::{Error, Expression, Key, Reducer, Result, Type, Value};

macro_rules! define_handle {
    ($handle:ident) => {
        #[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
        pub struct $handle {
            arena_id: u32,
            index: u32,
        }

        impl ArenaBehavior for $handle {
            type Id = Self;

            #[allow(clippy::cast_possible_truncation)]
            fn new_id(arena_id: u32, index: usize) -> Self {
                Self {
                    arena_id,
                    index: index as u32,
                }
            }

            fn arena_id(handle: Self) -> u32 {
                handle.arena_id
            }

            fn index(handle: Self) -> usize {
                handle.index as usize
            }
        }
    };
}

define_handle!(UniverseHandle);

define_handle!(ColumnHandle);

define_handle!(TableHandle);

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone)]
pub enum ColumnPath {
    Key,
    ValuePath(Vec<usize>),
}

impl ColumnPath {
    pub fn extract(&self, key: &Key, value: &Value) -> Result<Value> {
        match self {
            Self::Key => Ok(Value::from(*key)),
            Self::ValuePath(path) => {
                let mut value = value;
                for i in path {
                    if *value == Value::None {
                        break; // unmatched side of an outer join
                    }
                    value = value
                        .as_tuple()?
                        .get(*i)
                        .ok_or(Error::InvalidColumnPath)?;
                }
                Ok(value.clone())
            }
        }
    }

    pub fn extract_all(paths: &[Self], key: &Key, value: &Value) -> Result<Vec<Value>> {
        paths.iter().map(|path| path.extract(key, value)).collect()
    }
}

pub struct ExpressionData {
    pub expression: Arc<Expression>,
    pub column_properties: Arc<ColumnProperties>,
}

impl ExpressionData {
    pub fn new(expression: Arc<Expression>, column_properties: Arc<ColumnProperties>) -> Self {
        ExpressionData {
            expression,
            column_properties,
        }
    }
}

pub struct ReducerData {
    pub reducer: Reducer,
    pub column_paths: Vec<ColumnPath>,
}

impl ReducerData {
    pub fn new(reducer: Reducer, column_paths: Vec<ColumnPath>) -> Self {
        ReducerData {
            reducer,
            column_paths,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColumnProperties {
    pub dtype: Type,
    pub append_only: bool,
    pub trace: Trace,
}

impl ColumnProperties {
    pub fn new() -> Self {
        Self {
            dtype: Type::Any,
            append_only: false,
            trace: Trace::Empty,
        }
    }

    pub fn with_dtype(dtype: Type) -> Self {
        Self {
            dtype,
            ..Self::new()
        }
    }
}

impl Default for ColumnProperties {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub enum TableProperties {
    Table(Arc<[TableProperties]>),
    Column(Arc<ColumnProperties>),
    Empty,
}

impl TableProperties {
    pub fn flat(column_properties: Vec<Arc<ColumnProperties>>) -> Self {
        let column_properties: Vec<_> = column_properties
            .into_iter()
            .map(TableProperties::Column)
            .collect();

        TableProperties::Table(column_properties.into())
    }

    /// Properties of a table whose columns are all of the given types.
    pub fn of_types(types: impl IntoIterator<Item = Type>) -> Self {
        Self::flat(
            types
                .into_iter()
                .map(|dtype| Arc::new(ColumnProperties::with_dtype(dtype)))
                .collect(),
        )
    }

    /// Declared properties of the column at `path`, if the path goes through
    /// described columns only.
    pub fn column(&self, path: &ColumnPath) -> Option<&Arc<ColumnProperties>> {
        let ColumnPath::ValuePath(path) = path else {
            return None;
        };
        let mut current = self;
        for i in path {
            match current {
                Self::Table(inner) => current = inner.get(*i)?,
                _ => return None,
            }
        }
        match current {
            Self::Column(properties) => Some(properties),
            _ => None,
        }
    }

    /// Properties of the columns of a flat table, `None` where undescribed.
    pub fn columns(&self) -> Vec<Option<Arc<ColumnProperties>>> {
        match self {
            Self::Table(inner) => inner
                .iter()
                .map(|item| match item {
                    Self::Column(properties) => Some(properties.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn append_only(&self) -> bool {
        match self {
            Self::Table(inner) => !inner.is_empty() && inner.iter().all(Self::append_only),
            Self::Column(properties) => properties.append_only,
            Self::Empty => false,
        }
    }
}

pub type IterationLogic<'a> = Box<
    dyn FnOnce(
            &dyn Graph,
            Vec<TableHandle>,
            Vec<TableHandle>,
            Vec<TableHandle>,
        ) -> DynResult<(Vec<TableHandle>, Vec<TableHandle>)>
        + 'a,
>;

/// Outcome of the most recent fixed-point computation of an `iterate` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationStatus {
    Converged { iterations: u32 },
    LimitReached { iterations: u32 },
}

/// Shared view of the iteration status of one worker, readable after the
/// dataflow has finished.
#[derive(Clone, Debug, Default)]
pub struct IterationStatusHandle(Rc<Cell<Option<IterationStatus>>>);

impl IterationStatusHandle {
    pub(crate) fn new(cell: Rc<Cell<Option<IterationStatus>>>) -> Self {
        Self(cell)
    }

    pub fn get(&self) -> Option<IterationStatus> {
        self.0.get()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftKeysSubset,
    LeftKeysFull,
}

impl JoinType {
    /// Join type of `assign_id`, left-outer and right-outer flags.
    pub fn from_assign_left_right(assign_id: bool, left: bool, right: bool) -> Result<Self> {
        match (assign_id, left, right) {
            (false, false, false) => Ok(Self::Inner),
            (false, true, false) => Ok(Self::LeftOuter),
            (false, false, true) => Ok(Self::RightOuter),
            (false, true, true) => Ok(Self::FullOuter),
            (true, false, false) => Ok(Self::LeftKeysSubset),
            (true, true, false) => Ok(Self::LeftKeysFull),
            (true, _, true) => Err(Error::BadJoinType),
        }
    }

    pub fn keeps_left(self) -> bool {
        matches!(self, Self::LeftOuter | Self::FullOuter | Self::LeftKeysFull)
    }

    pub fn keeps_right(self) -> bool {
        matches!(self, Self::RightOuter | Self::FullOuter)
    }

    pub fn assigns_left_key(self) -> bool {
        matches!(self, Self::LeftKeysSubset | Self::LeftKeysFull)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IxKeyPolicy {
    FailMissing,
    SkipMissing,
    ForwardNone,
}

impl IxKeyPolicy {
    pub fn from_strict_optional(strict: bool, optional: bool) -> Result<Self> {
        match (strict, optional) {
            (true, false) => Ok(Self::FailMissing),
            (true, true) => Ok(Self::ForwardNone),
            (false, false) => Ok(Self::SkipMissing),
            (false, true) => Err(Error::BadIxKeyPolicy),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorStats {
    pub time: Option<u64>,
    pub lag: Option<u64>,
    pub done: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProberStats {
    pub input_stats: OperatorStats,
    pub output_stats: OperatorStats,
    pub operators_stats: HashMap<usize, OperatorStats>,
    pub row_counts: HashMap<usize, isize>,
}

pub type OnDataFn = Box<dyn FnMut(Key, &[Value], u64, isize) -> DynResult<()>>;
pub type OnTimeEndFn = Box<dyn FnMut(u64) -> DynResult<()>>;
pub type OnEndFn = Box<dyn FnMut() -> DynResult<()>>;

#[derive(Default)]
pub struct SubscribeCallbacks {
    pub on_data: Option<OnDataFn>,
    pub on_time_end: Option<OnTimeEndFn>,
    pub on_end: Option<OnEndFn>,
}

impl fmt::Debug for SubscribeCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeCallbacks")
            .field("on_data", &self.on_data.is_some())
            .field("on_time_end", &self.on_time_end.is_some())
            .field("on_end", &self.on_end.is_some())
            .finish()
    }
}

pub struct SubscribeCallbacksBuilder {
    inner: SubscribeCallbacks,
}

impl SubscribeCallbacksBuilder {
    pub fn new() -> Self {
        Self {
            inner: SubscribeCallbacks::default(),
        }
    }

    pub fn build(self) -> SubscribeCallbacks {
        self.inner
    }

    #[must_use]
    pub fn on_data(mut self, on_data: OnDataFn) -> Self {
        self.inner.on_data = Some(on_data);
        self
    }

    #[must_use]
    pub fn on_time_end(mut self, on_time_end: OnTimeEndFn) -> Self {
        self.inner.on_time_end = Some(on_time_end);
        self
    }

    #[must_use]
    pub fn on_end(mut self, on_end: OnEndFn) -> Self {
        self.inner.on_end = Some(on_end);
        self
    }
}

impl Default for SubscribeCallbacksBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub type AsyncApplyFn =
    Arc<dyn Fn(Key, &[Value]) -> BoxFuture<'static, DynResult<Value>> + Send + Sync>;

pub trait Graph {
    fn worker_index(&self) -> usize;

    fn worker_count(&self) -> usize;

    fn empty_table(&self, table_properties: Arc<TableProperties>) -> Result<TableHandle>;

    fn static_table(
        &self,
        data: Vec<DataRow>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn connector_table(
        &self,
        subject: InputSubject,
        mode: ConnectorMode,
        table_properties: Arc<TableProperties>,
        persistent_id: Option<PersistentId>,
    ) -> Result<TableHandle>;

    fn expression_table(
        &self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        expressions: Vec<ExpressionData>,
    ) -> Result<TableHandle>;

    fn columns_to_table(
        &self,
        universe_handle: UniverseHandle,
        columns: Vec<ColumnHandle>,
    ) -> Result<TableHandle>;

    fn table_column(
        &self,
        table_handle: TableHandle,
        column_path: ColumnPath,
    ) -> Result<ColumnHandle>;

    fn table_universe(&self, table_handle: TableHandle) -> Result<UniverseHandle>;

    fn table_properties(&self, table_handle: TableHandle) -> Result<Arc<TableProperties>>;

    fn flatten_table_storage(
        &self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
    ) -> Result<TableHandle>;

    fn async_apply_table(
        &self,
        function: AsyncApplyFn,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        table_properties: Arc<TableProperties>,
        persistent_id: Option<PersistentId>,
        trace: Trace,
    ) -> Result<TableHandle>;

    fn subscribe_table(
        &self,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        callbacks: SubscribeCallbacks,
        skip_persisted_batch: bool,
    ) -> Result<()>;

    fn output_table(
        &self,
        data_sink: Box<dyn Writer>,
        data_formatter: Box<dyn Formatter>,
        table_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        skip_persisted_batch: bool,
    ) -> Result<()>;

    fn filter_table(
        &self,
        table_handle: TableHandle,
        filtering_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn forget(
        &self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        mark_forgetting_records: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn forget_immediately(
        &self,
        table_handle: TableHandle,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn filter_out_results_of_forgetting(
        &self,
        table_handle: TableHandle,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn freeze(
        &self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn buffer(
        &self,
        table_handle: TableHandle,
        threshold_time_column_path: ColumnPath,
        current_time_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn gradual_broadcast(
        &self,
        input_table_handle: TableHandle,
        threshold_table_handle: TableHandle,
        lower_path: ColumnPath,
        value_path: ColumnPath,
        upper_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn restrict_column(
        &self,
        universe_handle: UniverseHandle,
        column_handle: ColumnHandle,
    ) -> Result<ColumnHandle>;

    fn restrict_or_override_table_universe(
        &self,
        original_table_handle: TableHandle,
        new_table_handle: TableHandle,
        same_universes: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn id_column(&self, universe_handle: UniverseHandle) -> Result<ColumnHandle>;

    fn intersect_tables(
        &self,
        table_handle: TableHandle,
        other_table_handles: Vec<TableHandle>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn subtract_table(
        &self,
        left_table_handle: TableHandle,
        right_table_handle: TableHandle,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn concat_tables(
        &self,
        table_handles: Vec<TableHandle>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn flatten_table(
        &self,
        table_handle: TableHandle,
        flatten_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn sort_table(
        &self,
        table_handle: TableHandle,
        key_column_path: ColumnPath,
        instance_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn reindex_table(
        &self,
        table_handle: TableHandle,
        reindexing_column_path: ColumnPath,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn update_rows_table(
        &self,
        table_handle: TableHandle,
        update_handle: TableHandle,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn update_cells_table(
        &self,
        table_handle: TableHandle,
        update_handle: TableHandle,
        column_paths: Vec<ColumnPath>,
        update_paths: Vec<ColumnPath>,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn group_by_table(
        &self,
        table_handle: TableHandle,
        grouping_columns_paths: Vec<ColumnPath>,
        shard_policy: ShardPolicy,
        reducers: Vec<ReducerData>,
        set_id: bool,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn ix_table(
        &self,
        to_ix_handle: TableHandle,
        key_handle: TableHandle,
        key_column_path: ColumnPath,
        ix_key_policy: IxKeyPolicy,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    #[allow(clippy::too_many_arguments)]
    fn join_tables(
        &self,
        left_table_handle: TableHandle,
        right_table_handle: TableHandle,
        left_column_paths: Vec<ColumnPath>,
        right_column_paths: Vec<ColumnPath>,
        join_type: JoinType,
        shard_policy: ShardPolicy,
        table_properties: Arc<TableProperties>,
    ) -> Result<TableHandle>;

    fn iterate<'a>(
        &'a self,
        iterated: Vec<TableHandle>,
        iterated_with_universe: Vec<TableHandle>,
        extra: Vec<TableHandle>,
        limit: Option<u32>,
        logic: IterationLogic<'a>,
    ) -> Result<(Vec<TableHandle>, Vec<TableHandle>)>;

    /// Status of the latest fixed-point computation of the most recently
    /// built `iterate`, `None` before its first computation.
    fn iteration_status(&self) -> Option<IterationStatus>;

    fn iteration_status_handle(&self) -> IterationStatusHandle;

    fn debug_universe(&self, tag: String, table_handle: TableHandle) -> Result<()>;

    fn debug_column(
        &self,
        tag: String,
        table_handle: TableHandle,
        column_path: ColumnPath,
    ) -> Result<()>;

    fn attach_prober(
        &self,
        logic: Box<dyn FnMut(ProberStats)>,
        intermediate_probes_required: bool,
        run_callback_every_time: bool,
    ) -> Result<()>;

    fn probe_table(&self, table_handle: TableHandle, operator_id: usize) -> Result<()>;
}
