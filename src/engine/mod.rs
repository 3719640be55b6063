// Copyright © 2024 Pathway

// too sensitive for `Box<dyn FnMut(...)>`
#![allow(clippy::type_complexity)]

pub mod error;
pub use self::error::{DataError, DynError, DynResult, Error, Result, Trace};

pub mod value;
pub use self::value::{Key, KeyImpl, ShardPolicy, Type, Value};

pub mod reduce;
pub use reduce::Reducer;

pub mod timestamp;
pub use timestamp::Timestamp;

pub mod graph;
pub use graph::{
    AsyncApplyFn, ColumnHandle, ColumnPath, ColumnProperties, ExpressionData, Graph,
    IterationLogic, IterationStatus, IterationStatusHandle, IxKeyPolicy, JoinType, OperatorStats,
    ProberStats, ReducerData, SubscribeCallbacks, SubscribeCallbacksBuilder, TableHandle,
    TableProperties, UniverseHandle,
};

pub mod dataflow;
pub use dataflow::config::Config;
pub use dataflow::{run_single_worker, run_with_new_dataflow_graph, MonitoringLevel};

pub mod expression;
pub use expression::{
    AnyExpression, BoolExpression, DateTimeNaiveExpression, DateTimeUtcExpression,
    DurationExpression, Expression, Expressions, FloatExpression, IntExpression, PointerExpression,
    StringExpression,
};

pub mod time;
pub use time::{DateTimeNaive, DateTimeUtc, Duration};
