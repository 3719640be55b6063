// Copyright © 2024 Pathway

use std::collections::HashMap;
use std::rc::Rc;

use differential_dataflow::consolidation::consolidate_updates;
use futures::future::join_all;
use log::{debug, warn};
use tokio::runtime::Runtime as TokioRuntime;

use super::operators::{Batch, NodeId, Operator, StepContext};
use crate::engine::error::{DynResult, Trace};
use crate::engine::graph::{AsyncApplyFn, ColumnPath};
use crate::engine::value::Type;
use crate::engine::{Error, Key, Result, Value};
use crate::persistence::udf_cache::UdfCache;

/// Applies an asynchronous function to every inserted row.
///
/// The futures of one sub-step are spawned on a tokio runtime and the step
/// waits until all of them resolve, so a batch never completes with
/// results missing. Results are remembered per key: a deletion emits the
/// value computed for the insertion instead of calling the function again,
/// which keeps non-deterministic functions consistent.
pub struct AsyncApplyOperator {
    input: NodeId,
    function: AsyncApplyFn,
    column_paths: Vec<ColumnPath>,
    dtype: Type,
    trace: Trace,
    runtime: Rc<TokioRuntime>,
    udf_cache: Option<UdfCache>,
    emitted: HashMap<Key, Value>,
}

struct Task {
    key: Key,
    args: Vec<Value>,
    diff: isize,
}

impl AsyncApplyOperator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: NodeId,
        function: AsyncApplyFn,
        column_paths: Vec<ColumnPath>,
        dtype: Type,
        trace: Trace,
        runtime: Rc<TokioRuntime>,
        udf_cache: Option<UdfCache>,
    ) -> Self {
        Self {
            input,
            function,
            column_paths,
            dtype,
            trace,
            runtime,
            udf_cache,
            emitted: HashMap::new(),
        }
    }

    fn handle_result(&self, key: Key, result: DynResult<Value>) -> Result<Value> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => match self.dtype {
                Type::Optional(_) => {
                    warn!("error in async function for row {key}, replacing with None: {error}");
                    Ok(Value::None)
                }
                Type::Any => {
                    warn!("error in async function for row {key}: {error}");
                    Ok(Value::Error)
                }
                _ => Err(Error::with_trace(error, self.trace.clone())),
            },
        }
    }

    /// Runs the function for all tasks, taking results from the cache when
    /// possible.
    fn compute(&self, tasks: &[Task]) -> Result<Vec<Value>> {
        let mut results: Vec<Option<Value>> = tasks
            .iter()
            .map(|task| {
                self.udf_cache
                    .as_ref()
                    .and_then(|cache| cache.get(&task.args))
            })
            .collect();
        let missing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter_map(|(i, result)| result.is_none().then_some(i))
            .collect();
        if missing.len() < tasks.len() {
            debug!("{} async results taken from cache", tasks.len() - missing.len());
        }

        let handles: Vec<_> = missing
            .iter()
            .map(|i| {
                let task = &tasks[*i];
                self.runtime
                    .spawn((self.function)(task.key, &task.args))
            })
            .collect();
        let computed = self.runtime.block_on(join_all(handles));

        for (i, joined) in missing.into_iter().zip(computed) {
            let task = &tasks[i];
            let result = joined.map_err(|e| Error::Other(e.into()))?;
            let value = self.handle_result(task.key, result)?;
            if let Some(cache) = self.udf_cache.as_ref() {
                if value != Value::Error {
                    cache.put(&task.args, &value)?;
                }
            }
            results[i] = Some(value);
        }
        Ok(results
            .into_iter()
            .map(|result| result.unwrap_or(Value::None))
            .collect())
    }
}

impl Operator for AsyncApplyOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let mut batch = ctx.worker.exchange_by_key(ctx.input_owned(self.input))?;
        consolidate_updates(&mut batch);

        let mut output = Vec::new();
        let mut tasks = Vec::new();
        for (key, value, diff) in batch {
            if diff < 0 {
                let previous = self
                    .emitted
                    .remove(&key)
                    .ok_or(Error::NegativeMultiplicity(key))?;
                output.push((key, previous, diff));
            } else {
                let args = ColumnPath::extract_all(&self.column_paths, &key, &value)?;
                tasks.push(Task { key, args, diff });
            }
        }

        let results = self.compute(&tasks)?;
        for (task, result) in tasks.into_iter().zip(results) {
            let row = Value::from(vec![result]);
            if self.emitted.insert(task.key, row.clone()).is_some() {
                return Err(Error::DuplicateKey(task.key));
            }
            output.push((task.key, row, task.diff));
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}
