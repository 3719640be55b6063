// Copyright © 2024 Pathway

use std::collections::{BTreeSet, HashMap};

use differential_dataflow::consolidation::consolidate_updates;
use log::trace;

use super::{Batch, NodeId, Operator, StepContext};
use crate::engine::error::Trace;
use crate::engine::graph::{ColumnPath, ReducerData};
use crate::engine::reduce::Accumulator;
use crate::engine::value::ShardPolicy;
use crate::engine::{Error, Key, Result, Value};

struct GroupState {
    count: isize,
    accumulators: Vec<Box<dyn Accumulator>>,
    emitted: Option<Value>,
}

impl GroupState {
    fn new(reducers: &[ReducerData]) -> Self {
        Self {
            count: 0,
            accumulators: reducers
                .iter()
                .map(|reducer_data| reducer_data.reducer.accumulator())
                .collect(),
            emitted: None,
        }
    }
}

/// Groups rows by the values of the grouping columns and keeps one reduced
/// row per non-empty group.
pub struct GroupByOperator {
    input: NodeId,
    grouping_columns_paths: Vec<ColumnPath>,
    shard_policy: ShardPolicy,
    reducers: Vec<ReducerData>,
    set_id: bool,
    trace: Trace,
    groups: HashMap<Key, GroupState>,
}

impl GroupByOperator {
    pub fn new(
        input: NodeId,
        grouping_columns_paths: Vec<ColumnPath>,
        shard_policy: ShardPolicy,
        reducers: Vec<ReducerData>,
        set_id: bool,
        trace: Trace,
    ) -> Self {
        Self {
            input,
            grouping_columns_paths,
            shard_policy,
            reducers,
            set_id,
            trace,
            groups: HashMap::new(),
        }
    }

    fn group_key(&self, id: &Key, values: &Value) -> Result<Key> {
        let grouping_values = ColumnPath::extract_all(&self.grouping_columns_paths, id, values)?;
        if self.set_id {
            match grouping_values.as_slice() {
                [Value::Pointer(key)] => Ok(*key),
                [other] => Ok(other.as_pointer()?),
                _ => Err(Error::ValueError(
                    "setting the id of a grouped table requires exactly one pointer column".into(),
                )),
            }
        } else {
            Ok(self.shard_policy.generate_key(&grouping_values))
        }
    }
}

impl Operator for GroupByOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let mut keyed = Vec::new();
        for (id, values, diff) in ctx.input(self.input) {
            keyed.push((self.group_key(id, values)?, *id, values.clone(), *diff));
        }
        let mut parts: Vec<Batch> = (0..ctx.worker.count()).map(|_| Vec::new()).collect();
        for (group_key, id, values, diff) in keyed {
            let carrier = Value::Tuple([Value::Pointer(group_key), values].into_iter().collect());
            parts[ctx.worker.worker_for(&group_key)].push((id, carrier, diff));
        }
        let batch = ctx.worker.exchange_partitioned(parts)?;

        let mut touched = BTreeSet::new();
        for (id, carrier, diff) in batch {
            let carrier = carrier.as_tuple()?;
            let (Some(group_key), Some(values)) = (carrier.first(), carrier.get(1)) else {
                continue;
            };
            let group_key = group_key.as_pointer()?;
            touched.insert(group_key);
            let reducers = &self.reducers;
            let group = self
                .groups
                .entry(group_key)
                .or_insert_with(|| GroupState::new(reducers));
            group.count += diff;
            for (accumulator, reducer_data) in group.accumulators.iter_mut().zip(&self.reducers) {
                let args = ColumnPath::extract_all(&reducer_data.column_paths, &id, values)?;
                accumulator
                    .update(&id, &args, diff)
                    .map_err(|error| Error::with_trace(error, self.trace.clone()))?;
            }
        }

        let mut output = Vec::new();
        for group_key in touched {
            let Some(group) = self.groups.get_mut(&group_key) else {
                continue;
            };
            if group.count < 0 {
                return Err(Error::NegativeMultiplicity(group_key));
            }
            let new = if group.count == 0 {
                None
            } else {
                let results = group
                    .accumulators
                    .iter_mut()
                    .map(|accumulator| accumulator.finish())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|error| Error::with_trace(error, self.trace.clone()))?;
                Some(Value::from(results))
            };
            if new != group.emitted {
                trace!("group {group_key} changed to {new:?}");
                if let Some(old) = group.emitted.take() {
                    output.push((group_key, old, -1));
                }
                if let Some(new) = &new {
                    output.push((group_key, new.clone(), 1));
                }
                group.emitted = new;
            }
            if group.count == 0 {
                self.groups.remove(&group_key);
            }
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}
