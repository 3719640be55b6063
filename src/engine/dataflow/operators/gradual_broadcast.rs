// Copyright © 2024 Pathway

use differential_dataflow::consolidation::consolidate_updates;
use log::debug;
use ordered_float::OrderedFloat;

use super::{Batch, NodeId, Operator, StepContext, TableState};
use crate::engine::graph::ColumnPath;
use crate::engine::value::KeyImpl;
use crate::engine::{Key, Result, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ApxToBroadcast {
    lower: OrderedFloat<f64>,
    value: OrderedFloat<f64>,
    upper: OrderedFloat<f64>,
}

impl ApxToBroadcast {
    /// Keys below the returned one get the upper bound, the rest get the
    /// lower bound. The share of keys getting the upper bound grows as the
    /// value moves from lower to upper.
    fn threshold(&self) -> Key {
        let factor = (self.value - self.lower) / (self.upper - self.lower);
        //scaling does not need to be precise
        #[allow(
            clippy::cast_sign_loss,
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss
        )]
        Key((factor.0 * KeyImpl::MAX as f64) as KeyImpl)
    }

    fn bound_for(&self, key: &Key) -> OrderedFloat<f64> {
        if *key < self.threshold() {
            self.upper
        } else {
            self.lower
        }
    }
}

/// Attaches to every row either the lower or the upper bound of a
/// broadcast threshold, so that downstream consumers switch gradually
/// instead of all at once.
pub struct GradualBroadcastOperator {
    input: NodeId,
    threshold_input: NodeId,
    lower_path: ColumnPath,
    value_path: ColumnPath,
    upper_path: ColumnPath,
    rows: TableState,
    thresholds: TableState,
    current: Option<ApxToBroadcast>,
}

impl GradualBroadcastOperator {
    pub fn new(
        input: NodeId,
        threshold_input: NodeId,
        lower_path: ColumnPath,
        value_path: ColumnPath,
        upper_path: ColumnPath,
    ) -> Self {
        Self {
            input,
            threshold_input,
            lower_path,
            value_path,
            upper_path,
            rows: TableState::default(),
            thresholds: TableState::default(),
            current: None,
        }
    }

    fn triplet(&self) -> Result<Option<ApxToBroadcast>> {
        let Some((key, value)) = self.thresholds.iter().min_by_key(|(key, _value)| **key) else {
            return Ok(None);
        };
        Ok(Some(ApxToBroadcast {
            lower: self.lower_path.extract(key, value)?.as_ordered_float()?,
            value: self.value_path.extract(key, value)?.as_ordered_float()?,
            upper: self.upper_path.extract(key, value)?.as_ordered_float()?,
        }))
    }

    fn output_row(triplet: &ApxToBroadcast, key: &Key, value: &Value) -> Value {
        Value::Tuple([value.clone(), Value::from(triplet.bound_for(key))].into_iter().collect())
    }
}

impl Operator for GradualBroadcastOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let threshold_batch = ctx.worker.broadcast(ctx.input_owned(self.threshold_input))?;
        let batch = ctx.worker.exchange_by_key(ctx.input_owned(self.input))?;
        let mut output = Vec::new();

        if !threshold_batch.is_empty() {
            self.thresholds.apply(&threshold_batch)?;
            let new = self.triplet()?;
            if new != self.current {
                debug!("gradual broadcast threshold changed to {new:?}");
                for (key, value) in self.rows.iter() {
                    if let Some(old) = &self.current {
                        output.push((*key, Self::output_row(old, key, value), -1));
                    }
                    if let Some(new) = &new {
                        output.push((*key, Self::output_row(new, key, value), 1));
                    }
                }
                self.current = new;
            }
        }

        if let Some(current) = &self.current {
            for (key, value, diff) in &batch {
                output.push((*key, Self::output_row(current, key, value), *diff));
            }
        }
        self.rows.apply(&batch)?;
        consolidate_updates(&mut output);
        Ok(output)
    }
}
