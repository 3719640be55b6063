// Copyright © 2024 Pathway

use std::cell::Cell;
use std::rc::Rc;

use differential_dataflow::consolidation::consolidate_updates;
use log::{debug, info};

use super::operators::{Batch, NodeId, Operator, Pending, StepContext, TableState};
use super::Nodes;
use crate::engine::graph::IterationStatus;
use crate::engine::{Error, Result, Timestamp, Value};

/// Where the tables of an iteration come from and go to.
pub struct IterationLayout {
    /// Outer nodes of the iterated tables, then of the ones allowed to
    /// change their universe, then of the extra (constant) tables.
    pub inputs: Vec<NodeId>,
    /// Import slots of the inner dataflow, in the order of `inputs`.
    pub imports: Vec<Pending>,
    /// Inner nodes computing the next value of each variable.
    pub results: Vec<NodeId>,
    /// Number of leading variables whose universe must not change.
    pub fixed_universe: usize,
}

/// Computes the fixed point of a nested dataflow whenever any of its inputs
/// changes. All variables start from their input tables and are replaced
/// by the output of the nested dataflow until nothing changes or the limit
/// of rounds is reached. Emits the changes of the final variables, tagged
/// with the variable index.
pub struct IterateOperator {
    layout: IterationLayout,
    inner: Nodes,
    limit: Option<u32>,
    input_states: Vec<TableState>,
    fed: Vec<TableState>,
    result_states: Vec<TableState>,
    emitted: Vec<TableState>,
    round_counter: u64,
    status: Rc<Cell<Option<IterationStatus>>>,
}

impl IterateOperator {
    pub fn new(
        layout: IterationLayout,
        inner: Nodes,
        limit: Option<u32>,
        status: Rc<Cell<Option<IterationStatus>>>,
    ) -> Self {
        let inputs = layout.inputs.len();
        let variables = layout.results.len();
        Self {
            layout,
            inner,
            limit,
            input_states: vec![TableState::default(); inputs],
            fed: vec![TableState::default(); inputs],
            result_states: vec![TableState::default(); variables],
            emitted: vec![TableState::default(); variables],
            round_counter: 0,
            status,
        }
    }

    fn variable_count(&self) -> usize {
        self.layout.results.len()
    }

    /// Applies the nested dataflow once to `variables`.
    fn round(&mut self, ctx: &StepContext<'_>, variables: &[TableState]) -> Result<()> {
        for (i, import) in self.layout.imports.iter().enumerate() {
            let target = variables.get(i).unwrap_or(&self.input_states[i]);
            let diff = self.fed[i].diff_to(target);
            if !diff.is_empty() {
                self.fed[i] = target.clone();
                import.borrow_mut().extend(diff);
            }
        }
        let time = Timestamp::original(self.round_counter);
        self.round_counter += 1;
        let outputs = self.inner.run_step(time, ctx.worker)?;
        self.inner.time_end(time.time)?;
        for (state, node) in self.result_states.iter_mut().zip(&self.layout.results) {
            let batch = outputs.get(*node).cloned().unwrap_or_default();
            state.apply(&ctx.worker.exchange_by_key(batch)?)?;
        }
        Ok(())
    }

    fn fixed_point(&mut self, ctx: &StepContext<'_>) -> Result<Vec<TableState>> {
        let mut variables: Vec<TableState> = self.input_states[..self.variable_count()].to_vec();
        let mut iterations = 0;
        let status = loop {
            self.round(ctx, &variables)?;
            iterations += 1;
            let mut changed = false;
            for (i, (variable, result)) in variables.iter().zip(&self.result_states).enumerate() {
                if i < self.layout.fixed_universe && !variable.same_keys(result) {
                    return Err(Error::IteratedUniverseChanged);
                }
                changed |= variable != result;
            }
            variables.clone_from(&self.result_states);
            if !ctx.worker.all_reduce_or(changed)? {
                break IterationStatus::Converged { iterations };
            }
            if self.limit.is_some_and(|limit| iterations >= limit) {
                break IterationStatus::LimitReached { iterations };
            }
        };
        match status {
            IterationStatus::Converged { .. } => debug!("iteration finished: {status:?}"),
            IterationStatus::LimitReached { .. } => info!("iteration stopped: {status:?}"),
        }
        self.status.set(Some(status));
        Ok(variables)
    }
}

impl Operator for IterateOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let mut changed = false;
        for (state, input) in self.input_states.iter_mut().zip(&self.layout.inputs) {
            let batch = ctx.worker.exchange_by_key(ctx.input_owned(*input))?;
            changed |= !batch.is_empty();
            state.apply(&batch)?;
        }
        if !ctx.worker.all_reduce_or(changed)? {
            return Ok(Vec::new());
        }

        let variables = self.fixed_point(ctx)?;
        let mut output = Vec::new();
        for (index, (emitted, variable)) in self.emitted.iter_mut().zip(variables).enumerate() {
            let index = Value::from(i64::try_from(index).map_err(|e| Error::ValueError(e.to_string()))?);
            for (key, value, diff) in emitted.diff_to(&variable) {
                output.push((
                    key,
                    Value::Tuple([index.clone(), value].into_iter().collect()),
                    diff,
                ));
            }
            *emitted = variable;
        }
        consolidate_updates(&mut output);
        Ok(output)
    }

    fn on_end(&mut self) -> Result<()> {
        self.inner.end()
    }
}
