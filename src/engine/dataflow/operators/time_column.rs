// Copyright © 2024 Pathway

use std::collections::BTreeMap;

use differential_dataflow::consolidation::consolidate_updates;
use log::debug;

use super::{negate, Batch, NodeId, Operator, StepContext};
use crate::engine::graph::ColumnPath;
use crate::engine::{Key, Result, Value};

// There is no sharding by instance; all rows meet on the first worker so
// that the column time stays consistent for all of them.
const TIME_COLUMN_SHARD: usize = 0;

/// Where the threshold and the current time of a row are stored.
#[derive(Debug, Clone)]
pub struct TimeColumns {
    pub threshold_time_column_path: ColumnPath,
    pub current_time_column_path: ColumnPath,
}

impl TimeColumns {
    pub fn new(threshold_time_column_path: ColumnPath, current_time_column_path: ColumnPath) -> Self {
        Self {
            threshold_time_column_path,
            current_time_column_path,
        }
    }

    fn threshold(&self, key: &Key, value: &Value) -> Result<Value> {
        self.threshold_time_column_path.extract(key, value)
    }

    fn current(&self, key: &Key, value: &Value) -> Result<Value> {
        self.current_time_column_path.extract(key, value)
    }
}

/// Largest current time seen so far.
#[derive(Debug, Default)]
struct ColumnTime(Option<Value>);

impl ColumnTime {
    fn advance(&mut self, columns: &TimeColumns, batch: &Batch) -> Result<()> {
        for (key, value, _diff) in batch {
            let current = columns.current(key, value)?;
            if self.0.as_ref().is_none_or(|max| *max < current) {
                self.0 = Some(current);
            }
        }
        Ok(())
    }

    fn reached(&self, threshold: &Value) -> bool {
        self.0.as_ref().is_some_and(|max| threshold <= max)
    }
}

/// Holds rows back until the largest current time seen reaches their
/// threshold. Rows that are already late pass immediately.
pub struct Postponer {
    columns: TimeColumns,
    column_time: ColumnTime,
    held: BTreeMap<(Value, Key, Value), isize>,
}

impl Postponer {
    pub fn new(columns: TimeColumns) -> Self {
        Self {
            columns,
            column_time: ColumnTime::default(),
            held: BTreeMap::new(),
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Takes a batch gathered on one worker, returns the rows released by
    /// it.
    pub fn push(&mut self, batch: Batch) -> Result<Batch> {
        self.column_time.advance(&self.columns, &batch)?;
        let mut output = Vec::new();
        for (key, value, diff) in batch {
            let threshold = self.columns.threshold(&key, &value)?;
            if self.column_time.reached(&threshold) {
                output.push((key, value, diff));
            } else {
                let entry = self.held.entry((threshold, key, value)).or_default();
                *entry += diff;
            }
        }
        self.held.retain(|_row, diff| *diff != 0);
        while let Some(entry) = self.held.first_entry() {
            let (threshold, _key, _value) = entry.key();
            if !self.column_time.reached(threshold) {
                break;
            }
            let ((_threshold, key, value), diff) = entry.remove_entry();
            output.push((key, value, diff));
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}

fn gather(ctx: &StepContext<'_>, input: NodeId) -> Result<Batch> {
    ctx.worker
        .exchange(ctx.input_owned(input), |_update| TIME_COLUMN_SHARD)
}

pub struct BufferOperator {
    input: NodeId,
    postponer: Postponer,
}

impl BufferOperator {
    pub fn new(input: NodeId, columns: TimeColumns) -> Self {
        Self {
            input,
            postponer: Postponer::new(columns),
        }
    }
}

impl Operator for BufferOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let batch = gather(ctx, self.input)?;
        self.postponer.push(batch)
    }

    fn on_end(&mut self) -> Result<()> {
        if self.postponer.held_count() > 0 {
            debug!(
                "buffer finished with {} rows still held",
                self.postponer.held_count()
            );
        }
        Ok(())
    }
}

/// Passes its input and retracts every row once its threshold is reached.
/// With `mark_forgetting_records` the retractions are emitted in the
/// retraction sub-step, so that they can be told apart from deletions.
pub struct ForgetOperator {
    input: NodeId,
    postponer: Postponer,
    mark_forgetting_records: bool,
    pending_retractions: Batch,
}

impl ForgetOperator {
    pub fn new(input: NodeId, columns: TimeColumns, mark_forgetting_records: bool) -> Self {
        Self {
            input,
            postponer: Postponer::new(columns),
            mark_forgetting_records,
            pending_retractions: Vec::new(),
        }
    }
}

impl Operator for ForgetOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let mut output = ctx.input_owned(self.input);
        let released = self.postponer.push(gather(ctx, self.input)?)?;
        let mut retractions = negate(&released);
        if self.mark_forgetting_records && ctx.time.is_original() {
            self.pending_retractions.append(&mut retractions);
        } else {
            output.append(&mut retractions);
        }
        if !ctx.time.is_original() {
            output.append(&mut self.pending_retractions);
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}

/// Drops rows whose threshold has already been reached by the largest
/// current time seen, including this batch.
pub struct FreezeOperator {
    input: NodeId,
    columns: TimeColumns,
    column_time: ColumnTime,
}

impl FreezeOperator {
    pub fn new(input: NodeId, columns: TimeColumns) -> Self {
        Self {
            input,
            columns,
            column_time: ColumnTime::default(),
        }
    }
}

impl Operator for FreezeOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let batch = gather(ctx, self.input)?;
        self.column_time.advance(&self.columns, &batch)?;
        let mut output = Vec::with_capacity(batch.len());
        for (key, value, diff) in batch {
            let threshold = self.columns.threshold(&key, &value)?;
            if self.column_time.reached(&threshold) {
                debug!("dropping late row {key} with threshold {threshold}");
            } else {
                output.push((key, value, diff));
            }
        }
        Ok(output)
    }
}
