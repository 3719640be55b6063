// Copyright © 2024 Pathway

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

use differential_dataflow::consolidation::consolidate_updates;

use super::{Batch, NodeId, Operator, StepContext};
use crate::engine::dataflow::shard::Shard;
use crate::engine::graph::ColumnPath;
use crate::engine::{Error, Key, Result, Value};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortingCell {
    instance: Value,
    key: Value,
    id: Key,
}

/// Rows of all instances in sorting order, with the row values.
#[derive(Debug, Default)]
struct SortedRows {
    order: BTreeMap<SortingCell, Value>,
    cells: HashMap<Key, SortingCell>,
}

impl SortedRows {
    fn prev(&self, cell: &SortingCell) -> Option<&SortingCell> {
        self.order
            .range((Unbounded, Excluded(cell)))
            .next_back()
            .map(|(prev, _value)| prev)
            .filter(|prev| prev.instance == cell.instance)
    }

    fn next(&self, cell: &SortingCell) -> Option<&SortingCell> {
        self.order
            .range((Excluded(cell), Unbounded))
            .next()
            .map(|(next, _value)| next)
            .filter(|next| next.instance == cell.instance)
    }

    fn neighbours(&self, cell: &SortingCell) -> impl Iterator<Item = Key> {
        [self.prev(cell), self.next(cell)]
            .into_iter()
            .flatten()
            .map(|neighbour| neighbour.id)
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn output(&self, id: &Key) -> Option<Value> {
        let cell = self.cells.get(id)?;
        let values = self.order.get(cell)?;
        let prev = self.prev(cell).map_or(Value::None, |prev| Value::Pointer(prev.id));
        let next = self.next(cell).map_or(Value::None, |next| Value::Pointer(next.id));
        Some(Value::Tuple([values.clone(), prev, next].into_iter().collect()))
    }
}

/// Adds pointers to the previous and the next row within the same
/// instance, ordered by the sorting column and then by id.
pub struct SortOperator {
    input: NodeId,
    key_column_path: ColumnPath,
    instance_column_path: ColumnPath,
    rows: SortedRows,
    emitted: HashMap<Key, Value>,
}

impl SortOperator {
    pub fn new(input: NodeId, key_column_path: ColumnPath, instance_column_path: ColumnPath) -> Self {
        Self {
            input,
            key_column_path,
            instance_column_path,
            rows: SortedRows::default(),
            emitted: HashMap::new(),
        }
    }

    fn cell(&self, id: &Key, values: &Value) -> Result<SortingCell> {
        Ok(SortingCell {
            instance: self.instance_column_path.extract(id, values)?,
            key: self.key_column_path.extract(id, values)?,
            id: *id,
        })
    }
}

impl Operator for SortOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let instance_column_path = self.instance_column_path.clone();
        let batch = ctx.worker.exchange(ctx.input_owned(self.input), |(id, values, _)| {
            instance_column_path
                .extract(id, values)
                .map_or(0, |instance| Key::for_value(&instance).shard_as_usize())
        })?;

        let mut affected = BTreeSet::new();
        let mut cells = Vec::with_capacity(batch.len());
        for (id, values, diff) in &batch {
            let cell = self.cell(id, values)?;
            affected.insert(*id);
            affected.extend(self.rows.neighbours(&cell));
            cells.push((cell, values, *diff));
        }

        for (cell, _values, diff) in cells.iter().filter(|(_, _, diff)| *diff < 0) {
            if *diff != -1 || self.rows.order.remove(cell).is_none() {
                return Err(Error::NegativeMultiplicity(cell.id));
            }
            self.rows.cells.remove(&cell.id);
        }
        for (cell, values, diff) in cells.iter().filter(|(_, _, diff)| *diff > 0) {
            if *diff != 1 || self.rows.cells.contains_key(&cell.id) {
                return Err(Error::DuplicateKey(cell.id));
            }
            self.rows.order.insert(cell.clone(), (*values).clone());
            self.rows.cells.insert(cell.id, cell.clone());
        }
        for (cell, _values, _diff) in &cells {
            if self.rows.cells.contains_key(&cell.id) {
                affected.extend(self.rows.neighbours(cell));
            }
        }

        let mut output = Vec::new();
        for id in affected {
            let new = self.rows.output(&id);
            let old = match &new {
                Some(new) => self.emitted.insert(id, new.clone()),
                None => self.emitted.remove(&id),
            };
            if old == new {
                continue;
            }
            if let Some(old) = old {
                output.push((id, old, -1));
            }
            if let Some(new) = new {
                output.push((id, new, 1));
            }
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}
