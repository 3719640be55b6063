// Copyright © 2024 Pathway

use std::collections::{BTreeMap, BTreeSet, HashMap};

use differential_dataflow::consolidation::consolidate_updates;

use super::{Batch, NodeId, Operator, StepContext};
use crate::engine::graph::{ColumnPath, JoinType};
use crate::engine::value::ShardPolicy;
use crate::engine::{Error, Key, Result, Value};

/// Rows of one side sharing a join key, by row id.
type Group = BTreeMap<Key, Value>;

#[derive(Debug, Default)]
struct Side {
    groups: HashMap<Option<Key>, Group>,
}

impl Side {
    fn group(&self, join_key: &Option<Key>) -> Option<&Group> {
        self.groups.get(join_key)
    }

    fn apply(&mut self, changes: &[(Option<Key>, Key, Value, isize)]) -> Result<()> {
        for (join_key, id, values, diff) in changes.iter().filter(|change| change.3 < 0) {
            let group = self.groups.entry(*join_key).or_default();
            if *diff != -1 || group.get(id) != Some(values) {
                return Err(Error::NegativeMultiplicity(*id));
            }
            group.remove(id);
            if group.is_empty() {
                self.groups.remove(join_key);
            }
        }
        for (join_key, id, values, diff) in changes.iter().filter(|change| change.3 > 0) {
            let group = self.groups.entry(*join_key).or_default();
            if *diff != 1 || group.contains_key(id) {
                return Err(Error::DuplicateKey(*id));
            }
            group.insert(*id, values.clone());
        }
        Ok(())
    }
}

/// Joins two tables on equality of column values. Rows with `None` or
/// `Error` in any join column never match. Outer variants add unmatched
/// rows padded with `None`.
pub struct JoinOperator {
    left_input: NodeId,
    right_input: NodeId,
    left_column_paths: Vec<ColumnPath>,
    right_column_paths: Vec<ColumnPath>,
    join_type: JoinType,
    shard_policy: ShardPolicy,
    left: Side,
    right: Side,
}

impl JoinOperator {
    pub fn new(
        left_input: NodeId,
        right_input: NodeId,
        left_column_paths: Vec<ColumnPath>,
        right_column_paths: Vec<ColumnPath>,
        join_type: JoinType,
        shard_policy: ShardPolicy,
    ) -> Result<Self> {
        if left_column_paths.len() != right_column_paths.len() {
            return Err(Error::DifferentJoinConditionLengths);
        }
        Ok(Self {
            left_input,
            right_input,
            left_column_paths,
            right_column_paths,
            join_type,
            shard_policy,
            left: Side::default(),
            right: Side::default(),
        })
    }

    fn join_key(
        shard_policy: ShardPolicy,
        paths: &[ColumnPath],
        id: &Key,
        values: &Value,
    ) -> Result<Option<Key>> {
        let join_values = ColumnPath::extract_all(paths, id, values)?;
        if join_values.iter().all(Value::is_matchable) {
            Ok(Some(shard_policy.generate_key(&join_values)))
        } else {
            Ok(None)
        }
    }

    fn keyed(
        &self,
        ctx: &StepContext<'_>,
        input: NodeId,
        paths: &[ColumnPath],
    ) -> Result<Vec<(Option<Key>, Key, Value, isize)>> {
        let shard_policy = self.shard_policy;
        let keyed = ctx
            .input(input)
            .iter()
            .map(|(id, values, diff)| {
                Ok((
                    Self::join_key(shard_policy, paths, id, values)?,
                    *id,
                    values.clone(),
                    *diff,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut parts: Vec<Batch> = (0..ctx.worker.count()).map(|_| Vec::new()).collect();
        let mut routed = Vec::with_capacity(keyed.len());
        for (join_key, id, values, diff) in keyed {
            let worker = ctx.worker.worker_for(&join_key.unwrap_or(id));
            // the join key travels as a pointer in front of the row values
            let carrier = Value::Tuple(
                [join_key.map_or(Value::None, Value::Pointer), values]
                    .into_iter()
                    .collect(),
            );
            parts[worker].push((id, carrier, diff));
        }
        for (id, carrier, diff) in ctx.worker.exchange_partitioned(parts)? {
            let tuple = carrier.as_tuple()?;
            let join_key = match tuple.first() {
                Some(Value::Pointer(join_key)) => Some(*join_key),
                _ => None,
            };
            let values = tuple.get(1).cloned().unwrap_or(Value::None);
            routed.push((join_key, id, values, diff));
        }
        Ok(routed)
    }

    fn output_key(&self, left_id: Option<&Key>, right_id: Option<&Key>) -> Key {
        match (left_id, right_id) {
            (Some(left_id), _) if self.join_type.assigns_left_key() => *left_id,
            _ => Key::for_values(&[
                left_id.map_or(Value::None, |id| Value::Pointer(*id)),
                right_id.map_or(Value::None, |id| Value::Pointer(*id)),
            ]),
        }
    }

    fn output_row(
        &self,
        left: Option<(&Key, &Value)>,
        right: Option<(&Key, &Value)>,
    ) -> (Key, Value, isize) {
        let key = self.output_key(left.map(|(id, _)| id), right.map(|(id, _)| id));
        let value = Value::Tuple(
            [
                left.map_or(Value::None, |(id, _)| Value::Pointer(*id)),
                left.map_or(Value::None, |(_, values)| values.clone()),
                right.map_or(Value::None, |(id, _)| Value::Pointer(*id)),
                right.map_or(Value::None, |(_, values)| values.clone()),
            ]
            .into_iter()
            .collect(),
        );
        (key, value, 1)
    }

    fn group_output(&self, join_key: &Option<Key>, output: &mut Batch, diff: isize) {
        let empty = Group::new();
        let left = self.left.group(join_key).unwrap_or(&empty);
        let right = self.right.group(join_key).unwrap_or(&empty);
        let matching = join_key.is_some();
        let mut push = |row: (Key, Value, isize)| output.push((row.0, row.1, diff));
        if matching {
            for left_row in left {
                for right_row in right {
                    push(self.output_row(Some(left_row), Some(right_row)));
                }
            }
        }
        if self.join_type.keeps_left() && (!matching || right.is_empty()) {
            for left_row in left {
                push(self.output_row(Some(left_row), None));
            }
        }
        if self.join_type.keeps_right() && (!matching || left.is_empty()) {
            for right_row in right {
                push(self.output_row(None, Some(right_row)));
            }
        }
    }
}

impl Operator for JoinOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let left_changes = self.keyed(ctx, self.left_input, &self.left_column_paths)?;
        let right_changes = self.keyed(ctx, self.right_input, &self.right_column_paths)?;

        let touched: BTreeSet<Option<Key>> = left_changes
            .iter()
            .chain(&right_changes)
            .map(|(join_key, _id, _values, _diff)| *join_key)
            .collect();

        let mut output = Vec::new();
        for join_key in &touched {
            self.group_output(join_key, &mut output, -1);
        }
        self.left.apply(&left_changes)?;
        self.right.apply(&right_changes)?;
        for join_key in &touched {
            self.group_output(join_key, &mut output, 1);
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}
