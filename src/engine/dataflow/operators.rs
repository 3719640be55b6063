// Copyright © 2024 Pathway

pub mod gradual_broadcast;
pub mod group_by;
pub mod join;
pub mod output;
pub mod prev_next;
pub mod time_column;

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use arcstr::ArcStr;
use differential_dataflow::consolidation::consolidate_updates;
use log::{debug, warn};
use ndarray::ArrayD;

use super::exchange::WorkerContext;
use super::shard::Shard;
use crate::engine::error::{DataError, Trace};
use crate::engine::graph::{ColumnPath, ExpressionData, IxKeyPolicy};
use crate::engine::value::Type;
use crate::engine::{Error, Key, Result, Timestamp, Value};

/// A single change of a collection: row key, row value and multiplicity
/// delta.
pub type Update = (Key, Value, isize);

pub type Batch = Vec<Update>;

/// Index of an operator in its dataflow. Operators may only read outputs
/// of operators with smaller ids.
pub type NodeId = usize;

pub fn negate(batch: &[Update]) -> Batch {
    batch
        .iter()
        .map(|(key, value, diff)| (*key, value.clone(), -diff))
        .collect()
}

/// What an operator sees while processing one sub-step.
pub struct StepContext<'a> {
    pub time: Timestamp,
    pub worker: &'a WorkerContext,
    outputs: &'a [Batch],
}

impl<'a> StepContext<'a> {
    pub fn new(time: Timestamp, worker: &'a WorkerContext, outputs: &'a [Batch]) -> Self {
        Self {
            time,
            worker,
            outputs,
        }
    }

    /// Changes produced by operator `node` in the current sub-step.
    pub fn input(&self, node: NodeId) -> &'a [Update] {
        self.outputs.get(node).map_or(&[], Vec::as_slice)
    }

    pub fn input_owned(&self, node: NodeId) -> Batch {
        self.input(node).to_vec()
    }
}

/// A node of the dataflow. Every operator is stepped once per sub-step on
/// every worker, also when its inputs did not change, so that operators
/// exchanging data between workers meet each other.
pub trait Operator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch>;

    /// Called once a logical time is fully processed.
    fn on_time_end(&mut self, _time: u64) -> Result<()> {
        Ok(())
    }

    /// Called once all inputs are closed and drained.
    fn on_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Contents of a table with at most one value per key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableState {
    rows: HashMap<Key, Value>,
}

impl TableState {
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.rows.iter()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Applies a consolidated batch. Retractions go first, so a value
    /// replaced within one batch is not reported as a duplicate.
    pub fn apply(&mut self, batch: &[Update]) -> Result<()> {
        for (key, value, diff) in batch.iter().filter(|(_key, _value, diff)| *diff < 0) {
            if *diff != -1 || self.rows.get(key) != Some(value) {
                return Err(Error::NegativeMultiplicity(*key));
            }
            self.rows.remove(key);
        }
        for (key, value, diff) in batch.iter().filter(|(_key, _value, diff)| *diff > 0) {
            if *diff != 1 || self.rows.contains_key(key) {
                return Err(Error::DuplicateKey(*key));
            }
            self.rows.insert(*key, value.clone());
        }
        Ok(())
    }

    pub fn same_keys(&self, other: &Self) -> bool {
        self.rows.len() == other.rows.len() && self.rows.keys().all(|key| other.contains(key))
    }

    /// Changes turning `self` into `target`.
    pub fn diff_to(&self, target: &Self) -> Batch {
        let mut batch = Vec::new();
        for (key, value) in &self.rows {
            if target.get(key) != Some(value) {
                batch.push((*key, value.clone(), -1));
            }
        }
        for (key, value) in &target.rows {
            if self.get(key) != Some(value) {
                batch.push((*key, value.clone(), 1));
            }
        }
        consolidate_updates(&mut batch);
        batch
    }
}

pub fn keys_of<'a>(batches: impl IntoIterator<Item = &'a Batch>) -> BTreeSet<Key> {
    batches
        .into_iter()
        .flat_map(|batch| batch.iter().map(|(key, _value, _diff)| *key))
        .collect()
}

/// Takes whatever was put into the shared slot since the last step. Used
/// for sources and for tables imported into an iteration scope.
pub struct FeedOperator {
    pending: Rc<RefCell<Batch>>,
}

impl FeedOperator {
    pub fn new(pending: Rc<RefCell<Batch>>) -> Self {
        Self { pending }
    }
}

impl Operator for FeedOperator {
    fn step(&mut self, _ctx: &StepContext<'_>) -> Result<Batch> {
        let mut batch = std::mem::take(&mut *self.pending.borrow_mut());
        consolidate_updates(&mut batch);
        Ok(batch)
    }
}

pub type MapLogic = Box<dyn FnMut(&Key, &Value) -> Result<Option<(Key, Value)>>>;

/// Row-by-row transformation. The logic must be deterministic, as it is
/// applied to retractions as well.
pub struct MapOperator {
    input: NodeId,
    logic: MapLogic,
}

impl MapOperator {
    pub fn new(input: NodeId, logic: MapLogic) -> Self {
        Self { input, logic }
    }
}

impl Operator for MapOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let mut output = Vec::new();
        for (key, value, diff) in ctx.input(self.input) {
            if let Some((new_key, new_value)) = (self.logic)(key, value)? {
                output.push((new_key, new_value, *diff));
            }
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}

/// Evaluates an expression for a row, applying the error policy of the
/// column it produces.
pub fn evaluate_expression(
    expression_data: &ExpressionData,
    key: &Key,
    values: &[Value],
) -> Result<Value> {
    match expression_data.expression.eval(values) {
        Ok(value) => Ok(value),
        Err(error) => {
            let properties = &expression_data.column_properties;
            match &properties.dtype {
                Type::Optional(_) => {
                    warn!("error in expression for row {key}, replacing with None: {error}");
                    Ok(Value::None)
                }
                Type::Any => {
                    warn!("error in expression for row {key}: {error}");
                    Ok(Value::Error)
                }
                _ => Err(Error::with_trace(error, properties.trace.clone())),
            }
        }
    }
}

pub fn expression_logic(column_paths: Vec<ColumnPath>, expressions: Vec<ExpressionData>) -> MapLogic {
    Box::new(move |key, value| {
        let values = ColumnPath::extract_all(&column_paths, key, value)?;
        let results = expressions
            .iter()
            .map(|expression| evaluate_expression(expression, key, &values))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((*key, Value::from(results))))
    })
}

pub fn filter_logic(filtering_column_path: ColumnPath, trace: Trace) -> MapLogic {
    Box::new(move |key, value| {
        match filtering_column_path.extract(key, value)? {
            Value::Bool(true) => Ok(Some((*key, value.clone()))),
            Value::Bool(false) | Value::None => Ok(None),
            other => Err(Error::with_trace(
                DataError::TypeMismatch {
                    expected: "bool",
                    value: other,
                },
                trace.clone(),
            )),
        }
    })
}

pub fn reindex_logic(reindexing_column_path: ColumnPath) -> MapLogic {
    Box::new(move |key, value| {
        let new_key = reindexing_column_path.extract(key, value)?.as_pointer()?;
        Ok(Some((new_key, value.clone())))
    })
}

pub fn select_logic(column_paths: Vec<ColumnPath>) -> MapLogic {
    Box::new(move |key, value| {
        let values: Vec<Value> = column_paths
            .iter()
            .map(|path| path.extract(key, value).unwrap_or(Value::None))
            .collect();
        Ok(Some((*key, Value::from(values))))
    })
}

pub fn column_logic(column_path: ColumnPath) -> MapLogic {
    Box::new(move |key, value| Ok(Some((*key, column_path.extract(key, value)?))))
}

fn flatten_ndarray<T>(array: &ArrayD<T>) -> Vec<Value>
where
    T: Clone,
    Value: From<T>,
    Value: From<ArrayD<T>>,
{
    if array.shape().len() == 1 {
        array.iter().map(|x| Value::from(x.clone())).collect()
    } else {
        array
            .outer_iter()
            .map(|x| Value::from(x.to_owned()))
            .collect()
    }
}

fn flattened_elements(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::IntArray(array) => Ok(flatten_ndarray(&array)),
        Value::FloatArray(array) => Ok(flatten_ndarray(&array)),
        Value::Tuple(elements) => Ok(elements.to_vec()),
        Value::String(s) => Ok(s
            .chars()
            .map(|c| Value::from(ArcStr::from(c.to_string())))
            .collect()),
        Value::Json(json) => match &*json {
            serde_json::Value::Array(elements) => Ok(elements
                .iter()
                .cloned()
                .map(Value::from)
                .collect()),
            _ => Err(Error::ValueError(format!(
                "can't flatten a JSON value that is not an array: {json}"
            ))),
        },
        value => Err(Error::ValueError(format!(
            "can't flatten this value {value:?}"
        ))),
    }
}

/// Emits one row per element of a sequence column. The new key is derived
/// from the original key and the position of the element.
pub struct FlattenOperator {
    input: NodeId,
    flatten_column_path: ColumnPath,
}

impl FlattenOperator {
    pub fn new(input: NodeId, flatten_column_path: ColumnPath) -> Self {
        Self {
            input,
            flatten_column_path,
        }
    }
}

impl Operator for FlattenOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let mut output = Vec::new();
        for (key, value, diff) in ctx.input(self.input) {
            let elements = flattened_elements(self.flatten_column_path.extract(key, value)?)?;
            for (i, element) in elements.into_iter().enumerate() {
                let position = i64::try_from(i).map_err(|e| Error::ValueError(e.to_string()))?;
                let new_key = Key::for_values(&[Value::from(*key), Value::from(position)]);
                output.push((
                    new_key,
                    Value::Tuple([value.clone(), element].into_iter().collect()),
                    *diff,
                ));
            }
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}

pub type CombineLogic = Box<dyn Fn(&Key, &[Option<&Value>]) -> Result<Option<Value>>>;

/// Combines tables sharing keys. For every key touched in a sub-step, the
/// output for the state before the changes is retracted and the output
/// for the state after them is inserted.
pub struct KeyCombineOperator {
    inputs: Vec<NodeId>,
    states: Vec<TableState>,
    logic: CombineLogic,
}

impl KeyCombineOperator {
    pub fn new(inputs: Vec<NodeId>, logic: CombineLogic) -> Self {
        let states = inputs.iter().map(|_| TableState::default()).collect();
        Self {
            inputs,
            states,
            logic,
        }
    }

    fn evaluate(&self, key: &Key) -> Result<Option<Value>> {
        let values: Vec<Option<&Value>> = self.states.iter().map(|state| state.get(key)).collect();
        if values.iter().all(Option::is_none) {
            return Ok(None);
        }
        (self.logic)(key, &values)
    }
}

impl Operator for KeyCombineOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let batches = self
            .inputs
            .iter()
            .map(|input| ctx.worker.exchange_by_key(ctx.input_owned(*input)))
            .collect::<Result<Vec<_>>>()?;
        let touched = keys_of(&batches);
        let mut output = Vec::new();
        for key in &touched {
            if let Some(value) = self.evaluate(key)? {
                output.push((*key, value, -1));
            }
        }
        for (state, batch) in self.states.iter_mut().zip(&batches) {
            state.apply(batch)?;
        }
        for key in &touched {
            if let Some(value) = self.evaluate(key)? {
                output.push((*key, value, 1));
            }
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}

/// Rows of the first input whose keys are present in all the other ones.
pub fn intersect_logic() -> CombineLogic {
    Box::new(|_key, values| match values.split_first() {
        Some((Some(value), others)) if others.iter().all(Option::is_some) => {
            Ok(Some((*value).clone()))
        }
        _ => Ok(None),
    })
}

/// Rows of the first input whose keys are absent from the second one.
pub fn subtract_logic() -> CombineLogic {
    Box::new(|_key, values| match values {
        [Some(value), None] => Ok(Some((*value).clone())),
        _ => Ok(None),
    })
}

/// Rows of the second input restricted to the keys of the first one.
pub fn restrict_logic() -> CombineLogic {
    Box::new(|_key, values| match values {
        [Some(_), Some(value)] => Ok(Some((*value).clone())),
        _ => Ok(None),
    })
}

/// Pairs rows of a new table with the rows of the table it was derived
/// from, as `Tuple[new, original]`. Every key of the new table must exist
/// in the original one, and with `same_universes` also the other way round.
pub fn override_logic(same_universes: bool) -> CombineLogic {
    Box::new(move |key, values| match values {
        [Some(original), Some(new)] => Ok(Some(Value::from(vec![
            (*new).clone(),
            (*original).clone(),
        ]))),
        [None, Some(_)] => Err(Error::KeyMissingInUniverse(*key)),
        [Some(_), None] if same_universes => Err(Error::KeyMissingInOutputTable(*key)),
        _ => Ok(None),
    })
}

/// Rows of any input. A key present in more than one input is an error.
pub fn concat_logic() -> CombineLogic {
    Box::new(|key, values| {
        let mut present = values.iter().flatten();
        let value = present.next().map(|value| (*value).clone());
        if present.next().is_some() {
            return Err(Error::DuplicateKey(*key));
        }
        Ok(value)
    })
}

/// Rows of the first input, replaced by rows of the second one where
/// present.
pub fn update_rows_logic() -> CombineLogic {
    Box::new(|_key, values| match values {
        [original, update] => Ok(update.or(*original).cloned()),
        _ => Ok(None),
    })
}

/// Keys of the first input only. Each listed column takes its value from
/// the update row when there is one.
pub fn update_cells_logic(
    column_paths: Vec<ColumnPath>,
    update_paths: Vec<ColumnPath>,
) -> CombineLogic {
    Box::new(move |key, values| {
        let [Some(original), update] = values else {
            return Ok(None);
        };
        let mut result = vec![(*original).clone()];
        match update {
            Some(update) => {
                result.extend(ColumnPath::extract_all(&update_paths, key, update)?);
            }
            None => {
                result.extend(ColumnPath::extract_all(&column_paths, key, original)?);
            }
        }
        Ok(Some(Value::from(result)))
    })
}

/// A tuple of column values for keys of the universe (first input) that
/// have all columns present.
pub fn zip_columns_logic() -> CombineLogic {
    Box::new(|_key, values| match values.split_first() {
        Some((Some(_), columns)) => {
            let columns: Option<Vec<Value>> = columns
                .iter()
                .map(|column| column.map(Clone::clone))
                .collect();
            Ok(columns.map(Value::from))
        }
        _ => Ok(None),
    })
}

/// Looks up rows of one table by pointers stored in another.
pub struct IxOperator {
    to_ix: NodeId,
    key_table: NodeId,
    key_column_path: ColumnPath,
    policy: IxKeyPolicy,
    to_ix_state: TableState,
    key_state: TableState,
    pointing_at: HashMap<Key, HashSet<Key>>,
}

impl IxOperator {
    pub fn new(
        to_ix: NodeId,
        key_table: NodeId,
        key_column_path: ColumnPath,
        policy: IxKeyPolicy,
    ) -> Self {
        Self {
            to_ix,
            key_table,
            key_column_path,
            policy,
            to_ix_state: TableState::default(),
            key_state: TableState::default(),
            pointing_at: HashMap::new(),
        }
    }

    fn target(&self, key: &Key, value: &Value) -> Result<Option<Key>> {
        match self.key_column_path.extract(key, value)? {
            Value::None if self.policy == IxKeyPolicy::ForwardNone => Ok(None),
            pointer => Ok(Some(pointer.as_pointer()?)),
        }
    }

    fn evaluate(&self, key: &Key) -> Result<Option<Value>> {
        let Some(value) = self.key_state.get(key) else {
            return Ok(None);
        };
        let Some(target) = self.target(key, value)? else {
            return Ok(Some(Value::None));
        };
        match (self.to_ix_state.get(&target), self.policy) {
            (Some(found), _) => Ok(Some(found.clone())),
            (None, IxKeyPolicy::SkipMissing) => Ok(None),
            (None, _) => Err(Error::KeyMissingInOutputTable(target)),
        }
    }

    fn set_pointer(&mut self, key: Key, value: &Value, add: bool) -> Result<()> {
        if let Some(target) = self.target(&key, value)? {
            let pointing = self.pointing_at.entry(target).or_default();
            if add {
                pointing.insert(key);
            } else {
                pointing.remove(&key);
                if pointing.is_empty() {
                    self.pointing_at.remove(&target);
                }
            }
        }
        Ok(())
    }
}

impl Operator for IxOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let to_ix_batch = ctx.worker.exchange_by_key(ctx.input_owned(self.to_ix))?;
        let key_column_path = self.key_column_path.clone();
        let key_batch = ctx.worker.exchange(ctx.input_owned(self.key_table), |(key, value, _)| {
            key_column_path
                .extract(key, value)
                .ok()
                .and_then(|target| target.as_pointer().ok())
                .map_or(0, |target| target.shard_as_usize())
        })?;

        let mut touched: BTreeSet<Key> = keys_of([&key_batch]);
        for (target, _value, _diff) in &to_ix_batch {
            if let Some(pointing) = self.pointing_at.get(target) {
                touched.extend(pointing.iter().copied());
            }
        }

        let mut output = Vec::new();
        for key in &touched {
            if let Some(value) = self.evaluate(key)? {
                output.push((*key, value, -1));
            }
        }
        for (key, value, diff) in &key_batch {
            self.set_pointer(*key, value, *diff > 0)?;
        }
        self.key_state.apply(&key_batch)?;
        self.to_ix_state.apply(&to_ix_batch)?;
        for (target, _value, _diff) in &to_ix_batch {
            if let Some(pointing) = self.pointing_at.get(target) {
                touched.extend(pointing.iter().copied());
            }
        }
        for key in &touched {
            if let Some(value) = self.evaluate(key)? {
                output.push((*key, value, 1));
            }
        }
        consolidate_updates(&mut output);
        Ok(output)
    }
}

/// Outputs every row and retracts it in the retraction sub-step of the
/// same time.
#[derive(Debug, Default)]
pub struct ForgetImmediatelyOperator {
    input: NodeId,
    emitted: Batch,
}

impl ForgetImmediatelyOperator {
    pub fn new(input: NodeId) -> Self {
        Self {
            input,
            emitted: Vec::new(),
        }
    }
}

impl Operator for ForgetImmediatelyOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        if ctx.time.is_original() {
            // nothing emitted earlier is still live, so deletions have nothing to remove
            self.emitted = ctx
                .input_owned(self.input)
                .into_iter()
                .filter(|(_key, _value, diff)| *diff > 0)
                .collect();
            Ok(self.emitted.clone())
        } else {
            Ok(negate(&std::mem::take(&mut self.emitted)))
        }
    }
}

/// Drops everything produced in retraction sub-steps.
pub struct FilterOutForgettingOperator {
    input: NodeId,
}

impl FilterOutForgettingOperator {
    pub fn new(input: NodeId) -> Self {
        Self { input }
    }
}

impl Operator for FilterOutForgettingOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        if ctx.time.is_original() {
            Ok(ctx.input_owned(self.input))
        } else {
            Ok(Vec::new())
        }
    }
}

/// Prints every change of a table to stdout.
pub struct DebugOperator {
    input: NodeId,
    tag: String,
    column_path: Option<ColumnPath>,
}

impl DebugOperator {
    pub fn new(input: NodeId, tag: String, column_path: Option<ColumnPath>) -> Self {
        Self {
            input,
            tag,
            column_path,
        }
    }
}

impl Operator for DebugOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let worker = ctx.worker.index();
        let tag = &self.tag;
        let time = ctx.time;
        for (key, value, diff) in ctx.input(self.input) {
            match &self.column_path {
                Some(path) => {
                    let value = path.extract(key, value)?;
                    println!("[{worker}][{tag}] @{time} {diff:+} {key} {value}");
                }
                None => println!("[{worker}][{tag}] @{time} {diff:+} {key}"),
            }
        }
        Ok(Vec::new())
    }
}

/// Checks that the changes of a source never leave a key with more than
/// one row or with a negative count.
#[derive(Debug, Default)]
pub struct MultiplicityCheck {
    counts: HashMap<Key, isize>,
}

impl MultiplicityCheck {
    pub fn check(&mut self, batch: &[Update]) -> Result<()> {
        let mut touched = Vec::new();
        for (key, _value, diff) in batch {
            *self.counts.entry(*key).or_default() += diff;
            touched.push(*key);
        }
        for key in touched {
            match self.counts.get(&key).copied() {
                Some(count) if count > 1 => return Err(Error::DuplicateKey(key)),
                Some(count) if count < 0 => return Err(Error::NegativeMultiplicity(key)),
                Some(0) => {
                    self.counts.remove(&key);
                }
                _ => {}
            }
        }
        debug!("{} keys tracked after multiplicity check", self.counts.len());
        Ok(())
    }
}

/// Shared slot used to move a batch between the scheduler and an operator.
pub type Pending = Rc<RefCell<Batch>>;

pub fn new_pending() -> Pending {
    Rc::new(RefCell::new(Vec::new()))
}
