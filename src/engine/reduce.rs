// Copyright © 2024 Pathway

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::iter::repeat_n;
use std::num::NonZeroUsize;
use std::sync::Arc;

use derivative::Derivative;
use itertools::Itertools;
use ndarray::{CowArray, IxDyn};
use ordered_float::OrderedFloat;

use super::error::{DataError, DynResult};
use super::value::KeyImpl;
use super::{Key, Value};

/// Called once per group and logical time with the previous state and the
/// changes of the group's rows (argument values with their diffs).
pub type StatefulCombineFn =
    Arc<dyn Fn(Option<&Value>, &[(Vec<Value>, isize)]) -> DynResult<Option<Value>> + Send + Sync>;

#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub enum Reducer {
    Count,
    IntSum,
    FloatSum,
    ArraySum,
    Unique,
    Min,
    ArgMin,
    Max,
    ArgMax,
    SortedTuple {
        skip_nones: bool,
    },
    Tuple {
        skip_nones: bool,
    },
    Any,
    Stateful {
        #[derivative(Debug = "ignore")]
        combine_fn: StatefulCombineFn,
    },
}

/// Reducers whose state forms a group under addition: a retraction is
/// applied by adding the negated contribution.
pub trait SemigroupReducerImpl: Send + 'static {
    type State: Clone + Debug + Send;

    fn init(&self, key: &Key, values: &[Value]) -> DynResult<Option<Self::State>>;

    fn is_zero(&self, state: &Self::State) -> bool;

    fn plus_equals(&self, state: &mut Self::State, rhs: &Self::State, diff: isize);

    fn finish(&self, state: &Self::State) -> Value;
}

/// Reducers recomputed from the retained multiset of row states.
pub trait ReducerImpl: Send + 'static {
    type State: Ord + Clone + Debug + Send;

    fn init(&self, key: &Key, values: &[Value]) -> DynResult<Option<Self::State>>;

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value>;

    fn neutral(&self) -> Value {
        Value::None
    }
}

fn first_argument(values: &[Value]) -> DynResult<&Value> {
    values
        .first()
        .ok_or_else(|| DataError::ValueError("reducer called without arguments".into()).into())
}

#[derive(Debug, Clone, Copy)]
pub struct CountReducer;

impl SemigroupReducerImpl for CountReducer {
    type State = isize;

    fn init(&self, _key: &Key, _values: &[Value]) -> DynResult<Option<Self::State>> {
        Ok(Some(1))
    }

    fn is_zero(&self, state: &isize) -> bool {
        *state == 0
    }

    fn plus_equals(&self, state: &mut isize, rhs: &isize, diff: isize) {
        *state += rhs * diff;
    }

    fn finish(&self, state: &isize) -> Value {
        Value::from_isize(*state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntSumState {
    count: isize,
    sum: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct IntSumReducer;

impl SemigroupReducerImpl for IntSumReducer {
    type State = IntSumState;

    fn init(&self, _key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        let sum = first_argument(values)?.as_int()?;
        Ok(Some(IntSumState { count: 1, sum }))
    }

    fn is_zero(&self, state: &IntSumState) -> bool {
        state.count == 0 && state.sum == 0
    }

    fn plus_equals(&self, state: &mut IntSumState, rhs: &IntSumState, diff: isize) {
        state.count += rhs.count * diff;
        state.sum = state
            .sum
            .wrapping_add(rhs.sum.wrapping_mul(diff as i64));
    }

    fn finish(&self, state: &IntSumState) -> Value {
        Value::Int(state.sum)
    }
}

#[derive(Debug)]
enum SumState<'a> {
    Float(f64),
    IntArray(CowArray<'a, i64, IxDyn>),
    FloatArray(CowArray<'a, f64, IxDyn>),
}

impl<'a> SumState<'a> {
    #[allow(clippy::cast_precision_loss)]
    fn new(value: &'a Value, count: NonZeroUsize) -> DynResult<Self> {
        let count_i64 = i64::try_from(count.get())?;
        match value {
            Value::Float(OrderedFloat(f)) => Ok(Self::Float(f * count.get() as f64)),
            Value::Int(i) => Ok(Self::Float((i * count_i64) as f64)),
            Value::IntArray(array) if count.get() == 1 => Ok(Self::IntArray(CowArray::from(&**array))),
            Value::IntArray(array) => Ok(Self::IntArray(CowArray::from(&**array * count_i64))),
            Value::FloatArray(array) if count.get() == 1 => {
                Ok(Self::FloatArray(CowArray::from(&**array)))
            }
            Value::FloatArray(array) => Ok(Self::FloatArray(CowArray::from(
                &**array * count.get() as f64,
            ))),
            other => Err(DataError::TypeMismatch {
                expected: "float or array",
                value: other.clone(),
            }
            .into()),
        }
    }

    fn add(self, rhs: Self) -> DynResult<Self> {
        match (self, rhs) {
            (Self::Float(lhs), Self::Float(rhs)) => Ok(Self::Float(lhs + rhs)),
            (Self::IntArray(lhs), Self::IntArray(rhs)) if lhs.shape() == rhs.shape() => {
                Ok(Self::IntArray(CowArray::from(lhs.into_owned() + &rhs)))
            }
            (Self::FloatArray(lhs), Self::FloatArray(rhs)) if lhs.shape() == rhs.shape() => {
                Ok(Self::FloatArray(CowArray::from(lhs.into_owned() + &rhs)))
            }
            _ => Err(DataError::ValueError("mixing types or shapes in sum".into()).into()),
        }
    }
}

impl From<SumState<'_>> for Value {
    fn from(state: SumState<'_>) -> Self {
        match state {
            SumState::Float(f) => Self::from(f),
            SumState::IntArray(a) => Self::from(a.into_owned()),
            SumState::FloatArray(a) => Self::from(a.into_owned()),
        }
    }
}

/// Float and array sums. Recomputed in state order, so the result does not
/// depend on the order in which rows arrived.
#[derive(Debug, Clone, Copy)]
pub struct SumReducer {
    float_neutral: bool,
}

impl ReducerImpl for SumReducer {
    type State = Value;

    fn neutral(&self) -> Value {
        if self.float_neutral {
            Value::from(0.0)
        } else {
            Value::None
        }
    }

    fn init(&self, _key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        Ok(Some(first_argument(values)?.clone()))
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        let mut total: Option<SumState> = None;
        for (value, count) in states {
            let state = SumState::new(value, count)?;
            total = Some(match total {
                None => state,
                Some(total) => total.add(state)?,
            });
        }
        Ok(total.map_or_else(|| self.neutral(), Value::from))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UniqueReducer;

impl ReducerImpl for UniqueReducer {
    type State = Value;

    fn init(&self, _key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        Ok(Some(first_argument(values)?.clone()))
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        let mut states = states.into_iter();
        let Some((state, _count)) = states.next() else {
            return Ok(self.neutral());
        };
        if states.next().is_some() {
            return Err(DataError::MoreThanOneValueInUniqueReducer.into());
        }
        Ok(state.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MinReducer;

impl ReducerImpl for MinReducer {
    type State = Value;

    fn init(&self, _key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        Ok(Some(first_argument(values)?.clone()))
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        Ok(states
            .into_iter()
            .map(|(value, _count)| value)
            .min()
            .cloned()
            .unwrap_or_else(|| self.neutral()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MaxReducer;

impl ReducerImpl for MaxReducer {
    type State = Value;

    fn init(&self, _key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        Ok(Some(first_argument(values)?.clone()))
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        Ok(states
            .into_iter()
            .map(|(value, _count)| value)
            .max()
            .cloned()
            .unwrap_or_else(|| self.neutral()))
    }
}

/// Ties on the value are broken by the smallest row key.
#[derive(Debug, Clone, Copy)]
pub struct ArgMinReducer;

impl ReducerImpl for ArgMinReducer {
    type State = (Value, Key);

    fn init(&self, key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        Ok(Some((first_argument(values)?.clone(), *key)))
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        Ok(states
            .into_iter()
            .map(|(state, _count)| state)
            .min()
            .map_or_else(|| self.neutral(), |(_value, key)| Value::Pointer(*key)))
    }
}

/// Ties on the value are broken by the smallest row key.
#[derive(Debug, Clone, Copy)]
pub struct ArgMaxReducer;

impl ReducerImpl for ArgMaxReducer {
    type State = (Value, Key);

    fn init(&self, key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        Ok(Some((first_argument(values)?.clone(), *key)))
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        Ok(states
            .into_iter()
            .map(|(state, _count)| state)
            .max_by_key(|(value, key)| (value, Reverse(key)))
            .map_or_else(|| self.neutral(), |(_value, key)| Value::Pointer(*key)))
    }
}

const SALT: KeyImpl = 0xDE_AD_BE_EF_DE_AD_BE_EF_DE_AD_BE_EF_DE_AD_BE_EF_u128;

/// Picks an arbitrary but deterministic row: the one whose salted key is
/// smallest.
#[derive(Debug, Clone, Copy)]
pub struct AnyReducer;

impl ReducerImpl for AnyReducer {
    type State = (Key, Value);

    fn init(&self, key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        Ok(Some((*key, first_argument(values)?.clone())))
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        Ok(states
            .into_iter()
            .map(|(state, _count)| state)
            .min_by_key(|(key, value)| (key.salted_with(SALT), value))
            .map_or_else(|| self.neutral(), |(_key, value)| value.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SortedTupleReducer {
    skip_nones: bool,
}

impl ReducerImpl for SortedTupleReducer {
    type State = Value;

    fn init(&self, _key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        let value = first_argument(values)?;
        if self.skip_nones && *value == Value::None {
            Ok(None)
        } else {
            Ok(Some(value.clone()))
        }
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        // states arrive sorted
        let values: Vec<Value> = states
            .into_iter()
            .flat_map(|(value, count)| repeat_n(value, count.get()))
            .cloned()
            .collect();
        Ok(Value::from(values))
    }

    fn neutral(&self) -> Value {
        Value::from(Vec::new())
    }
}

/// Values ordered by the key of the row they come from.
#[derive(Debug, Clone, Copy)]
pub struct TupleReducer {
    skip_nones: bool,
}

impl ReducerImpl for TupleReducer {
    type State = (Key, Value);

    fn init(&self, key: &Key, values: &[Value]) -> DynResult<Option<Self::State>> {
        let value = first_argument(values)?;
        if self.skip_nones && *value == Value::None {
            Ok(None)
        } else {
            Ok(Some((*key, value.clone())))
        }
    }

    fn combine<'a>(
        &self,
        states: impl IntoIterator<Item = (&'a Self::State, NonZeroUsize)>,
    ) -> DynResult<Value> {
        let values: Vec<Value> = states
            .into_iter()
            .flat_map(|((_key, value), count)| repeat_n(value, count.get()))
            .cloned()
            .collect();
        Ok(Value::from(values))
    }

    fn neutral(&self) -> Value {
        Value::from(Vec::new())
    }
}

/// Running aggregate of one reducer over one group.
pub trait Accumulator: Send {
    fn update(&mut self, key: &Key, values: &[Value], diff: isize) -> DynResult<()>;

    /// Value of the aggregate after all updates of the current time.
    fn finish(&mut self) -> DynResult<Value>;
}

struct SemigroupAccumulator<R: SemigroupReducerImpl> {
    reducer: R,
    state: Option<R::State>,
}

impl<R: SemigroupReducerImpl> Accumulator for SemigroupAccumulator<R> {
    fn update(&mut self, key: &Key, values: &[Value], diff: isize) -> DynResult<()> {
        let Some(contribution) = self.reducer.init(key, values)? else {
            return Ok(());
        };
        match &mut self.state {
            Some(state) => self.reducer.plus_equals(state, &contribution, diff),
            None => {
                let mut state = contribution.clone();
                self.reducer.plus_equals(&mut state, &contribution, diff - 1);
                self.state = Some(state);
            }
        }
        if self
            .state
            .as_ref()
            .is_some_and(|state| self.reducer.is_zero(state))
        {
            self.state = None;
        }
        Ok(())
    }

    fn finish(&mut self) -> DynResult<Value> {
        Ok(self
            .state
            .as_ref()
            .map_or(Value::Int(0), |state| self.reducer.finish(state)))
    }
}

struct MultisetAccumulator<R: ReducerImpl> {
    reducer: R,
    states: BTreeMap<R::State, isize>,
}

impl<R: ReducerImpl> Accumulator for MultisetAccumulator<R> {
    fn update(&mut self, key: &Key, values: &[Value], diff: isize) -> DynResult<()> {
        let Some(state) = self.reducer.init(key, values)? else {
            return Ok(());
        };
        let count = self.states.entry(state.clone()).or_insert(0);
        *count += diff;
        if *count == 0 {
            self.states.remove(&state);
        }
        Ok(())
    }

    fn finish(&mut self) -> DynResult<Value> {
        let mut states = Vec::with_capacity(self.states.len());
        for (state, count) in &self.states {
            let count = usize::try_from(*count)
                .ok()
                .and_then(NonZeroUsize::new)
                .ok_or_else(|| DataError::ValueError(format!("negative count {count} in reducer")))?;
            states.push((state, count));
        }
        self.reducer.combine(states)
    }
}

struct StatefulAccumulator {
    combine_fn: StatefulCombineFn,
    state: Option<Value>,
    pending: Vec<(Vec<Value>, isize)>,
}

impl Accumulator for StatefulAccumulator {
    fn update(&mut self, _key: &Key, values: &[Value], diff: isize) -> DynResult<()> {
        self.pending.push((values.to_vec(), diff));
        Ok(())
    }

    fn finish(&mut self) -> DynResult<Value> {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending)
                .into_iter()
                .sorted()
                .collect_vec();
            self.state = (self.combine_fn)(self.state.as_ref(), &pending)?;
        }
        Ok(self.state.clone().unwrap_or(Value::None))
    }
}

impl Reducer {
    pub fn accumulator(&self) -> Box<dyn Accumulator> {
        fn multiset<R: ReducerImpl>(reducer: R) -> Box<dyn Accumulator> {
            Box::new(MultisetAccumulator {
                reducer,
                states: BTreeMap::new(),
            })
        }
        fn semigroup<R: SemigroupReducerImpl>(reducer: R) -> Box<dyn Accumulator> {
            Box::new(SemigroupAccumulator {
                reducer,
                state: None,
            })
        }
        match self {
            Self::Count => semigroup(CountReducer),
            Self::IntSum => semigroup(IntSumReducer),
            Self::FloatSum => multiset(SumReducer {
                float_neutral: true,
            }),
            Self::ArraySum => multiset(SumReducer {
                float_neutral: false,
            }),
            Self::Unique => multiset(UniqueReducer),
            Self::Min => multiset(MinReducer),
            Self::ArgMin => multiset(ArgMinReducer),
            Self::Max => multiset(MaxReducer),
            Self::ArgMax => multiset(ArgMaxReducer),
            Self::SortedTuple { skip_nones } => multiset(SortedTupleReducer {
                skip_nones: *skip_nones,
            }),
            Self::Tuple { skip_nones } => multiset(TupleReducer {
                skip_nones: *skip_nones,
            }),
            Self::Any => multiset(AnyReducer),
            Self::Stateful { combine_fn } => Box::new(StatefulAccumulator {
                combine_fn: combine_fn.clone(),
                state: None,
                pending: Vec::new(),
            }),
        }
    }
}
