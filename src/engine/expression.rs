// Copyright © 2024 Pathway

#![allow(clippy::let_underscore_untyped)] // seems to trigger on Derivative-generated code
#![allow(clippy::module_name_repetitions)]
#![deny(unsafe_op_in_unsafe_fn)]

use std::cmp::Ordering;
use std::mem::transmute;
use std::ops::{Deref, Range};
use std::sync::Arc;

use arcstr::ArcStr;
use derivative::Derivative;
use itertools::Itertools;
use log::warn;
use ndarray::{ArrayD, Axis};
use num_integer::Integer;
use ordered_float::OrderedFloat;
use serde_json::Value as JsonValue;
use smallvec::SmallVec;

use super::error::{DataError, DynError, DynResult, Error, Result};
use super::time::{DateTime, DateTimeNaive, DateTimeUtc, Duration, TimeUnit};
use super::{Key, Type, Value};

#[derive(Debug)]
pub enum Expressions {
    Explicit(SmallVec<[Arc<Expression>; 2]>),
    AllArguments,
    Arguments(Range<usize>),
}

#[derive(Debug)]
pub enum MaybeOwnedValues<'a> {
    Owned(SmallVec<[Value; 2]>),
    Borrowed(&'a [Value]),
}

impl Deref for MaybeOwnedValues<'_> {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        match self {
            Self::Owned(values) => values,
            Self::Borrowed(values) => values,
        }
    }
}

impl Expressions {
    pub fn eval<'v>(&self, values: &'v [Value]) -> DynResult<MaybeOwnedValues<'v>> {
        match self {
            Self::Explicit(exprs) => Ok(MaybeOwnedValues::Owned(
                exprs.iter().map(|e| e.eval(values)).try_collect()?,
            )),
            Self::Arguments(range) => values
                .get(range.clone())
                .map(MaybeOwnedValues::Borrowed)
                .ok_or_else(|| DataError::IndexOutOfBounds.into()),
            Self::AllArguments => Ok(MaybeOwnedValues::Borrowed(values)),
        }
    }
}

fn maybe_argument_slice(source: &[Arc<Expression>]) -> Option<Range<usize>> {
    let mut source = source.iter();
    let first = source.next()?;
    let Expression::Any(AnyExpression::Argument(first_index)) = **first else {
        return None;
    };
    let mut next_index = first_index + 1;
    for current in source {
        let Expression::Any(AnyExpression::Argument(current_index)) = **current else {
            return None;
        };
        if current_index != next_index {
            return None;
        }
        next_index = current_index + 1;
    }
    Some(first_index..next_index)
}

impl From<Vec<Arc<Expression>>> for Expressions {
    fn from(source: Vec<Arc<Expression>>) -> Self {
        if let Some(slice) = maybe_argument_slice(&source) {
            return Self::Arguments(slice);
        }

        Self::Explicit(source.into())
    }
}

pub type ApplyFn = dyn Fn(&[Value]) -> DynResult<Value> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Neg,
    Inv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    Lshift,
    Rshift,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOperator {
    fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    fn holds_for(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering.is_eq(),
            Self::Ne => ordering.is_ne(),
            Self::Lt => ordering.is_lt(),
            Self::Le => ordering.is_le(),
            Self::Gt => ordering.is_gt(),
            Self::Ge => ordering.is_ge(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimePart {
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
    Weekday,
    Timestamp,
}

impl DateTimePart {
    fn of(self, date_time: &impl DateTime) -> i64 {
        match self {
            Self::Nanosecond => date_time.nanosecond(),
            Self::Microsecond => date_time.microsecond(),
            Self::Millisecond => date_time.millisecond(),
            Self::Second => date_time.second(),
            Self::Minute => date_time.minute(),
            Self::Hour => date_time.hour(),
            Self::Day => date_time.day(),
            Self::Month => date_time.month(),
            Self::Year => date_time.year(),
            Self::Weekday => date_time.weekday(),
            Self::Timestamp => date_time.timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTarget {
    Int,
    Float,
    Bool,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub enum AnyExpression {
    Argument(usize),
    Const(Value),
    Identity(Arc<Expression>),
    Apply(#[derivative(Debug = "ignore")] Box<ApplyFn>, Expressions),
    IfElse(Arc<Expression>, Arc<Expression>, Arc<Expression>),
    Compare(BinaryOperator, Arc<Expression>, Arc<Expression>),
    OptionalPointerFrom(Expressions),
    MakeTuple(Expressions),
    SequenceGetItemChecked(Arc<Expression>, Arc<Expression>, Arc<Expression>),
    SequenceGetItemUnchecked(Arc<Expression>, Arc<Expression>),
    JsonGetItemChecked(Arc<Expression>, Arc<Expression>, Arc<Expression>),
    JsonGetItemUnchecked(Arc<Expression>, Arc<Expression>),
    JsonConvert(Arc<Expression>, Type),
    Parse {
        expr: Arc<Expression>,
        target: ParseTarget,
        optional: bool,
    },
    FillError(Arc<Expression>, Arc<Expression>),
    Unwrap(Arc<Expression>),
    Coalesce(Expressions),
    Require(Arc<Expression>, Expressions),
}

#[derive(Debug)]
pub enum BoolExpression {
    Const(bool),
    IsNone(Arc<Expression>),
    Not(Arc<Expression>),
    And(Arc<Expression>, Arc<Expression>),
    Or(Arc<Expression>, Arc<Expression>),
    Xor(Arc<Expression>, Arc<Expression>),
    CastFromFloat(Arc<Expression>),
    CastFromInt(Arc<Expression>),
    CastFromString(Arc<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOperator {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Mod,
    Pow,
    Lshift,
    Rshift,
    And,
    Or,
    Xor,
}

#[derive(Debug)]
pub enum IntExpression {
    Const(i64),
    Neg(Arc<Expression>),
    Binary(IntOperator, Arc<Expression>, Arc<Expression>),
    DateTimePart(DateTimePart, Arc<Expression>),
    DurationFloorDiv(Arc<Expression>, Arc<Expression>),
    DurationIn(TimeUnit, Arc<Expression>),
    CastFromBool(Arc<Expression>),
    CastFromFloat(Arc<Expression>),
    CastFromString(Arc<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOperator {
    Add,
    Sub,
    Mul,
    FloorDiv,
    TrueDiv,
    Mod,
    Pow,
}

#[derive(Debug)]
pub enum FloatExpression {
    Const(f64),
    Neg(Arc<Expression>),
    Binary(FloatOperator, Arc<Expression>, Arc<Expression>),
    IntTrueDiv(Arc<Expression>, Arc<Expression>),
    DurationTrueDiv(Arc<Expression>, Arc<Expression>),
    TimestampIn(TimeUnit, Arc<Expression>),
    CastFromBool(Arc<Expression>),
    CastFromInt(Arc<Expression>),
    CastFromString(Arc<Expression>),
}

#[derive(Debug)]
pub enum StringExpression {
    Add(Arc<Expression>, Arc<Expression>),
    Mul(Arc<Expression>, Arc<Expression>),
    CastFromBool(Arc<Expression>),
    CastFromFloat(Arc<Expression>),
    CastFromInt(Arc<Expression>),
    Strftime(Arc<Expression>, Arc<Expression>),
}

#[derive(Debug)]
pub enum PointerExpression {
    PointerFrom(Expressions),
}

#[derive(Debug)]
pub enum DateTimeNaiveExpression {
    AddDuration(Arc<Expression>, Arc<Expression>),
    SubDuration(Arc<Expression>, Arc<Expression>),
    Strptime(Arc<Expression>, Arc<Expression>),
    FromUtc(Arc<Expression>, Arc<Expression>),
    Round(Arc<Expression>, Arc<Expression>),
    Floor(Arc<Expression>, Arc<Expression>),
    FromTimestamp(Arc<Expression>, TimeUnit),
}

#[derive(Debug)]
pub enum DateTimeUtcExpression {
    AddDuration(Arc<Expression>, Arc<Expression>),
    SubDuration(Arc<Expression>, Arc<Expression>),
    Strptime(Arc<Expression>, Arc<Expression>),
    FromNaive(Arc<Expression>, Arc<Expression>),
    Round(Arc<Expression>, Arc<Expression>),
    Floor(Arc<Expression>, Arc<Expression>),
    FromTimestamp(Arc<Expression>, TimeUnit),
}

#[derive(Debug)]
pub enum DurationExpression {
    Neg(Arc<Expression>),
    Add(Arc<Expression>, Arc<Expression>),
    Sub(Arc<Expression>, Arc<Expression>),
    MulByInt(Arc<Expression>, Arc<Expression>),
    MulByFloat(Arc<Expression>, Arc<Expression>),
    DivByInt(Arc<Expression>, Arc<Expression>),
    Mod(Arc<Expression>, Arc<Expression>),
    DateTimeSub(Arc<Expression>, Arc<Expression>),
    FromUnit(Arc<Expression>, TimeUnit),
}

#[derive(Derivative)]
#[derivative(Debug)]
pub enum Expression {
    Bool(BoolExpression),
    Int(IntExpression),
    Float(FloatExpression),
    Pointer(PointerExpression),
    String(StringExpression),
    DateTimeNaive(DateTimeNaiveExpression),
    DateTimeUtc(DateTimeUtcExpression),
    Duration(DurationExpression),
    Any(AnyExpression),
}

fn normalize_index(index: i64, length: usize) -> Option<usize> {
    let length = i64::try_from(length).ok()?;
    let index = if index < 0 { index + length } else { index };
    if (0..length).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

fn get_ndarray_element<T>(array: &ArrayD<T>, index: i64) -> Option<Value>
where
    T: Clone,
    Value: From<T>,
    Value: From<ArrayD<T>>,
{
    let index = normalize_index(index, *array.shape().first()?)?;
    let row = array.index_axis(Axis(0), index);
    if row.shape().is_empty() {
        row.first().map(|element| Value::from(element.clone()))
    } else {
        Some(Value::from(row.to_owned()))
    }
}

fn get_sequence_element(
    expr: &Expression,
    index: &Expression,
    values: &[Value],
) -> DynResult<Option<Value>> {
    let index = index.eval_as_int(values)?;
    let value = expr.eval(values)?;
    match value {
        Value::IntArray(array) => Ok(get_ndarray_element(&array, index)),
        Value::FloatArray(array) => Ok(get_ndarray_element(&array, index)),
        Value::Tuple(tuple) => {
            Ok(normalize_index(index, tuple.len()).and_then(|i| tuple.get(i).cloned()))
        }
        Value::String(string) => Ok(normalize_index(index, string.chars().count())
            .and_then(|i| string.chars().nth(i))
            .map(|c| Value::from(c.to_string()))),
        _ => Err(DataError::ValueError(format!(
            "can't get element at index {index} out of {value:?}"
        ))
        .into()),
    }
}

fn get_json_element(
    expr: &Expression,
    index: &Expression,
    values: &[Value],
) -> DynResult<Result<Value, DataError>> {
    let json = expr.eval(values)?;
    let json = match json {
        Value::None => return Ok(Err(DataError::ValueMissing)),
        json => json,
    };
    let json = json.as_json()?;
    let element = match index.eval(values)? {
        Value::Int(i) => match json {
            JsonValue::Array(array) => normalize_index(i, array.len())
                .and_then(|i| array.get(i))
                .ok_or(DataError::IndexOutOfBounds),
            _ => Err(DataError::IndexOutOfBounds),
        },
        Value::String(key) => json
            .get(key.as_str())
            .ok_or_else(|| DataError::KeyMissingInJson(key.to_string())),
        other => {
            return Err(DataError::TypeMismatch {
                expected: "integer or string index",
                value: other,
            }
            .into())
        }
    };
    Ok(element.map(|element| Value::from(element.clone())))
}

fn convert_json(value: &Value, type_: &Type) -> DynResult<Value> {
    let json = match value {
        Value::None => return Ok(Value::None),
        value => value.as_json()?,
    };
    let converted = match (json, type_.unoptionalize()) {
        (JsonValue::Null, _) => Some(Value::None),
        (JsonValue::Bool(b), Type::Bool) => Some(Value::from(*b)),
        (JsonValue::Number(n), Type::Int) => n.as_i64().map(Value::from),
        (JsonValue::Number(n), Type::Float) => n.as_f64().map(Value::from),
        (JsonValue::String(s), Type::String) => Some(Value::from(s.as_str())),
        _ => None,
    };
    match converted {
        Some(Value::None) if !type_.is_optional() => Err(DataError::ValueMissing.into()),
        Some(value) => Ok(value),
        None => Err(DataError::ValueError(format!("cannot convert {json} to {type_}")).into()),
    }
}

const TRUE_STRINGS: [&str; 4] = ["on", "true", "yes", "1"];
const FALSE_STRINGS: [&str; 4] = ["off", "false", "no", "0"];

fn parse_string(string: &str, target: ParseTarget) -> Result<Value, DataError> {
    let trimmed = string.trim();
    let parsed = match target {
        ParseTarget::Int => trimmed.parse::<i64>().ok().map(Value::from),
        ParseTarget::Float => trimmed.parse::<f64>().ok().map(Value::from),
        ParseTarget::Bool => {
            let lowered = trimmed.to_lowercase();
            if TRUE_STRINGS.contains(&lowered.as_str()) {
                Some(Value::Bool(true))
            } else if FALSE_STRINGS.contains(&lowered.as_str()) {
                Some(Value::Bool(false))
            } else {
                None
            }
        }
    };
    parsed.ok_or_else(|| DataError::ParseError(format!("cannot parse {string:?} as {target:?}")))
}

impl AnyExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<Value> {
        match self {
            Self::Argument(i) => Ok(values.get(*i).ok_or(DataError::IndexOutOfBounds)?.clone()),
            Self::Const(v) => Ok(v.clone()),
            Self::Identity(e) => e.eval(values),
            Self::Apply(f, args) => f(&args.eval(values)?),
            Self::IfElse(if_, then, else_) => {
                if if_.eval_as_bool(values)? {
                    then.eval(values)
                } else {
                    else_.eval(values)
                }
            }
            Self::Compare(op, lhs, rhs) => {
                let ordering = lhs.eval(values)?.cmp(&rhs.eval(values)?);
                Ok(Value::from(op.holds_for(ordering)))
            }
            Self::OptionalPointerFrom(args) => {
                let args = args.eval(values)?;
                if args.iter().any(|a| matches!(a, Value::None)) {
                    Ok(Value::None)
                } else {
                    Ok(Value::from(Key::for_values(&args)))
                }
            }
            Self::MakeTuple(args) => Ok(Value::from(&*args.eval(values)?)),
            Self::SequenceGetItemChecked(sequence, index, default) => {
                match get_sequence_element(sequence, index, values)? {
                    Some(entry) => Ok(entry),
                    None => default.eval(values),
                }
            }
            Self::SequenceGetItemUnchecked(sequence, index) => {
                get_sequence_element(sequence, index, values)?
                    .ok_or_else(|| DataError::IndexOutOfBounds.into())
            }
            Self::JsonGetItemChecked(json, index, default) => {
                match get_json_element(json, index, values)? {
                    Ok(entry) => Ok(entry),
                    Err(_) => default.eval(values),
                }
            }
            Self::JsonGetItemUnchecked(json, index) => {
                Ok(get_json_element(json, index, values)??)
            }
            Self::JsonConvert(e, type_) => convert_json(&e.eval(values)?, type_),
            Self::Parse {
                expr,
                target,
                optional,
            } => {
                let value = expr.eval(values)?;
                if value == Value::None {
                    return Ok(Value::None);
                }
                match parse_string(value.as_string()?, *target) {
                    Ok(parsed) => Ok(parsed),
                    Err(_) if *optional => Ok(Value::None),
                    Err(error) => Err(error.into()),
                }
            }
            Self::FillError(e, replacement) => match e.eval(values) {
                Ok(Value::Error) | Err(_) => replacement.eval(values),
                Ok(value) => Ok(value),
            },
            Self::Unwrap(e) => match e.eval(values)? {
                Value::None => Err(DataError::ValueMissing.into()),
                value => Ok(value),
            },
            Self::Coalesce(args) => Ok(args
                .eval(values)?
                .iter()
                .find(|value| !matches!(value, Value::None))
                .cloned()
                .unwrap_or(Value::None)),
            Self::Require(e, args) => {
                if args.eval(values)?.iter().any(|a| matches!(a, Value::None)) {
                    Ok(Value::None)
                } else {
                    e.eval(values)
                }
            }
        }
    }
}

impl BoolExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<bool> {
        match self {
            Self::Const(c) => Ok(*c),
            Self::IsNone(e) => Ok(matches!(e.eval(values)?, Value::None)),
            Self::Not(e) => Ok(!e.eval_as_bool(values)?),
            Self::And(lhs, rhs) => Ok(lhs.eval_as_bool(values)? && rhs.eval_as_bool(values)?),
            Self::Or(lhs, rhs) => Ok(lhs.eval_as_bool(values)? || rhs.eval_as_bool(values)?),
            Self::Xor(lhs, rhs) => Ok(lhs.eval_as_bool(values)? ^ rhs.eval_as_bool(values)?),
            Self::CastFromInt(e) => Ok(e.eval_as_int(values)? != 0),
            Self::CastFromFloat(e) => Ok(e.eval_as_float(values)? != 0.0),
            Self::CastFromString(e) => Ok(!e.eval_as_string(values)?.is_empty()),
        }
    }
}

fn checked_int(result: Option<i64>, op: IntOperator) -> DynResult<i64> {
    result.ok_or_else(|| DataError::ValueError(format!("integer overflow in {op:?}")).into())
}

impl IntOperator {
    fn apply(self, lhs: i64, rhs: i64) -> DynResult<i64> {
        match self {
            Self::Add => checked_int(lhs.checked_add(rhs), self),
            Self::Sub => checked_int(lhs.checked_sub(rhs), self),
            Self::Mul => checked_int(lhs.checked_mul(rhs), self),
            Self::FloorDiv if rhs == 0 => Err(DataError::DivisionByZero.into()),
            Self::FloorDiv => Ok(Integer::div_floor(&lhs, &rhs)),
            Self::Mod if rhs == 0 => Err(DataError::DivisionByZero.into()),
            Self::Mod => Ok(Integer::mod_floor(&lhs, &rhs)),
            Self::Pow => {
                let exponent = u32::try_from(rhs).map_err(|_| {
                    DataError::ValueError(format!("negative or too large exponent {rhs}"))
                })?;
                checked_int(lhs.checked_pow(exponent), self)
            }
            Self::Lshift | Self::Rshift => {
                let shift = u32::try_from(rhs)
                    .map_err(|_| DataError::ValueError(format!("negative shift count {rhs}")))?;
                let shifted = if self == Self::Lshift {
                    lhs.checked_shl(shift)
                } else {
                    lhs.checked_shr(shift)
                };
                checked_int(shifted, self)
            }
            Self::And => Ok(lhs & rhs),
            Self::Or => Ok(lhs | rhs),
            Self::Xor => Ok(lhs ^ rhs),
        }
    }
}

impl IntExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<i64> {
        match self {
            Self::Const(c) => Ok(*c),
            Self::Neg(e) => checked_int(e.eval_as_int(values)?.checked_neg(), IntOperator::Sub),
            Self::Binary(op, lhs, rhs) => {
                op.apply(lhs.eval_as_int(values)?, rhs.eval_as_int(values)?)
            }
            Self::DateTimePart(part, e) => match e.eval(values)? {
                Value::DateTimeNaive(date_time) => Ok(part.of(&date_time)),
                Value::DateTimeUtc(date_time) => Ok(part.of(&date_time)),
                other => Err(DataError::TypeMismatch {
                    expected: "DateTimeNaive or DateTimeUtc",
                    value: other,
                }
                .into()),
            },
            Self::DurationFloorDiv(lhs, rhs) => {
                Ok((lhs.eval_as_duration(values)? / rhs.eval_as_duration(values)?)?)
            }
            Self::DurationIn(unit, e) => Ok(e.eval_as_duration(values)?.in_unit(*unit)),
            #[allow(clippy::cast_possible_truncation)]
            Self::CastFromFloat(e) => Ok(e.eval_as_float(values)? as i64),
            Self::CastFromBool(e) => Ok(i64::from(e.eval_as_bool(values)?)),
            Self::CastFromString(e) => {
                let string = e.eval_as_string(values)?;
                string.trim().parse().map_err(|_| {
                    DataError::ParseError(format!("cannot cast to int from {string:?}")).into()
                })
            }
        }
    }
}

impl FloatOperator {
    fn apply(self, lhs: f64, rhs: f64) -> DynResult<f64> {
        match self {
            Self::Add => Ok(lhs + rhs),
            Self::Sub => Ok(lhs - rhs),
            Self::Mul => Ok(lhs * rhs),
            Self::FloorDiv | Self::TrueDiv | Self::Mod if rhs == 0.0 => {
                Err(DataError::DivisionByZero.into())
            }
            Self::FloorDiv => Ok((lhs / rhs).floor()),
            Self::TrueDiv => Ok(lhs / rhs),
            Self::Mod => {
                // sign of the result follows the divisor
                let mut modulo = lhs % rhs;
                if modulo == 0.0 {
                    modulo = modulo.copysign(rhs);
                } else if (rhs < 0.0) != (modulo < 0.0) {
                    modulo += rhs;
                }
                Ok(modulo)
            }
            Self::Pow => {
                let result = lhs.powf(rhs);
                if result.is_infinite() {
                    warn!("overflow encountered in power.");
                }
                Ok(result)
            }
        }
    }
}

impl FloatExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<f64> {
        match self {
            Self::Const(c) => Ok(*c),
            Self::Neg(e) => Ok(-e.eval_as_float(values)?),
            Self::Binary(op, lhs, rhs) => {
                op.apply(lhs.eval_as_float(values)?, rhs.eval_as_float(values)?)
            }
            #[allow(clippy::cast_precision_loss)]
            Self::IntTrueDiv(lhs, rhs) => {
                let rhs = rhs.eval_as_int(values)?;
                if rhs == 0 {
                    Err(DataError::DivisionByZero.into())
                } else {
                    Ok(lhs.eval_as_int(values)? as f64 / rhs as f64)
                }
            }
            Self::DurationTrueDiv(lhs, rhs) => Ok(lhs
                .eval_as_duration(values)?
                .true_div(rhs.eval_as_duration(values)?)?),
            Self::TimestampIn(unit, e) => match e.eval(values)? {
                Value::DateTimeNaive(date_time) => Ok(date_time.timestamp_in_unit(*unit)),
                Value::DateTimeUtc(date_time) => Ok(date_time.timestamp_in_unit(*unit)),
                Value::Duration(duration) => Ok(duration.in_unit_f64(*unit)),
                other => Err(DataError::TypeMismatch {
                    expected: "date time or duration",
                    value: other,
                }
                .into()),
            },
            Self::CastFromBool(e) => Ok(if e.eval_as_bool(values)? { 1.0 } else { 0.0 }),
            #[allow(clippy::cast_precision_loss)]
            Self::CastFromInt(e) => Ok(e.eval_as_int(values)? as f64),
            Self::CastFromString(e) => {
                let string = e.eval_as_string(values)?;
                string.trim().parse().map_err(|_| {
                    DataError::ParseError(format!("cannot cast to float from {string:?}")).into()
                })
            }
        }
    }
}

impl PointerExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<Key> {
        match self {
            Self::PointerFrom(args) => Ok(Key::for_values(&args.eval(values)?)),
        }
    }
}

impl StringExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<ArcStr> {
        match self {
            Self::Add(lhs, rhs) => {
                let lhs = lhs.eval_as_string(values)?;
                let rhs = rhs.eval_as_string(values)?;
                if lhs.is_empty() {
                    Ok(rhs)
                } else if rhs.is_empty() {
                    Ok(lhs)
                } else {
                    Ok(ArcStr::from([lhs, rhs].concat()))
                }
            }
            Self::Mul(lhs, rhs) => {
                let repeat = usize::try_from(rhs.eval_as_int(values)?).unwrap_or(0);
                Ok(ArcStr::repeat(&lhs.eval_as_string(values)?, repeat))
            }
            Self::CastFromInt(e) => Ok(e.eval_as_int(values)?.to_string().into()),
            Self::CastFromFloat(e) => Ok(format!("{:?}", e.eval_as_float(values)?).into()),
            Self::CastFromBool(e) => Ok(if e.eval_as_bool(values)? {
                arcstr::literal!("True")
            } else {
                arcstr::literal!("False")
            }),
            Self::Strftime(e, fmt) => {
                let fmt = fmt.eval_as_string(values)?;
                match e.eval(values)? {
                    Value::DateTimeNaive(date_time) => Ok(date_time.strftime(&fmt).into()),
                    Value::DateTimeUtc(date_time) => Ok(date_time.strftime(&fmt).into()),
                    other => Err(DataError::TypeMismatch {
                        expected: "DateTimeNaive or DateTimeUtc",
                        value: other,
                    }
                    .into()),
                }
            }
        }
    }
}

impl DateTimeNaiveExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<DateTimeNaive> {
        match self {
            Self::AddDuration(lhs, rhs) => {
                Ok(lhs.eval_as_date_time_naive(values)? + rhs.eval_as_duration(values)?)
            }
            Self::SubDuration(lhs, rhs) => {
                Ok(lhs.eval_as_date_time_naive(values)? - rhs.eval_as_duration(values)?)
            }
            Self::Strptime(e, fmt) => Ok(DateTimeNaive::strptime(
                &e.eval_as_string(values)?,
                &fmt.eval_as_string(values)?,
            )?),
            Self::FromUtc(expr, timezone) => Ok(expr
                .eval_as_date_time_utc(values)?
                .to_naive_in_timezone(&timezone.eval_as_string(values)?)?),
            Self::Round(expr, duration) => Ok(expr
                .eval_as_date_time_naive(values)?
                .round(duration.eval_as_duration(values)?)?),
            Self::Floor(expr, duration) => Ok(expr
                .eval_as_date_time_naive(values)?
                .truncate(duration.eval_as_duration(values)?)?),
            Self::FromTimestamp(expr, unit) => Ok(DateTimeNaive::from_timestamp(
                expr.eval_as_int(values)?,
                *unit,
            )?),
        }
    }
}

impl DateTimeUtcExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<DateTimeUtc> {
        match self {
            Self::AddDuration(lhs, rhs) => {
                Ok(lhs.eval_as_date_time_utc(values)? + rhs.eval_as_duration(values)?)
            }
            Self::SubDuration(lhs, rhs) => {
                Ok(lhs.eval_as_date_time_utc(values)? - rhs.eval_as_duration(values)?)
            }
            Self::Strptime(e, fmt) => Ok(DateTimeUtc::strptime(
                &e.eval_as_string(values)?,
                &fmt.eval_as_string(values)?,
            )?),
            Self::FromNaive(expr, from_timezone) => Ok(expr
                .eval_as_date_time_naive(values)?
                .to_utc_from_timezone(&from_timezone.eval_as_string(values)?)?),
            Self::Round(expr, duration) => Ok(expr
                .eval_as_date_time_utc(values)?
                .round(duration.eval_as_duration(values)?)?),
            Self::Floor(expr, duration) => Ok(expr
                .eval_as_date_time_utc(values)?
                .truncate(duration.eval_as_duration(values)?)?),
            Self::FromTimestamp(expr, unit) => Ok(DateTimeUtc::from_timestamp(
                expr.eval_as_int(values)?,
                *unit,
            )?),
        }
    }
}

impl DurationExpression {
    pub fn eval(&self, values: &[Value]) -> DynResult<Duration> {
        match self {
            Self::Neg(e) => Ok(-e.eval_as_duration(values)?),
            Self::Add(lhs, rhs) => {
                Ok(lhs.eval_as_duration(values)? + rhs.eval_as_duration(values)?)
            }
            Self::Sub(lhs, rhs) => {
                Ok(lhs.eval_as_duration(values)? - rhs.eval_as_duration(values)?)
            }
            Self::MulByInt(lhs, rhs) => {
                Ok(lhs.eval_as_duration(values)? * rhs.eval_as_int(values)?)
            }
            Self::MulByFloat(lhs, rhs) => {
                Ok(lhs.eval_as_duration(values)? * rhs.eval_as_float(values)?)
            }
            Self::DivByInt(lhs, rhs) => {
                Ok((lhs.eval_as_duration(values)? / rhs.eval_as_int(values)?)?)
            }
            Self::Mod(lhs, rhs) => {
                Ok((lhs.eval_as_duration(values)? % rhs.eval_as_duration(values)?)?)
            }
            Self::DateTimeSub(lhs, rhs) => match (lhs.eval(values)?, rhs.eval(values)?) {
                (Value::DateTimeNaive(lhs), Value::DateTimeNaive(rhs)) => Ok(lhs - rhs),
                (Value::DateTimeUtc(lhs), Value::DateTimeUtc(rhs)) => Ok(lhs - rhs),
                (lhs, _) => Err(DataError::TypeMismatch {
                    expected: "two date times of the same kind",
                    value: lhs,
                }
                .into()),
            },
            Self::FromUnit(e, unit) => Ok(Duration::new_with_unit(
                e.eval_as_int(values)?,
                *unit,
            )?),
        }
    }
}

macro_rules! compiled_input {
    (i64, $val:expr) => {
        $val.as_int()?
    };
    (f64, $val:expr) => {
        $val.as_float()?
    };
}

macro_rules! compiled_function {
    ($addr:expr, ($($arg:tt),+) -> $ret:tt) => {{
        let function_ptr: unsafe extern "C" fn($($arg),+) -> $ret = unsafe { transmute($addr) };
        Expression::Any(AnyExpression::Apply(
            Box::new(move |values| {
                let mut values = values.iter();
                let mut next = || values.next().ok_or(DataError::IndexOutOfBounds);
                let result = unsafe { function_ptr($(compiled_input!($arg, next()?)),+) };
                Ok(Value::from(result))
            }),
            Expressions::AllArguments,
        ))
    }};
}

impl Expression {
    pub fn eval(&self, values: &[Value]) -> DynResult<Value> {
        match self {
            Self::Bool(expr) => Ok(Value::from(expr.eval(values)?)),
            Self::Int(expr) => Ok(Value::from(expr.eval(values)?)),
            Self::Float(expr) => Ok(Value::from(expr.eval(values)?)),
            Self::Pointer(expr) => Ok(Value::from(expr.eval(values)?)),
            Self::String(expr) => Ok(Value::from(expr.eval(values)?)),
            Self::DateTimeNaive(expr) => Ok(Value::from(expr.eval(values)?)),
            Self::DateTimeUtc(expr) => Ok(Value::from(expr.eval(values)?)),
            Self::Duration(expr) => Ok(Value::from(expr.eval(values)?)),
            Self::Any(expr) => expr.eval(values),
        }
    }

    #[cold]
    #[inline(never)]
    fn type_error(&self, expected: &'static str) -> DynError {
        let actual = match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Pointer(_) => "pointer",
            Self::String(_) => "string",
            Self::DateTimeNaive(_) => "DateTimeNaive",
            Self::DateTimeUtc(_) => "DateTimeUtc",
            Self::Duration(_) => "Duration",
            Self::Any(_) => "unknown type",
        };
        DataError::ValueError(format!("expected {expected} expression, got {actual}")).into()
    }

    pub fn eval_as_bool(&self, values: &[Value]) -> DynResult<bool> {
        match self {
            Self::Bool(expr) => expr.eval(values),
            Self::Any(expr) => expr.eval(values)?.as_bool(),
            _ => Err(self.type_error("bool")),
        }
    }

    pub fn eval_as_int(&self, values: &[Value]) -> DynResult<i64> {
        match self {
            Self::Int(expr) => expr.eval(values),
            Self::Any(expr) => expr.eval(values)?.as_int(),
            _ => Err(self.type_error("int")),
        }
    }

    pub fn eval_as_float(&self, values: &[Value]) -> DynResult<f64> {
        match self {
            Self::Float(expr) => expr.eval(values),
            Self::Any(expr) => expr.eval(values)?.as_float(),
            _ => Err(self.type_error("float")),
        }
    }

    pub fn eval_as_string(&self, values: &[Value]) -> DynResult<ArcStr> {
        match self {
            Self::String(expr) => expr.eval(values),
            Self::Any(expr) => Ok(expr.eval(values)?.as_string()?.clone()),
            _ => Err(self.type_error("string")),
        }
    }

    pub fn eval_as_date_time_naive(&self, values: &[Value]) -> DynResult<DateTimeNaive> {
        match self {
            Self::DateTimeNaive(expr) => expr.eval(values),
            Self::Any(expr) => expr.eval(values)?.as_date_time_naive(),
            _ => Err(self.type_error("DateTimeNaive")),
        }
    }

    pub fn eval_as_date_time_utc(&self, values: &[Value]) -> DynResult<DateTimeUtc> {
        match self {
            Self::DateTimeUtc(expr) => expr.eval(values),
            Self::Any(expr) => expr.eval(values)?.as_date_time_utc(),
            _ => Err(self.type_error("DateTimeUtc")),
        }
    }

    pub fn eval_as_duration(&self, values: &[Value]) -> DynResult<Duration> {
        match self {
            Self::Duration(expr) => expr.eval(values),
            Self::Any(expr) => expr.eval(values)?.as_duration(),
            _ => Err(self.type_error("Duration")),
        }
    }

    pub fn new_const(value: Value) -> Self {
        match value {
            Value::Bool(b) => Self::Bool(BoolExpression::Const(b)),
            Value::Int(i) => Self::Int(IntExpression::Const(i)),
            Value::Float(OrderedFloat(f)) => Self::Float(FloatExpression::Const(f)),
            other => Self::Any(AnyExpression::Const(other)),
        }
    }

    pub fn argument(index: usize) -> Self {
        Self::Any(AnyExpression::Argument(index))
    }

    pub fn apply(
        function: impl Fn(&[Value]) -> DynResult<Value> + Send + Sync + 'static,
        args: Vec<Arc<Expression>>,
    ) -> Self {
        Self::Any(AnyExpression::Apply(Box::new(function), args.into()))
    }

    /// Builds an expression calling a natively compiled numeric function.
    ///
    /// Returns `None` for signatures other than one or two `int64`/`float64`
    /// arguments returning `int64` or `float64`.
    ///
    /// # Safety
    ///
    /// `address` must point to an `extern "C"` function with exactly the
    /// given `signature`, valid for the lifetime of the expression.
    pub unsafe fn unsafe_compiled_apply(address: *const (), signature: &str) -> Option<Self> {
        let expression = match signature {
            "(int64,) -> int64" => compiled_function!(address, (i64) -> i64),
            "(int64,) -> float64" => compiled_function!(address, (i64) -> f64),
            "(float64,) -> int64" => compiled_function!(address, (f64) -> i64),
            "(float64,) -> float64" => compiled_function!(address, (f64) -> f64),
            "(int64, int64) -> int64" => compiled_function!(address, (i64, i64) -> i64),
            "(int64, int64) -> float64" => compiled_function!(address, (i64, i64) -> f64),
            "(int64, float64) -> int64" => compiled_function!(address, (i64, f64) -> i64),
            "(int64, float64) -> float64" => compiled_function!(address, (i64, f64) -> f64),
            "(float64, int64) -> int64" => compiled_function!(address, (f64, i64) -> i64),
            "(float64, int64) -> float64" => compiled_function!(address, (f64, i64) -> f64),
            "(float64, float64) -> int64" => compiled_function!(address, (f64, f64) -> i64),
            "(float64, float64) -> float64" => compiled_function!(address, (f64, f64) -> f64),
            _ => return None,
        };
        Some(expression)
    }

    pub fn unary(op: UnaryOperator, expr: Arc<Expression>, type_: &Type) -> Option<Self> {
        let expression = match (op, type_) {
            (UnaryOperator::Inv, Type::Bool) => BoolExpression::Not(expr).into(),
            (UnaryOperator::Inv, Type::Int) => IntExpression::Binary(
                IntOperator::Xor,
                expr,
                Arc::new(Self::new_const(Value::Int(-1))),
            )
            .into(),
            (UnaryOperator::Neg, Type::Int) => IntExpression::Neg(expr).into(),
            (UnaryOperator::Neg, Type::Float) => FloatExpression::Neg(expr).into(),
            (UnaryOperator::Neg, Type::Duration) => DurationExpression::Neg(expr).into(),
            _ => return None,
        };
        Some(expression)
    }

    #[allow(clippy::too_many_lines)]
    pub fn binary(
        op: BinaryOperator,
        lhs: Arc<Expression>,
        rhs: Arc<Expression>,
        lhs_type: &Type,
        rhs_type: &Type,
    ) -> Option<Self> {
        use BinaryOperator as Op;

        if op.is_comparison() {
            return Self::comparison(op, lhs, rhs, lhs_type, rhs_type);
        }
        let as_float = |e: Arc<Expression>| Arc::new(Self::Float(FloatExpression::CastFromInt(e)));
        let expression = match (op, lhs_type, rhs_type) {
            (Op::And, Type::Bool, Type::Bool) => BoolExpression::And(lhs, rhs).into(),
            (Op::Or, Type::Bool, Type::Bool) => BoolExpression::Or(lhs, rhs).into(),
            (Op::Xor, Type::Bool, Type::Bool) => BoolExpression::Xor(lhs, rhs).into(),
            (Op::TrueDiv, Type::Int, Type::Int) => FloatExpression::IntTrueDiv(lhs, rhs).into(),
            (_, Type::Int, Type::Int) => {
                let int_op = match op {
                    Op::Add => IntOperator::Add,
                    Op::Sub => IntOperator::Sub,
                    Op::Mul => IntOperator::Mul,
                    Op::FloorDiv => IntOperator::FloorDiv,
                    Op::Mod => IntOperator::Mod,
                    Op::Pow => IntOperator::Pow,
                    Op::Lshift => IntOperator::Lshift,
                    Op::Rshift => IntOperator::Rshift,
                    Op::And => IntOperator::And,
                    Op::Or => IntOperator::Or,
                    Op::Xor => IntOperator::Xor,
                    _ => return None,
                };
                IntExpression::Binary(int_op, lhs, rhs).into()
            }
            (_, Type::Float | Type::Int, Type::Float | Type::Int) => {
                let float_op = match op {
                    Op::Add => FloatOperator::Add,
                    Op::Sub => FloatOperator::Sub,
                    Op::Mul => FloatOperator::Mul,
                    Op::FloorDiv => FloatOperator::FloorDiv,
                    Op::TrueDiv => FloatOperator::TrueDiv,
                    Op::Mod => FloatOperator::Mod,
                    Op::Pow => FloatOperator::Pow,
                    _ => return None,
                };
                let lhs = if *lhs_type == Type::Int { as_float(lhs) } else { lhs };
                let rhs = if *rhs_type == Type::Int { as_float(rhs) } else { rhs };
                FloatExpression::Binary(float_op, lhs, rhs).into()
            }
            (Op::Add, Type::String, Type::String) => StringExpression::Add(lhs, rhs).into(),
            (Op::Mul, Type::String, Type::Int) => StringExpression::Mul(lhs, rhs).into(),
            (Op::Mul, Type::Int, Type::String) => StringExpression::Mul(rhs, lhs).into(),
            (Op::Sub, Type::DateTimeNaive, Type::DateTimeNaive)
            | (Op::Sub, Type::DateTimeUtc, Type::DateTimeUtc) => {
                DurationExpression::DateTimeSub(lhs, rhs).into()
            }
            (Op::Add, Type::DateTimeNaive, Type::Duration) => {
                DateTimeNaiveExpression::AddDuration(lhs, rhs).into()
            }
            (Op::Add, Type::Duration, Type::DateTimeNaive) => {
                DateTimeNaiveExpression::AddDuration(rhs, lhs).into()
            }
            (Op::Sub, Type::DateTimeNaive, Type::Duration) => {
                DateTimeNaiveExpression::SubDuration(lhs, rhs).into()
            }
            (Op::Add, Type::DateTimeUtc, Type::Duration) => {
                DateTimeUtcExpression::AddDuration(lhs, rhs).into()
            }
            (Op::Add, Type::Duration, Type::DateTimeUtc) => {
                DateTimeUtcExpression::AddDuration(rhs, lhs).into()
            }
            (Op::Sub, Type::DateTimeUtc, Type::Duration) => {
                DateTimeUtcExpression::SubDuration(lhs, rhs).into()
            }
            (Op::Add, Type::Duration, Type::Duration) => DurationExpression::Add(lhs, rhs).into(),
            (Op::Sub, Type::Duration, Type::Duration) => DurationExpression::Sub(lhs, rhs).into(),
            (Op::Mod, Type::Duration, Type::Duration) => DurationExpression::Mod(lhs, rhs).into(),
            (Op::FloorDiv, Type::Duration, Type::Duration) => {
                IntExpression::DurationFloorDiv(lhs, rhs).into()
            }
            (Op::TrueDiv, Type::Duration, Type::Duration) => {
                FloatExpression::DurationTrueDiv(lhs, rhs).into()
            }
            (Op::Mul, Type::Duration, Type::Int) => DurationExpression::MulByInt(lhs, rhs).into(),
            (Op::Mul, Type::Int, Type::Duration) => DurationExpression::MulByInt(rhs, lhs).into(),
            (Op::Mul, Type::Duration, Type::Float) => {
                DurationExpression::MulByFloat(lhs, rhs).into()
            }
            (Op::Mul, Type::Float, Type::Duration) => {
                DurationExpression::MulByFloat(rhs, lhs).into()
            }
            (Op::FloorDiv, Type::Duration, Type::Int) => {
                DurationExpression::DivByInt(lhs, rhs).into()
            }
            _ => return None,
        };
        Some(expression)
    }

    fn comparison(
        op: BinaryOperator,
        lhs: Arc<Expression>,
        rhs: Arc<Expression>,
        lhs_type: &Type,
        rhs_type: &Type,
    ) -> Option<Self> {
        let as_float = |e: Arc<Expression>| Arc::new(Self::Float(FloatExpression::CastFromInt(e)));
        let (lhs, rhs) = match (lhs_type, rhs_type) {
            (Type::Int, Type::Float) => (as_float(lhs), rhs),
            (Type::Float, Type::Int) => (lhs, as_float(rhs)),
            (lhs_type, rhs_type) if lhs_type.is_optional() || rhs_type.is_optional() => {
                // only equality is defined when either side may be None
                if !matches!(op, BinaryOperator::Eq | BinaryOperator::Ne)
                    || lhs_type.unoptionalize() != rhs_type.unoptionalize()
                        && *lhs_type != Type::Any
                        && *rhs_type != Type::Any
                {
                    return None;
                }
                (lhs, rhs)
            }
            (Type::Json | Type::Bytes | Type::Array, _)
                if !matches!(op, BinaryOperator::Eq | BinaryOperator::Ne) =>
            {
                return None;
            }
            (lhs_type, rhs_type) if lhs_type == rhs_type => (lhs, rhs),
            _ => return None,
        };
        Some(AnyExpression::Compare(op, lhs, rhs).into())
    }

    /// Cast between declared types; `None` if the conversion is not defined.
    pub fn cast(expr: Arc<Expression>, source: &Type, target: &Type) -> Option<Self> {
        if source == target || *target == Type::Any {
            return Some(AnyExpression::Identity(expr).into());
        }
        let expression = match (source, target.unoptionalize()) {
            (source, target) if source == target => AnyExpression::Identity(expr).into(),
            (Type::Int, Type::Float) => FloatExpression::CastFromInt(expr).into(),
            (Type::Int, Type::Bool) => BoolExpression::CastFromInt(expr).into(),
            (Type::Int, Type::String) => StringExpression::CastFromInt(expr).into(),
            (Type::Float, Type::Int) => IntExpression::CastFromFloat(expr).into(),
            (Type::Float, Type::Bool) => BoolExpression::CastFromFloat(expr).into(),
            (Type::Float, Type::String) => StringExpression::CastFromFloat(expr).into(),
            (Type::Bool, Type::Int) => IntExpression::CastFromBool(expr).into(),
            (Type::Bool, Type::Float) => FloatExpression::CastFromBool(expr).into(),
            (Type::Bool, Type::String) => StringExpression::CastFromBool(expr).into(),
            (Type::String, Type::Int) => IntExpression::CastFromString(expr).into(),
            (Type::String, Type::Float) => FloatExpression::CastFromString(expr).into(),
            (Type::String, Type::Bool) => BoolExpression::CastFromString(expr).into(),
            (Type::Json, target @ (Type::Int | Type::Float | Type::Bool | Type::String)) => {
                AnyExpression::JsonConvert(expr, target.clone()).into()
            }
            _ => return None,
        };
        Some(expression)
    }

    /// Like [`Expression::cast`], but `None` values pass through unchanged.
    pub fn cast_optional(expr: Arc<Expression>, source: &Type, target: &Type) -> Option<Self> {
        if !source.is_optional() || *source == Type::Any {
            return Self::cast(expr, source, target);
        }
        let inner = Self::cast(expr.clone(), source.unoptionalize(), target.unoptionalize())?;
        Some(
            AnyExpression::IfElse(
                Arc::new(BoolExpression::IsNone(expr).into()),
                Arc::new(Self::new_const(Value::None)),
                Arc::new(inner),
            )
            .into(),
        )
    }

    pub fn parse(expr: Arc<Expression>, target: ParseTarget, optional: bool) -> Self {
        AnyExpression::Parse {
            expr,
            target,
            optional,
        }
        .into()
    }

    pub fn date_time_part(expr: Arc<Expression>, part: DateTimePart, type_: &Type) -> Option<Self> {
        match type_ {
            Type::DateTimeNaive | Type::DateTimeUtc => {
                Some(IntExpression::DateTimePart(part, expr).into())
            }
            _ => None,
        }
    }

    pub fn strftime(expr: Arc<Expression>, format: Arc<Expression>, type_: &Type) -> Option<Self> {
        match type_ {
            Type::DateTimeNaive | Type::DateTimeUtc => {
                Some(StringExpression::Strftime(expr, format).into())
            }
            _ => None,
        }
    }

    pub fn duration_in(expr: Arc<Expression>, unit: TimeUnit) -> Self {
        IntExpression::DurationIn(unit, expr).into()
    }

    pub fn get_item(
        expr: Arc<Expression>,
        index: Arc<Expression>,
        default: Option<Arc<Expression>>,
        type_: &Type,
    ) -> Option<Self> {
        let expression = match (type_.unoptionalize(), default) {
            (Type::Json, Some(default)) => {
                AnyExpression::JsonGetItemChecked(expr, index, default).into()
            }
            (Type::Json, None) => AnyExpression::JsonGetItemUnchecked(expr, index).into(),
            (
                Type::Tuple(_) | Type::List(_) | Type::Array | Type::String | Type::Any,
                Some(default),
            ) => AnyExpression::SequenceGetItemChecked(expr, index, default).into(),
            (Type::Tuple(_) | Type::List(_) | Type::Array | Type::String | Type::Any, None) => {
                AnyExpression::SequenceGetItemUnchecked(expr, index).into()
            }
            _ => return None,
        };
        Some(expression)
    }

    pub fn if_else(if_: Arc<Expression>, then: Arc<Expression>, else_: Arc<Expression>) -> Self {
        AnyExpression::IfElse(if_, then, else_).into()
    }
}

impl From<BoolExpression> for Expression {
    fn from(expr: BoolExpression) -> Self {
        Self::Bool(expr)
    }
}

impl From<IntExpression> for Expression {
    fn from(expr: IntExpression) -> Self {
        Self::Int(expr)
    }
}

impl From<FloatExpression> for Expression {
    fn from(expr: FloatExpression) -> Self {
        Self::Float(expr)
    }
}

impl From<PointerExpression> for Expression {
    fn from(expr: PointerExpression) -> Self {
        Self::Pointer(expr)
    }
}

impl From<StringExpression> for Expression {
    fn from(expr: StringExpression) -> Self {
        Self::String(expr)
    }
}

impl From<DateTimeNaiveExpression> for Expression {
    fn from(expr: DateTimeNaiveExpression) -> Self {
        Self::DateTimeNaive(expr)
    }
}

impl From<DateTimeUtcExpression> for Expression {
    fn from(expr: DateTimeUtcExpression) -> Self {
        Self::DateTimeUtc(expr)
    }
}

impl From<DurationExpression> for Expression {
    fn from(expr: DurationExpression) -> Self {
        Self::Duration(expr)
    }
}

impl From<AnyExpression> for Expression {
    fn from(expr: AnyExpression) -> Self {
        Self::Any(expr)
    }
}

/// Fallible constructors for building expressions from declared column
/// types. An undefined operand combination is a graph construction error.
impl Expression {
    pub fn try_unary(op: UnaryOperator, expr: Arc<Expression>, type_: &Type) -> Result<Self> {
        Self::unary(op, expr, type_).ok_or_else(|| Error::unsupported_operation(op, &[type_]))
    }

    pub fn try_binary(
        op: BinaryOperator,
        lhs: Arc<Expression>,
        rhs: Arc<Expression>,
        lhs_type: &Type,
        rhs_type: &Type,
    ) -> Result<Self> {
        Self::binary(op, lhs, rhs, lhs_type, rhs_type)
            .ok_or_else(|| Error::unsupported_operation(op, &[lhs_type, rhs_type]))
    }

    pub fn try_cast(expr: Arc<Expression>, source: &Type, target: &Type) -> Result<Self> {
        let cast = if source.is_optional() {
            Self::cast_optional(expr, source, target)
        } else {
            Self::cast(expr, source, target)
        };
        cast.ok_or_else(|| Error::UnsupportedCast {
            source_type: source.clone(),
            target_type: target.clone(),
        })
    }
}
