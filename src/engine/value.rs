// Copyright © 2024 Pathway

use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::mem::size_of;
use std::ops::Deref;
use std::sync::Arc;

use super::error::{DataError, DynError, DynResult};
use super::time::{DateTime, DateTimeNaive, DateTimeUtc, Duration};

use arcstr::ArcStr;
use itertools::Itertools as _;
use ndarray::ArrayD;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use xxhash_rust::xxh3::Xxh3;

pub type KeyImpl = u128;

/// Low bits of a key that decide which worker owns the row.
pub const SHARD_MASK: KeyImpl = 0xFFFF;

/// Row identity. Derived deterministically from seed values, so the same
/// logical row gets the same key in every run and on every worker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub KeyImpl);

impl Key {
    pub fn for_value(value: &Value) -> Self {
        let mut hasher = KeyHasher::default();
        hasher.write_value(value);
        hasher.finish()
    }

    pub fn for_values(values: &[Value]) -> Self {
        let mut hasher = KeyHasher::default();
        hasher.write_len(values.len());
        for value in values {
            hasher.write_value(value);
        }
        hasher.finish()
    }

    #[must_use]
    pub fn salted_with(self, seed: KeyImpl) -> Self {
        Self(self.0 ^ seed)
    }

    /// Keeps the identity of `self` but moves it to the worker of `other`.
    #[must_use]
    pub fn with_shard_of(self, other: Key) -> Self {
        Self((self.0 & !SHARD_MASK) | (other.0 & SHARD_MASK))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("^")?;
        f.write_str(&base32::encode(
            base32::Alphabet::Crockford,
            &self.0.to_le_bytes(),
        ))
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// How a key generated from column values picks its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPolicy {
    WholeKey,
    /// The last column is an instance; rows of one instance share a worker.
    LastKeyColumn,
}

impl ShardPolicy {
    pub fn from_last_column_is_instance(last_column_is_instance: bool) -> Self {
        if last_column_is_instance {
            Self::LastKeyColumn
        } else {
            Self::WholeKey
        }
    }

    pub fn generate_key(self, values: &[Value]) -> Key {
        let key = Key::for_values(values);
        match (self, values.last()) {
            (Self::LastKeyColumn, Some(instance)) => key.with_shard_of(Key::for_value(instance)),
            _ => key,
        }
    }
}

/// Incremental 128-bit hash of values. Every value starts with its tag, so
/// values of different variants never collide by construction.
#[derive(Default)]
pub struct KeyHasher(Xxh3);

impl KeyHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn write_i64(&mut self, number: i64) {
        self.write(&number.to_le_bytes());
    }

    fn write_len(&mut self, len: usize) {
        self.write(&(len as u64).to_le_bytes());
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.write(bytes);
    }

    #[allow(clippy::float_cmp)]
    fn write_f64(&mut self, number: f64) {
        // all NaNs are one value, and so are both zeros
        let bits = if number.is_nan() {
            u64::MAX
        } else if number == 0.0 {
            0
        } else {
            number.to_bits()
        };
        self.write(&bits.to_le_bytes());
    }

    fn write_shape(&mut self, shape: &[usize]) {
        self.write_len(shape.len());
        for dimension in shape {
            self.write_len(*dimension);
        }
    }

    fn write_value(&mut self, value: &Value) {
        self.write(&[value.tag()]);
        match value {
            Value::None | Value::Error => {}
            Value::Bool(b) => self.write(&[u8::from(*b)]),
            Value::Int(i) => self.write_i64(*i),
            Value::Float(f) => self.write_f64(f.into_inner()),
            Value::Pointer(key) => self.write(&key.0.to_le_bytes()),
            Value::String(s) => self.write_bytes(s.as_bytes()),
            Value::Bytes(b) => self.write_bytes(b),
            Value::Tuple(values) => {
                self.write_len(values.len());
                for value in values.iter() {
                    self.write_value(value);
                }
            }
            Value::IntArray(array) => self.write(&array.digest().0.to_le_bytes()),
            Value::FloatArray(array) => self.write(&array.digest().0.to_le_bytes()),
            Value::Json(json) => self.write(&json.digest().0.to_le_bytes()),
            Value::DateTimeNaive(date_time) => self.write_i64(date_time.timestamp()),
            Value::DateTimeUtc(date_time) => self.write_i64(date_time.timestamp()),
            Value::Duration(duration) => self.write_i64(duration.nanoseconds()),
        }
    }

    fn finish(&self) -> Key {
        Key(self.0.digest128())
    }
}

/// Content that can be stored behind a [`Handle`].
pub trait Fingerprint {
    fn fingerprint(&self, hasher: &mut KeyHasher);
}

impl Fingerprint for ArrayD<i64> {
    fn fingerprint(&self, hasher: &mut KeyHasher) {
        hasher.write_shape(self.shape());
        self.iter().for_each(|element| hasher.write_i64(*element));
    }
}

impl Fingerprint for ArrayD<f64> {
    fn fingerprint(&self, hasher: &mut KeyHasher) {
        hasher.write_shape(self.shape());
        self.iter().for_each(|element| hasher.write_f64(*element));
    }
}

impl Fingerprint for JsonValue {
    fn fingerprint(&self, hasher: &mut KeyHasher) {
        hasher.write_bytes(self.to_string().as_bytes());
    }
}

/// Shared heavy value stored next to the digest of its content.
/// Comparisons and hashing look at the digest only.
pub struct Handle<T>(Arc<(Key, T)>);

impl<T: Fingerprint> Handle<T> {
    fn new(data: T) -> Self {
        let mut hasher = KeyHasher::default();
        data.fingerprint(&mut hasher);
        Self(Arc::new((hasher.finish(), data)))
    }
}

impl<T> Handle<T> {
    fn digest(&self) -> Key {
        self.0 .0
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.digest() == other.digest()
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.digest().cmp(&other.digest())
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u128(self.digest().0);
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0 .1
    }
}

impl<T: Debug> Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl<T: Display> Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl<T: Serialize> Serialize for Handle<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (**self).serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de> + Fingerprint> Deserialize<'de> for Handle<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Handle::new)
    }
}

// Non-self-describing formats cannot read a JSON tree back, so it travels
// as text.
mod json_text {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value as JsonValue;

    use super::Handle;

    pub fn serialize<S: Serializer>(
        json: &Handle<JsonValue>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&**json)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Handle<JsonValue>, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text)
            .map(Handle::new)
            .map_err(D::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Pointer(Key),
    String(ArcStr),
    Bytes(Arc<[u8]>),
    Tuple(Arc<[Self]>),
    IntArray(Handle<ArrayD<i64>>),
    FloatArray(Handle<ArrayD<f64>>),
    DateTimeNaive(DateTimeNaive),
    DateTimeUtc(DateTimeUtc),
    Duration(Duration),
    #[serde(with = "json_text")]
    Json(Handle<JsonValue>),
    Error,
}

const _: () = assert!(size_of::<Value>() <= 32);

/// Generates a typed accessor returning `TypeMismatch` for any other variant.
macro_rules! accessor {
    ($name:ident, $variant:ident, $out:ty, $expected:literal, |$bound:ident| $convert:expr) => {
        pub fn $name(&self) -> DynResult<$out> {
            match self {
                Self::$variant($bound) => Ok($convert),
                _ => Err(self.type_mismatch($expected)),
            }
        }
    };
}

impl Value {
    /// Diffs and counts that do not fit in an `i64` become `None`.
    pub fn from_isize(i: isize) -> Self {
        i64::try_from(i).map_or(Self::None, Self::Int)
    }

    #[cold]
    fn type_mismatch(&self, expected: &'static str) -> DynError {
        DataError::TypeMismatch {
            expected,
            value: self.clone(),
        }
        .into()
    }

    accessor!(as_pointer, Pointer, Key, "pointer", |key| *key);
    accessor!(as_int, Int, i64, "integer", |i| *i);
    accessor!(as_bool, Bool, bool, "bool", |b| *b);
    accessor!(as_float, Float, f64, "float", |f| f.into_inner());
    accessor!(as_ordered_float, Float, OrderedFloat<f64>, "float", |f| *f);
    accessor!(as_string, String, &ArcStr, "string", |s| s);
    accessor!(as_tuple, Tuple, &Arc<[Self]>, "tuple", |t| t);
    accessor!(as_date_time_naive, DateTimeNaive, DateTimeNaive, "DateTimeNaive", |dt| *dt);
    accessor!(as_date_time_utc, DateTimeUtc, DateTimeUtc, "DateTimeUtc", |dt| *dt);
    accessor!(as_duration, Duration, Duration, "Duration", |d| *d);
    accessor!(as_json, Json, &JsonValue, "Json", |json| json);

    /// `None` and `Error` never take part in key matching.
    pub fn is_matchable(&self) -> bool {
        match self {
            Self::None | Self::Error => false,
            Self::Tuple(values) => values.iter().all(Self::is_matchable),
            _ => true,
        }
    }

    // Tags feed into row keys; new variants take the next free number.
    fn tag(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Pointer(_) => 4,
            Self::String(_) => 5,
            Self::Tuple(_) => 6,
            Self::IntArray(_) => 7,
            Self::FloatArray(_) => 8,
            Self::DateTimeNaive(_) => 9,
            Self::DateTimeUtc(_) => 10,
            Self::Duration(_) => 11,
            Self::Bytes(_) => 12,
            Self::Json(_) => 13,
            Self::Error => 14,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{:?}", x.into_inner()),
            Self::Pointer(key) => write!(f, "{key}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "{b:?}"),
            Self::Tuple(values) => write!(f, "({})", values.iter().format(", ")),
            Self::IntArray(array) => write!(f, "{array}"),
            Self::FloatArray(array) => write!(f, "{array}"),
            Self::DateTimeNaive(date_time) => write!(f, "{date_time}"),
            Self::DateTimeUtc(date_time) => write!(f, "{date_time}"),
            Self::Duration(duration) => write!(f, "{duration}"),
            Self::Json(json) => write!(f, "{json}"),
            Self::Error => f.write_str("Error"),
        }
    }
}

macro_rules! value_from {
    ($($source:ty => |$v:ident| $build:expr;)*) => {
        $(impl From<$source> for Value {
            fn from($v: $source) -> Self {
                $build
            }
        })*
    };
}

value_from! {
    bool => |b| Self::Bool(b);
    i64 => |i| Self::Int(i);
    f64 => |f| Self::Float(OrderedFloat(f));
    OrderedFloat<f64> => |f| Self::Float(f);
    Key => |k| Self::Pointer(k);
    &str => |s| Self::String(s.into());
    String => |s| Self::String(s.into());
    ArcStr => |s| Self::String(s);
    &[u8] => |b| Self::Bytes(b.into());
    &[Value] => |t| Self::Tuple(t.into());
    Vec<Value> => |t| Self::Tuple(t.into());
    ArrayD<i64> => |a| Self::IntArray(Handle::new(a));
    ArrayD<f64> => |a| Self::FloatArray(Handle::new(a));
    DateTimeNaive => |dt| Self::DateTimeNaive(dt);
    DateTimeUtc => |dt| Self::DateTimeUtc(dt);
    Duration => |d| Self::Duration(d);
    JsonValue => |json| Self::Json(Handle::new(json));
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        o.map_or(Self::None, Into::into)
    }
}

/// Declared type of a column or expression operand.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    #[default]
    Any,
    Bool,
    Int,
    Float,
    Pointer,
    String,
    Bytes,
    DateTimeNaive,
    DateTimeUtc,
    Duration,
    Array,
    Json,
    Tuple(Arc<[Type]>),
    List(Arc<Type>),
    Optional(Arc<Type>),
}

impl Type {
    pub fn optional(inner: Type) -> Self {
        match inner {
            Self::Optional(_) | Self::Any => inner,
            other => Self::Optional(Arc::new(other)),
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Optional(_) | Self::Any)
    }

    #[must_use]
    pub fn unoptionalize(&self) -> &Self {
        match self {
            Self::Optional(inner) => inner,
            other => other,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _)
            | (Self::Bool, Value::Bool(_))
            | (Self::Int, Value::Int(_))
            | (Self::Float, Value::Float(_))
            | (Self::Pointer, Value::Pointer(_))
            | (Self::String, Value::String(_))
            | (Self::Bytes, Value::Bytes(_))
            | (Self::DateTimeNaive, Value::DateTimeNaive(_))
            | (Self::DateTimeUtc, Value::DateTimeUtc(_))
            | (Self::Duration, Value::Duration(_))
            | (Self::Array, Value::IntArray(_) | Value::FloatArray(_))
            | (Self::Json, Value::Json(_))
            | (Self::Optional(_), Value::None) => true,
            (Self::Optional(inner), value) => inner.matches(value),
            (Self::List(inner), Value::Tuple(values)) => values.iter().all(|v| inner.matches(v)),
            (Self::Tuple(types), Value::Tuple(values)) => {
                types.len() == values.len()
                    && types.iter().zip(values.iter()).all(|(t, v)| t.matches(v))
            }
            _ => false,
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tuple(types) => write!(f, "Tuple[{}]", types.iter().format(", ")),
            Self::List(inner) => write!(f, "List[{inner}]"),
            Self::Optional(inner) => write!(f, "{inner} | None"),
            other => write!(f, "{other:?}"),
        }
    }
}
