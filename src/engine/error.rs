// Copyright © 2024 Pathway

use std::any::Any;
use std::error;
use std::fmt;
use std::result;

use itertools::Itertools as _;

use super::{Key, Type, Value};
use crate::connectors::data_storage::WriteError;
use crate::persistence::PersistenceError;

#[allow(clippy::module_name_repetitions)]
pub type DynError = Box<dyn error::Error + Send + Sync>;
pub type DynResult<T> = result::Result<T, DynError>;

/// Failures of operations on single values. They surface per row and are
/// turned into `Value::Error` or into an engine error, depending on the
/// declared type of the column.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
#[allow(clippy::module_name_repetitions)]
pub enum DataError {
    #[error("type mismatch: expected {expected}, got {value:?}")]
    TypeMismatch {
        expected: &'static str,
        value: Value,
    },

    #[error("index out of bounds")]
    IndexOutOfBounds,

    #[error("key {0:?} missing in JSON object")]
    KeyMissingInJson(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("date time conversion error")]
    DateTimeConversionError,

    #[error("value error: {0}")]
    ValueError(String),

    #[error("value is None")]
    ValueMissing,

    #[error("more than one distinct value passed to the unique reducer")]
    MoreThanOneValueInUniqueReducer,
}

pub type DataResult<T> = result::Result<T, DataError>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("iteration limit too small")]
    IterationLimitTooSmall,

    #[error("invalid universe handle")]
    InvalidUniverseHandle,

    #[error("invalid column handle")]
    InvalidColumnHandle,

    #[error("invalid table handle")]
    InvalidTableHandle,

    #[error("invalid column path")]
    InvalidColumnPath,

    #[error("operation is not supported inside iterate")]
    NotSupportedInIteration,

    #[error("wrong join type")]
    BadJoinType,

    #[error("wrong ix key policy")]
    BadIxKeyPolicy,

    #[error("operator {operator} is not defined for {types}")]
    UnsupportedOperation { operator: String, types: String },

    #[error("cannot cast {source_type} to {target_type}")]
    UnsupportedCast {
        source_type: Type,
        target_type: Type,
    },

    #[error("cannot compute empty intersection")]
    EmptyIntersection,

    #[error("length mismatch")]
    LengthMismatch,

    #[error("different lengths of join condition")]
    DifferentJoinConditionLengths,

    #[error("universe mismatch")]
    UniverseMismatch,

    #[error("universe of an iterated table changed between iterations")]
    IteratedUniverseChanged,

    #[error("key missing in universe: {0}")]
    KeyMissingInUniverse(Key),

    #[error("key missing in output table: {0}")]
    KeyMissingInOutputTable(Key),

    #[error("duplicate key: {0}")]
    DuplicateKey(Key),

    #[error("negative multiplicity for key {0}")]
    NegativeMultiplicity(Key),

    #[error("rows of input {0} went back in time: {1} is before the frontier {2}")]
    InputTimeRegression(String, u64, u64),

    #[error("worker panic: {0}")]
    WorkerPanic(String),

    #[error("dataflow aborted by another worker")]
    Aborted,

    #[error("dataflow error: {0}")]
    Dataflow(String),

    #[error("value error: {0}")]
    ValueError(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("persistent id {0} is assigned, but no persistent storage is configured")]
    NoPersistentStorage(String),

    #[error("writing output failed: {0}")]
    Writer(#[from] WriteError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::engine::dataflow::config::Error),

    #[error(transparent)]
    Other(DynError),

    #[error("{inner}\n{trace}")]
    WithTrace {
        #[source]
        inner: DynError,
        trace: Trace,
    },
}

impl Error {
    pub fn from_panic_payload(panic_payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = match panic_payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(panic_payload) => match panic_payload.downcast::<String>() {
                Ok(message) => *message,
                Err(panic_payload) => format!("{panic_payload:?}"),
            },
        };
        Self::WorkerPanic(message)
    }

    pub fn unsupported_operation(operator: impl fmt::Debug, types: &[&Type]) -> Self {
        Self::UnsupportedOperation {
            operator: format!("{operator:?}"),
            types: types.iter().join(", "),
        }
    }

    pub fn with_trace(error: impl Into<DynError>, trace: Trace) -> Self {
        let inner: DynError = error.into();
        match trace {
            Trace::Empty => Self::from(inner),
            trace => Self::WithTrace { inner, trace },
        }
    }

}

impl From<DynError> for Error {
    fn from(value: DynError) -> Self {
        match value.downcast::<Self>() {
            Ok(this) => *this,
            Err(other) => match other.downcast::<DataError>() {
                Ok(data) => Self::Data(*data),
                Err(other) => Self::Other(other),
            },
        }
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

/// Source location a table or column was created at, attached to errors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Trace {
    Frame {
        line: String,
        file_name: String,
        line_number: u32,
        function: String,
    },
    #[default]
    Empty,
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Frame {
                line,
                file_name,
                line_number,
                function,
            } => write!(
                f,
                "Occurred here:\n \tLine: {line}\n \tFile: {file_name}:{line_number}\n \tFunction: {function}"
            ),
            Self::Empty => write!(f, ""),
        }
    }
}
