// Copyright © 2024 Pathway

use std::any::type_name;
use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::ser::{SerializeMap, Serializer};
use serde_json::{json, Value as JsonValue};

use crate::engine::Value;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FormatterError {
    #[error("expected {expected} values, got {actual}")]
    ColumnCountMismatch { expected: usize, actual: usize },

    #[error("Error value cannot be written out")]
    ErrorValue,

    #[error("separator {0:?} is not a single-byte character")]
    UnsupportedSeparator(char),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Lines produced for a single change. A writer terminates each of them.
#[derive(Debug, Default)]
pub struct Formatted {
    pub lines: Vec<Vec<u8>>,
}

/// Turns one change of an output table into bytes for a writer.
pub trait Formatter: Send {
    fn format(
        &mut self,
        values: &[Value],
        time: u64,
        diff: isize,
    ) -> Result<Formatted, FormatterError>;

    fn short_description(&self) -> Cow<'static, str> {
        type_name::<Self>().into()
    }
}

fn check_width(names: &[String], values: &[Value]) -> Result<(), FormatterError> {
    if names.len() == values.len() {
        Ok(())
    } else {
        Err(FormatterError::ColumnCountMismatch {
            expected: names.len(),
            actual: values.len(),
        })
    }
}

/// JSON rendition of a value. Arrays become `{"shape", "elements"}` objects,
/// bytes are base64 and durations are nanoseconds.
pub fn value_to_json(value: &Value) -> Result<JsonValue, FormatterError> {
    let json = match value {
        Value::None => JsonValue::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f.0),
        Value::Pointer(key) => json!(key.to_string()),
        Value::String(s) => json!(s.as_str()),
        Value::Bytes(bytes) => json!(BASE64.encode(bytes)),
        Value::Tuple(items) => items
            .iter()
            .map(value_to_json)
            .collect::<Result<JsonValue, _>>()?,
        Value::IntArray(array) => json!({
            "shape": array.shape(),
            "elements": array.iter().collect::<Vec<_>>(),
        }),
        Value::FloatArray(array) => json!({
            "shape": array.shape(),
            "elements": array.iter().collect::<Vec<_>>(),
        }),
        Value::DateTimeNaive(dt) => json!(dt.to_string()),
        Value::DateTimeUtc(dt) => json!(dt.to_string()),
        Value::Duration(d) => json!(d.nanoseconds()),
        Value::Json(inner) => (**inner).clone(),
        Value::Error => return Err(FormatterError::ErrorValue),
    };
    Ok(json)
}

/// One JSON object per change: the named columns in order, then `diff` and
/// `time`.
#[derive(Debug)]
pub struct JsonLinesFormatter {
    field_names: Vec<String>,
}

impl JsonLinesFormatter {
    pub fn new(field_names: Vec<String>) -> Self {
        Self { field_names }
    }
}

impl Formatter for JsonLinesFormatter {
    fn format(
        &mut self,
        values: &[Value],
        time: u64,
        diff: isize,
    ) -> Result<Formatted, FormatterError> {
        check_width(&self.field_names, values)?;
        let mut serializer = serde_json::Serializer::new(Vec::new());
        let mut object = serializer.serialize_map(Some(values.len() + 2))?;
        for (name, value) in self.field_names.iter().zip(values) {
            object.serialize_entry(name, &value_to_json(value)?)?;
        }
        object.serialize_entry("diff", &diff)?;
        object.serialize_entry("time", &time)?;
        object.end()?;
        Ok(Formatted {
            lines: vec![serializer.into_inner()],
        })
    }
}

pub struct DsvSettings {
    column_names: Vec<String>,
    separator: char,
}

impl DsvSettings {
    pub fn new(column_names: Vec<String>, separator: char) -> Self {
        Self {
            column_names,
            separator,
        }
    }
}

/// Delimiter-separated values with every field quoted. The header, with
/// `time` and `diff` appended, precedes the first row.
pub struct DsvFormatter {
    settings: DsvSettings,
    header_pending: bool,
}

impl DsvFormatter {
    pub fn new(settings: DsvSettings) -> Self {
        Self {
            settings,
            header_pending: true,
        }
    }

    fn separator(&self) -> Result<u8, FormatterError> {
        u8::try_from(self.settings.separator)
            .map_err(|_| FormatterError::UnsupportedSeparator(self.settings.separator))
    }

    fn field(value: &Value) -> Result<String, FormatterError> {
        Ok(match value {
            Value::String(s) => s.to_string(),
            Value::Bytes(bytes) => BASE64.encode(bytes),
            Value::Duration(d) => d.nanoseconds().to_string(),
            Value::Tuple(_) | Value::IntArray(_) | Value::FloatArray(_) => {
                value_to_json(value)?.to_string()
            }
            Value::Error => return Err(FormatterError::ErrorValue),
            other => other.to_string(),
        })
    }
}

fn dsv_line(
    fields: impl IntoIterator<Item = String>,
    separator: u8,
) -> Result<Vec<u8>, FormatterError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(separator)
        .quote_style(csv::QuoteStyle::Always)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    let mut line = writer
        .into_inner()
        .map_err(|e| FormatterError::Csv(e.into_error().into()))?;
    // the writer adds its own terminator
    line.pop();
    Ok(line)
}

impl Formatter for DsvFormatter {
    fn format(
        &mut self,
        values: &[Value],
        time: u64,
        diff: isize,
    ) -> Result<Formatted, FormatterError> {
        check_width(&self.settings.column_names, values)?;
        let separator = self.separator()?;
        let mut formatted = Formatted::default();
        if self.header_pending {
            let header = self
                .settings
                .column_names
                .iter()
                .cloned()
                .chain(["time".to_string(), "diff".to_string()]);
            formatted.lines.push(dsv_line(header, separator)?);
            self.header_pending = false;
        }
        let mut fields = values.iter().map(Self::field).collect::<Result<Vec<_>, _>>()?;
        fields.extend([time.to_string(), diff.to_string()]);
        formatted.lines.push(dsv_line(fields, separator)?);
        Ok(formatted)
    }
}
