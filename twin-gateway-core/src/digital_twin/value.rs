use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use serde_json::Value;

/// Declared type of a resource value, checked on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Any,
    Boolean,
    Integer,
    Long,
    Float,
    Double,
    String,
    Timestamp,
    Object,
    Array,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert {value} to {expected}")]
pub struct CoercionError {
    pub expected: DataType,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown data type '{0}'")]
pub struct UnknownDataType(pub String);

impl DataType {
    pub const fn as_str(self) -> &'static str {
        match self {
            DataType::Any => "any",
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Long => "long",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Timestamp => "timestamp",
            DataType::Object => "object",
            DataType::Array => "array",
        }
    }

    /// Type given to a dynamically created resource when the update does not
    /// name one.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Null => DataType::Any,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_f64() => DataType::Double,
            Value::Number(_) => DataType::Long,
            Value::String(_) => DataType::String,
            Value::Array(_) => DataType::Array,
            Value::Object(_) => DataType::Object,
        }
    }

    pub fn is_compatible_with(self, other: DataType) -> bool {
        self == other || self == DataType::Any || other == DataType::Any
    }

    /// Checks `value` against this type, converting where the conversion is
    /// lossless (numeric strings, integral floats, epoch millis).
    ///
    /// `null` is accepted by every type.
    pub fn coerce(self, value: Value) -> Result<Value, CoercionError> {
        let fail = |value: Value| CoercionError { expected: self, value };
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (DataType::Any, v) => Ok(v),
            (DataType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (DataType::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(fail(Value::String(s))),
            },
            (DataType::Integer, v) => match integral(&v) {
                Some(n) if i32::try_from(n).is_ok() => Ok(Value::from(n)),
                _ => Err(fail(v)),
            },
            (DataType::Long, v) => match integral(&v) {
                Some(n) => Ok(Value::from(n)),
                None => Err(fail(v)),
            },
            (DataType::Float | DataType::Double, v) => {
                let parsed = match &v {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                match parsed.and_then(serde_json::Number::from_f64) {
                    Some(n) => Ok(Value::Number(n)),
                    None => Err(fail(v)),
                }
            }
            (DataType::String, Value::String(s)) => Ok(Value::String(s)),
            (DataType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (DataType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (DataType::Timestamp, Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
                Ok(ts) => Ok(Value::String(ts.with_timezone(&Utc).to_rfc3339())),
                Err(_) => Err(fail(Value::String(s))),
            },
            (DataType::Timestamp, Value::Number(n)) => {
                match n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
                    Some(ts) => Ok(Value::String(ts.to_rfc3339())),
                    None => Err(fail(Value::Number(n))),
                }
            }
            (DataType::Object, Value::Object(map)) => Ok(Value::Object(map)),
            (DataType::Array, Value::Array(items)) => Ok(Value::Array(items)),
            (_, v) => Err(fail(v)),
        }
    }
}

fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = UnknownDataType;

    /// Accepts the lowercase names as well as the Java class names southbound
    /// adapters tend to send (`java.lang.Integer`, `int`, ...).
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let name = raw.trim();
        let name = name.strip_prefix("java.lang.").unwrap_or(name);
        let name = name.strip_prefix("java.time.").unwrap_or(name);
        let parsed = match name.to_ascii_lowercase().as_str() {
            "any" => DataType::Any,
            "object" | "map" | "json" => DataType::Object,
            "boolean" | "bool" => DataType::Boolean,
            "integer" | "int" | "short" | "byte" => DataType::Integer,
            "long" => DataType::Long,
            "float" => DataType::Float,
            "double" | "number" => DataType::Double,
            "string" | "str" | "char" | "character" => DataType::String,
            "timestamp" | "instant" | "datetime" => DataType::Timestamp,
            "array" | "list" => DataType::Array,
            _ => return Err(UnknownDataType(raw.to_string())),
        };
        Ok(parsed)
    }
}

/// A value and the instant it was observed.
///
/// Unset is `timestamp == None`; a `null` value with a timestamp is a real
/// value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimedValue {
    pub value: Value,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TimedValue {
    pub fn new(value: Value, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp: Some(timestamp) }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none()
    }

    /// Whether a write stamped `timestamp` may replace this value. Equal
    /// timestamps are accepted (last write wins).
    pub fn accepts(&self, timestamp: DateTime<Utc>) -> bool {
        self.timestamp.map_or(true, |current| timestamp >= current)
    }
}
