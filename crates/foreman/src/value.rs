//! Scalar values shared by command arguments and configuration entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::time::Duration;

/// A typed scalar: the value space of parsed command parameters and of
/// configuration entries.
///
/// Deserialization is untagged, so JSON `true`, `3`, `0.5` and `"x"` map to
/// `Bool`, `Int`, `Float` and `String` respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    /// Coerce a raw textual token into the most specific scalar.
    ///
    /// Case-insensitive boolean literals win first (`true/yes/on/1`,
    /// `false/no/off/0`), then integers, then finite floats; anything else
    /// stays a string.
    pub fn coerce(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => return Self::Bool(true),
            "false" | "no" | "off" | "0" => return Self::Bool(false),
            _ => {}
        }

        if let Ok(n) = raw.parse::<i64>() {
            return Self::Int(n);
        }

        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => Self::Float(f),
            _ => Self::String(raw.to_string()),
        }
    }

    /// Convert a JSON value into a scalar. Arrays, objects and null have no
    /// scalar form.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(n) => Value::from(*n),
            Self::Float(f) => Value::from(*f),
            Self::String(s) => Value::String(s.clone()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Equality that compares numbers by value, so `Int(1)` and
    /// `Float(1.0)` are the same setting.
    pub fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            _ => self == other,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => b.fmt(f),
            Self::Int(n) => n.fmt(f),
            Self::Float(x) => x.fmt(f),
            Self::String(s) => s.fmt(f),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        value.to_json()
    }
}

/// Render a JSON value as plain text: strings without quotes, everything
/// else in its JSON form.
pub(crate) fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A timeout given in seconds. Zero, negative and NaN mean "no timeout
/// given"; values too large for a `Duration` saturate to `Duration::MAX`.
pub(crate) fn secs_to_duration(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs <= 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
