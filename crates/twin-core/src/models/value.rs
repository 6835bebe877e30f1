//! Property value classification and numeric coercion

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// A feature property value, classified by JSON type.
///
/// Numbers keep the distinction between float-typed and integer-typed JSON
/// numbers because coercion treats them differently.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Float(f64),
    Integer(i128),
    String(String),
    Bool(bool),
    Object(Map<String, Value>),
    Array(Vec<Value>),
    Null,
}

/// Why a property value could not become a sample value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoercionError {
    #[error("string value {0:?} is not a number")]
    Unparseable(String),

    #[error("value {0} is not finite")]
    NonFinite(String),

    #[error("unsupported value type: {0}")]
    Unsupported(&'static str),
}

impl PropertyValue {
    /// Short name of the JSON type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Float(_) => "float",
            PropertyValue::Integer(_) => "integer",
            PropertyValue::String(_) => "string",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Object(_) => "object",
            PropertyValue::Array(_) => "array",
            PropertyValue::Null => "null",
        }
    }

    /// Coerce to a 64-bit float.
    ///
    /// Precedence: float numbers as-is, integers widened, strings parsed,
    /// everything else rejected. Parsed strings must be finite.
    pub fn to_f64(&self) -> Result<f64, CoercionError> {
        match self {
            PropertyValue::Float(f) => Ok(*f),
            PropertyValue::Integer(i) => Ok(*i as f64),
            PropertyValue::String(s) => {
                let parsed: f64 = s
                    .parse()
                    .map_err(|_| CoercionError::Unparseable(s.clone()))?;
                if parsed.is_finite() {
                    Ok(parsed)
                } else {
                    Err(CoercionError::NonFinite(s.clone()))
                }
            }
            other => Err(CoercionError::Unsupported(other.kind())),
        }
    }
}

impl From<&Value> for PropertyValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Number(n) => classify_number(n),
            Value::String(s) => PropertyValue::String(s.clone()),
            Value::Bool(b) => PropertyValue::Bool(*b),
            Value::Object(o) => PropertyValue::Object(o.clone()),
            Value::Array(a) => PropertyValue::Array(a.clone()),
            Value::Null => PropertyValue::Null,
        }
    }
}

fn classify_number(n: &Number) -> PropertyValue {
    if let Some(i) = n.as_i64() {
        PropertyValue::Integer(i as i128)
    } else if let Some(u) = n.as_u64() {
        PropertyValue::Integer(u as i128)
    } else {
        // serde_json only yields non-integers as f64
        PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}
