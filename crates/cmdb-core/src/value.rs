//! Tagged-union model for user-defined CI attributes.
//!
//! Attributes are schema-less at the storage layer and validated against a
//! runtime CI type schema. Values deserialize from plain JSON into a closed set
//! of variants so the validator can match on them instead of probing types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute map keyed by attribute name. Ordered for deterministic output.
pub type Attributes = BTreeMap<String, AttrValue>;

/// A single attribute value.
///
/// JSON integers land in `Integer`; numbers with a fractional part or outside
/// the `i64` range land in `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<AttrValue>),
    Object(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value coerced to an integer (floats truncate toward zero).
    pub fn as_coerced_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            _ => None,
        }
    }

    /// Name of the variant as used in type-mismatch diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Integer(_) | Self::Float(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.clone())
    }
}

impl From<serde_json::Value> for AttrValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<AttrValue> for serde_json::Value {
    fn from(value: AttrValue) -> Self {
        match value {
            AttrValue::Null => serde_json::Value::Null,
            AttrValue::Bool(b) => serde_json::Value::Bool(b),
            AttrValue::Integer(i) => serde_json::Value::from(i),
            AttrValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttrValue::String(s) => serde_json::Value::String(s),
            AttrValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            AttrValue::Object(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Convert a JSON object into an attribute map. Non-object input yields `None`.
pub fn attributes_from_json(value: serde_json::Value) -> Option<Attributes> {
    match value {
        serde_json::Value::Object(map) => {
            Some(map.into_iter().map(|(k, v)| (k, AttrValue::from(v))).collect())
        }
        _ => None,
    }
}
