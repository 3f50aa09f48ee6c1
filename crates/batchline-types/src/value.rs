//! Typed field values and their declared types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Integer,
    Float,
    String,
    Timestamp,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Timestamp => "timestamp",
        };
        f.write_str(s)
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The runtime type of this value, or `None` for null.
    #[must_use]
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(FieldType::Bool),
            Self::Integer(_) => Some(FieldType::Integer),
            Self::Float(_) => Some(FieldType::Float),
            Self::String(_) => Some(FieldType::String),
            Self::Timestamp(_) => Some(FieldType::Timestamp),
        }
    }

    /// Whether this value conforms to `declared`.
    ///
    /// Numeric widening is allowed (an integer value satisfies a float
    /// field); no implicit string/number coercion.
    #[must_use]
    pub fn conforms_to(&self, declared: FieldType) -> bool {
        match (self, declared) {
            (Self::Null, _) => true,
            (Self::Integer(_), FieldType::Float) => true,
            _ => self.field_type() == Some(declared),
        }
    }

    /// Numeric view of the value, widening integers.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Borrow the string content, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Stable textual form used for uniqueness tracking and key hashing.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Null => "\u{0}null".to_string(),
            Self::Bool(b) => format!("b:{b}"),
            Self::Integer(i) => format!("i:{i}"),
            Self::Float(f) => format!("f:{f}"),
            Self::String(s) => format!("s:{s}"),
            Self::Timestamp(ts) => format!("t:{}", ts.to_rfc3339()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Timestamp(ts) => f.write_str(&ts.to_rfc3339()),
        }
    }
}
