//! Polymorphic attribute values

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::entity::types::BackendType;

/// Formats accepted when reading timestamps back from storage or user input
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttributeValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    DateTime(NaiveDateTime),
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        AttributeValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric view used by `min`/`max` rules
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(value) => Some(*value as f64),
            AttributeValue::Decimal(value) => Some(*value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Null => "null",
            AttributeValue::Text(_) => "text",
            AttributeValue::Integer(_) => "integer",
            AttributeValue::Decimal(_) => "decimal",
            AttributeValue::DateTime(_) => "datetime",
        }
    }

    /// Coerce loosely typed input (configuration defaults, JSON payloads) into the value
    /// shape a backend type stores. Returns `None` when the input cannot represent one.
    pub fn coerce(value: &serde_json::Value, backend_type: BackendType) -> Option<Self> {
        use serde_json::Value as Json;

        if value.is_null() {
            return Some(AttributeValue::Null);
        }

        match backend_type {
            BackendType::Varchar | BackendType::Text => match value {
                Json::String(s) => Some(AttributeValue::Text(s.clone())),
                Json::Number(n) => Some(AttributeValue::Text(n.to_string())),
                Json::Bool(b) => Some(AttributeValue::Text(if *b { "1" } else { "0" }.to_string())),
                _ => None,
            },
            BackendType::Int => match value {
                Json::Number(n) => n.as_i64().map(AttributeValue::Integer),
                Json::String(s) => s.trim().parse().ok().map(AttributeValue::Integer),
                Json::Bool(b) => Some(AttributeValue::Integer(i64::from(*b))),
                _ => None,
            },
            BackendType::Decimal => match value {
                Json::Number(n) => n.as_f64().map(AttributeValue::Decimal),
                Json::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(AttributeValue::Decimal),
                _ => None,
            },
            BackendType::Datetime => match value {
                Json::String(s) => parse_datetime(s).map(AttributeValue::DateTime),
                _ => None,
            },
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => f.write_str("NULL"),
            AttributeValue::Text(value) => f.write_str(value),
            AttributeValue::Integer(value) => write!(f, "{}", value),
            AttributeValue::Decimal(value) => write!(f, "{}", value),
            AttributeValue::DateTime(value) => write!(f, "{}", value.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Decimal(value)
    }
}

impl From<NaiveDateTime> for AttributeValue {
    fn from(value: NaiveDateTime) -> Self {
        AttributeValue::DateTime(value)
    }
}

/// Parse a timestamp as written by either supported database
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coercion_follows_backend_type() {
        assert_eq!(
            AttributeValue::coerce(&json!(42), BackendType::Varchar),
            Some(AttributeValue::text("42"))
        );
        assert_eq!(
            AttributeValue::coerce(&json!("17"), BackendType::Int),
            Some(AttributeValue::Integer(17))
        );
        assert_eq!(AttributeValue::coerce(&json!("abc"), BackendType::Int), None);
        assert_eq!(
            AttributeValue::coerce(&json!("12.5"), BackendType::Decimal),
            Some(AttributeValue::Decimal(12.5))
        );
        assert_eq!(AttributeValue::coerce(&json!([1]), BackendType::Text), None);
        assert_eq!(
            AttributeValue::coerce(&json!(null), BackendType::Datetime),
            Some(AttributeValue::Null)
        );
    }

    #[test]
    fn datetimes_parse_with_and_without_fraction() {
        let plain = parse_datetime("2024-03-01 10:15:00").unwrap();
        let fraction = parse_datetime("2024-03-01 10:15:00.250").unwrap();
        let iso = parse_datetime("2024-03-01T10:15:00").unwrap();

        assert_eq!(plain, iso);
        assert!(fraction > plain);
        assert!(parse_datetime("yesterday").is_none());
    }
}
