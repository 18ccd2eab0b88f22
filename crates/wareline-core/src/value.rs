//! Typed scalar values carried by canonical records and entity rows

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

/// A single typed cell. `Null` only appears in nullable positions.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    /// UTC instant. Canonical NDJSON and the warehouse both keep
    /// microsecond precision; finer digits are truncated.
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// JSON form used by the NDJSON intermediate format.
    /// Timestamps are RFC 3339 with microsecond precision.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Timestamp(ts) => serde_json::Value::String(format_timestamp(ts)),
        }
    }

    /// Text form used inside natural keys; `None` for null.
    pub fn key_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s.clone()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Timestamp(ts) => Some(format_timestamp(ts)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Timestamp(ts) => f.write_str(&format_timestamp(ts)),
        }
    }
}

/// RFC 3339 with exactly six fractional digits.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Natural key of an entity row: the text form of each key column.
///
/// Keys never contain nulls; [`NaturalKey::from_values`] refuses them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<Self> {
        values
            .into_iter()
            .map(Value::key_text)
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_refuses_nulls() {
        let values = [Value::String("a".into()), Value::Null];
        assert!(NaturalKey::from_values(&values).is_none());
    }

    #[test]
    fn composite_key_display() {
        let values = [Value::String("EG".into()), Value::Integer(2020)];
        let key = NaturalKey::from_values(&values).unwrap();
        assert_eq!(key.to_string(), "EG|2020");
        assert_eq!(key.parts().len(), 2);
    }

    #[test]
    fn timestamp_json_is_rfc3339() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(
            Value::Timestamp(ts).to_json(),
            serde_json::json!("2024-03-01T12:30:00.000000Z")
        );
    }

    #[test]
    fn timestamp_keeps_microseconds() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        assert_eq!(format_timestamp(&ts), "2024-03-01T12:30:00.123456Z");
    }

    #[test]
    fn non_finite_float_serializes_as_null() {
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
    }
}
