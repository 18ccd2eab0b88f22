//! Raw record → canonical record normalization
//!
//! [`RecordNormalizer`] is pure: it reads the declared [`Schema`], the raw
//! record and the run start timestamp, and nothing else. Records that do
//! not satisfy the schema are rejected with a [`RejectionReason`], never
//! coerced to null.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::schema::{
    Coercion, DerivedRule, FieldDefault, FieldSpec, FieldType, PathSegment, Schema,
};
use crate::value::Value;

/// Untyped record as received from a source.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    MissingField {
        field: String,
    },
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: &'static str,
    },
    InvalidTimestamp {
        field: String,
        value: String,
    },
    InvalidNumber {
        field: String,
        value: String,
    },
    /// Natural key of the fact entity is null
    NullKey {
        entity: String,
    },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing required field '{field}'"),
            Self::TypeMismatch {
                field,
                expected,
                found,
            } => write!(f, "field '{field}': expected {expected}, found {found}"),
            Self::InvalidTimestamp { field, value } => {
                write!(f, "field '{field}': invalid timestamp '{value}'")
            }
            Self::InvalidNumber { field, value } => {
                write!(f, "field '{field}': invalid number '{value}'")
            }
            Self::NullKey { entity } => write!(f, "null natural key for '{entity}'"),
        }
    }
}

/// A rejected record: its position in the run's record stream and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub index: usize,
    #[serde(flatten)]
    pub reason: RejectionReason,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {}: {}", self.index, self.reason)
    }
}

impl std::error::Error for ValidationError {}

/// Flat record conforming to a schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRecord(BTreeMap<String, Value>);

impl CanonicalRecord {
    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.0.get(field).unwrap_or(&NULL)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// Normalized page: surviving records in input order plus rejections.
#[derive(Debug, Default)]
pub struct NormalizedPage {
    pub records: Vec<CanonicalRecord>,
    /// Run-wide index of each surviving record
    pub indices: Vec<usize>,
    pub rejections: Vec<ValidationError>,
}

pub struct RecordNormalizer {
    schema: Arc<Schema>,
    run_started: DateTime<Utc>,
}

impl RecordNormalizer {
    pub fn new(schema: Arc<Schema>, run_started: DateTime<Utc>) -> Self {
        Self {
            schema,
            run_started,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecord, RejectionReason> {
        let mut out = CanonicalRecord::default();
        for spec in &self.schema.fields {
            let value = match lookup(raw, &spec.path) {
                Some(json) => coerce(spec, json)?,
                None => None,
            };
            let value = match value {
                Some(v) => v,
                None => self.missing(spec)?,
            };
            out.insert(spec.name.clone(), value);
        }
        for derived in &self.schema.derived {
            let value = derive(&derived.rule, &out);
            out.insert(derived.name.clone(), value);
        }
        Ok(out)
    }

    /// Normalize a page in parallel, keeping input order.
    ///
    /// `first_index` is the run-wide index of `raws[0]`, used to number
    /// rejections.
    pub fn normalize_page(&self, first_index: usize, raws: &[RawRecord]) -> NormalizedPage {
        let results: Vec<_> = raws.par_iter().map(|raw| self.normalize(raw)).collect();

        let mut page = NormalizedPage::default();
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(record) => {
                    page.records.push(record);
                    page.indices.push(first_index + i);
                }
                Err(reason) => page.rejections.push(ValidationError {
                    index: first_index + i,
                    reason,
                }),
            }
        }
        page
    }

    fn missing(&self, spec: &FieldSpec) -> Result<Value, RejectionReason> {
        match &spec.default {
            Some(FieldDefault::Value(v)) => Ok(v.clone()),
            Some(FieldDefault::RunStarted) => Ok(Value::Timestamp(self.run_started)),
            None if spec.nullable => Ok(Value::Null),
            None => Err(RejectionReason::MissingField {
                field: spec.name.clone(),
            }),
        }
    }
}

fn lookup<'a>(raw: &'a RawRecord, path: &[PathSegment]) -> Option<&'a serde_json::Value> {
    let (first, rest) = path.split_first()?;
    let mut current = match first {
        PathSegment::Key(k) => raw.get(k)?,
        PathSegment::Index(i) => raw.get(&i.to_string())?,
    };
    for seg in rest {
        current = match (seg, current) {
            (PathSegment::Key(k), serde_json::Value::Object(map)) => map.get(k)?,
            (PathSegment::Index(i), serde_json::Value::Array(items)) => items.get(*i)?,
            (PathSegment::Index(i), serde_json::Value::Object(map)) => map.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Coerce a present JSON value; `Ok(None)` means the value counts as missing.
fn coerce(spec: &FieldSpec, json: &serde_json::Value) -> Result<Option<Value>, RejectionReason> {
    use serde_json::Value as J;

    let mismatch = || RejectionReason::TypeMismatch {
        field: spec.name.clone(),
        expected: spec.ty,
        found: json_kind(json),
    };
    let bad_number = |text: String| RejectionReason::InvalidNumber {
        field: spec.name.clone(),
        value: text,
    };

    let text = match json {
        J::Null => return Ok(None),
        J::Array(_) | J::Object(_) => return Err(mismatch()),
        J::String(s) => {
            let s = match spec.coercion {
                Coercion::Trim => s.trim().to_string(),
                Coercion::Uppercase => s.to_uppercase(),
                _ => s.clone(),
            };
            if s.trim().is_empty() {
                return Ok(None);
            }
            Some(s)
        }
        _ => None,
    };

    let value = match spec.ty {
        FieldType::String => match (text, json) {
            (Some(s), _) => Value::String(s),
            (None, J::Number(n)) => Value::String(n.to_string()),
            (None, J::Bool(b)) => Value::String(b.to_string()),
            _ => return Err(mismatch()),
        },
        FieldType::Integer => match (text, json) {
            (Some(s), _) => Value::Integer(parse_integer(s.trim()).ok_or_else(|| bad_number(s))?),
            (None, J::Number(n)) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Value::Integer(f as i64)
                    }
                    _ => return Err(bad_number(n.to_string())),
                },
            },
            _ => return Err(mismatch()),
        },
        FieldType::Float => {
            let f = match (text, json) {
                (Some(s), _) => match s.trim().parse::<f64>() {
                    Ok(f) => f,
                    Err(_) => return Err(bad_number(s)),
                },
                (None, J::Number(n)) => n.as_f64().ok_or_else(|| bad_number(n.to_string()))?,
                _ => return Err(mismatch()),
            };
            let f = match spec.coercion {
                Coercion::Divide(d) => f / d,
                Coercion::Multiply(m) => f * m,
                _ => f,
            };
            if !f.is_finite() {
                return Err(bad_number(f.to_string()));
            }
            Value::Float(f)
        }
        FieldType::Timestamp => {
            let parsed = match (text, json) {
                (Some(s), _) => parse_timestamp(s.trim()).ok_or(RejectionReason::InvalidTimestamp {
                    field: spec.name.clone(),
                    value: s,
                })?,
                (None, J::Number(n)) => n
                    .as_i64()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .ok_or_else(|| RejectionReason::InvalidTimestamp {
                        field: spec.name.clone(),
                        value: n.to_string(),
                    })?,
                _ => return Err(mismatch()),
            };
            Value::Timestamp(parsed)
        }
    };
    Ok(Some(value))
}

fn parse_integer(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().or_else(|| {
        s.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

/// RFC 3339, naive `T`/space separated datetimes (UTC), plain dates, or
/// epoch seconds.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn derive(rule: &DerivedRule, record: &CanonicalRecord) -> Value {
    match rule {
        DerivedRule::Concat { fields, separator } => fields
            .iter()
            .map(|f| record.get(f).key_text())
            .collect::<Option<Vec<_>>>()
            .map_or(Value::Null, |parts| Value::String(parts.join(separator))),
        DerivedRule::Bucket { field, width } => match record.get(field).as_i64() {
            Some(v) if *width > 0 => Value::Integer(v.div_euclid(*width) * width),
            _ => Value::Null,
        },
        DerivedRule::Lookup { field, table } => record
            .get(field)
            .key_text()
            .and_then(|k| table.get(&k))
            .map_or(Value::Null, |v| Value::String(v.clone())),
    }
}
