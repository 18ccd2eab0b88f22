//! Declared target schema: typed fields, extraction paths, coercions and
//! derived columns.
//!
//! A [`Schema`] is versioned; the version is recorded in every run summary
//! and page archive manifest so that archived runs can be matched to the
//! schema that produced them.

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::IntegrityError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Timestamp,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Timestamp => "timestamp",
        }
    }

    fn admits(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::String, Value::String(_))
                | (Self::Integer, Value::Integer(_))
                | (Self::Float, Value::Float(_))
                | (Self::Timestamp, Value::Timestamp(_))
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value substituted when a field is missing.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    Value(Value),
    /// Start timestamp of the run doing the normalization
    RunStarted,
}

/// Post-parse adjustment applied to a present value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coercion {
    None,
    /// Numeric division, e.g. milliseconds to seconds
    Divide(f64),
    Multiply(f64),
    Trim,
    Uppercase,
}

/// One step of a dotted extraction path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Split `a.b.0.c` into segments; all-digit segments become array indices.
pub fn parse_path(path: &str) -> Vec<PathSegment> {
    path.split('.')
        .map(|seg| match seg.parse::<usize>() {
            Ok(i) if seg.bytes().all(|b| b.is_ascii_digit()) => PathSegment::Index(i),
            _ => PathSegment::Key(seg.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub path: Vec<PathSegment>,
    pub ty: FieldType,
    pub nullable: bool,
    pub default: Option<FieldDefault>,
    pub coercion: Coercion,
}

impl FieldSpec {
    /// Non-nullable field read from `path`.
    pub fn required(name: &str, path: &str, ty: FieldType) -> Self {
        Self {
            name: name.to_string(),
            path: parse_path(path),
            ty,
            nullable: false,
            default: None,
            coercion: Coercion::None,
        }
    }

    pub fn optional(name: &str, path: &str, ty: FieldType) -> Self {
        Self {
            nullable: true,
            ..Self::required(name, path, ty)
        }
    }

    pub fn with_default(mut self, default: FieldDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_coercion(mut self, coercion: Coercion) -> Self {
        self.coercion = coercion;
        self
    }
}

/// How a derived column is computed from already-extracted fields.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedRule {
    /// Text forms joined by `separator`; null if any part is null
    Concat {
        fields: Vec<String>,
        separator: String,
    },
    /// Integer floor to a multiple of `width` (year 1987, width 10 -> 1980)
    Bucket { field: String, width: i64 },
    /// Lookup of the field's text form; null when absent from the table
    Lookup {
        field: String,
        table: BTreeMap<String, String>,
    },
}

impl DerivedRule {
    fn inputs(&self) -> Vec<&str> {
        match self {
            Self::Concat { fields, .. } => fields.iter().map(String::as_str).collect(),
            Self::Bucket { field, .. } | Self::Lookup { field, .. } => vec![field.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedField {
    pub name: String,
    pub rule: DerivedRule,
}

impl DerivedField {
    pub fn ty(&self) -> FieldType {
        match self.rule {
            DerivedRule::Concat { .. } | DerivedRule::Lookup { .. } => FieldType::String,
            DerivedRule::Bucket { .. } => FieldType::Integer,
        }
    }
}

/// Resolved column of a schema, extracted or derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnType {
    pub ty: FieldType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub name: String,
    pub version: u32,
    pub fields: Vec<FieldSpec>,
    pub derived: Vec<DerivedField>,
}

impl Schema {
    pub fn new(name: &str, version: u32) -> Self {
        Self {
            name: name.to_string(),
            version,
            fields: Vec::new(),
            derived: Vec::new(),
        }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn derive(mut self, name: &str, rule: DerivedRule) -> Self {
        self.derived.push(DerivedField {
            name: name.to_string(),
            rule,
        });
        self
    }

    /// Type and nullability of a canonical column (derived columns are nullable).
    pub fn column(&self, name: &str) -> Option<ColumnType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| ColumnType {
                ty: f.ty,
                nullable: f.nullable,
            })
            .or_else(|| {
                self.derived.iter().find(|d| d.name == name).map(|d| ColumnType {
                    ty: d.ty(),
                    nullable: true,
                })
            })
    }

    /// Canonical column names in declaration order, derived last.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.derived.iter().map(|d| d.name.as_str()))
    }

    pub fn validate(&self) -> Result<(), IntegrityError> {
        let invalid = |message: String| IntegrityError::InvalidSchema {
            schema: self.name.clone(),
            message,
        };

        if self.fields.is_empty() {
            return Err(invalid("no fields declared".into()));
        }

        let mut seen = FxHashSet::default();
        for name in self.column_names() {
            if !seen.insert(name) {
                return Err(invalid(format!("duplicate column '{name}'")));
            }
        }

        for f in &self.fields {
            if f.path.is_empty() || f.path == [PathSegment::Key(String::new())] {
                return Err(invalid(format!("field '{}' has an empty path", f.name)));
            }
            if let Some(FieldDefault::Value(v)) = &f.default {
                if v.is_null() && !f.nullable {
                    return Err(invalid(format!(
                        "required field '{}' has a null default",
                        f.name
                    )));
                }
                if !f.ty.admits(v) {
                    return Err(invalid(format!(
                        "default for '{}' is not a {}",
                        f.name, f.ty
                    )));
                }
            }
            if matches!(f.default, Some(FieldDefault::RunStarted)) && f.ty != FieldType::Timestamp
            {
                return Err(invalid(format!(
                    "run-start default on non-timestamp field '{}'",
                    f.name
                )));
            }
            match f.coercion {
                Coercion::Divide(d) | Coercion::Multiply(d) => {
                    if f.ty != FieldType::Float {
                        return Err(invalid(format!(
                            "numeric coercion on {} field '{}'",
                            f.ty, f.name
                        )));
                    }
                    if !d.is_finite() || d == 0.0 {
                        return Err(invalid(format!("bad factor {d} on '{}'", f.name)));
                    }
                }
                Coercion::Trim | Coercion::Uppercase if f.ty != FieldType::String => {
                    return Err(invalid(format!(
                        "string coercion on {} field '{}'",
                        f.ty, f.name
                    )));
                }
                _ => {}
            }
        }

        for d in &self.derived {
            for input in d.rule.inputs() {
                if !self.fields.iter().any(|f| f.name == input) {
                    return Err(invalid(format!(
                        "derived '{}' reads unknown field '{input}'",
                        d.name
                    )));
                }
            }
            if let DerivedRule::Bucket { field, width } = &d.rule {
                if *width <= 0 {
                    return Err(invalid(format!("bucket width for '{}' must be > 0", d.name)));
                }
                if self.column(field).map(|c| c.ty) != Some(FieldType::Integer) {
                    return Err(invalid(format!("bucket source '{field}' is not an integer")));
                }
            }
        }
        Ok(())
    }

    /// Identity schema over this schema's canonical columns.
    ///
    /// Reads canonical NDJSON back in: every column (derived ones included)
    /// becomes a plain top-level field with the same type and nullability,
    /// no defaults, coercions or derivations.
    pub fn replay(&self) -> Schema {
        let mut out = Schema::new(&self.name, self.version);
        for name in self.column_names() {
            // column() resolves every name yielded by column_names()
            let Some(col) = self.column(name) else {
                continue;
            };
            let spec = FieldSpec {
                name: name.to_string(),
                path: vec![PathSegment::Key(name.to_string())],
                ty: col.ty,
                nullable: col.nullable,
                default: None,
                coercion: Coercion::None,
            };
            out.fields.push(spec);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::new("sample", 1)
            .field(FieldSpec::required("id", "id", FieldType::String))
            .field(FieldSpec::required("year", "date", FieldType::Integer))
            .field(
                FieldSpec::optional("secs", "ms", FieldType::Float)
                    .with_coercion(Coercion::Divide(1000.0)),
            )
            .derive(
                "decade",
                DerivedRule::Bucket {
                    field: "year".into(),
                    width: 10,
                },
            )
    }

    #[test]
    fn parse_path_indices() {
        assert_eq!(
            parse_path("track.artists.0.id"),
            vec![
                PathSegment::Key("track".into()),
                PathSegment::Key("artists".into()),
                PathSegment::Index(0),
                PathSegment::Key("id".into()),
            ]
        );
    }

    #[test]
    fn valid_schema_passes() {
        sample().validate().unwrap();
    }

    #[test]
    fn duplicate_column_rejected() {
        let s = sample().field(FieldSpec::required("decade", "d", FieldType::Integer));
        assert!(matches!(
            s.validate(),
            Err(IntegrityError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn divide_on_string_rejected() {
        let s = Schema::new("s", 1).field(
            FieldSpec::required("x", "x", FieldType::String).with_coercion(Coercion::Divide(2.0)),
        );
        assert!(s.validate().is_err());
    }

    #[test]
    fn derived_unknown_input_rejected() {
        let s = Schema::new("s", 1)
            .field(FieldSpec::required("x", "x", FieldType::String))
            .derive(
                "y",
                DerivedRule::Concat {
                    fields: vec!["x".into(), "nope".into()],
                    separator: "_".into(),
                },
            );
        assert!(s.validate().is_err());
    }

    #[test]
    fn mistyped_default_rejected() {
        let s = Schema::new("s", 1).field(
            FieldSpec::optional("x", "x", FieldType::Integer)
                .with_default(FieldDefault::Value(Value::String("0".into()))),
        );
        assert!(s.validate().is_err());
    }

    #[test]
    fn null_default_on_required_field_rejected() {
        let s = Schema::new("s", 1)
            .field(FieldSpec::required("id", "id", FieldType::String))
            .field(
                FieldSpec::required("name", "name", FieldType::String)
                    .with_default(FieldDefault::Value(Value::Null)),
            );
        assert!(matches!(
            s.validate(),
            Err(IntegrityError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn null_default_on_optional_field_allowed() {
        let s = Schema::new("s", 1)
            .field(FieldSpec::required("id", "id", FieldType::String))
            .field(
                FieldSpec::optional("name", "name", FieldType::String)
                    .with_default(FieldDefault::Value(Value::Null)),
            );
        s.validate().unwrap();
    }

    #[test]
    fn derived_columns_are_nullable() {
        let col = sample().column("decade").unwrap();
        assert_eq!(col.ty, FieldType::Integer);
        assert!(col.nullable);
    }

    #[test]
    fn replay_is_identity_over_columns() {
        let replay = sample().replay();
        let names: Vec<_> = replay.column_names().collect();
        assert_eq!(names, ["id", "year", "secs", "decade"]);
        assert!(replay.derived.is_empty());
        assert!(replay.fields.iter().all(|f| f.coercion == Coercion::None));
        assert_eq!(replay.version, 1);
        replay.validate().unwrap();
    }
}
