//! Entity layout: how canonical records decompose into a fact set and the
//! dimension sets it references.

use rustc_hash::FxHashSet;

use crate::error::IntegrityError;
use crate::schema::{FieldType, Schema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Dimension,
    Fact,
}

/// Foreign key: `columns` of this entity reference the natural key of `entity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub entity: String,
}

/// Unbound entity declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySpec {
    pub name: String,
    pub kind: EntityKind,
    pub key: Vec<String>,
    /// (column name, canonical field) pairs in table order
    pub columns: Vec<(String, String)>,
    pub references: Vec<ForeignKey>,
}

impl EntitySpec {
    pub fn dimension(name: &str) -> Self {
        Self::new(name, EntityKind::Dimension)
    }

    pub fn fact(name: &str) -> Self {
        Self::new(name, EntityKind::Fact)
    }

    fn new(name: &str, kind: EntityKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            key: Vec::new(),
            columns: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Natural key columns; each is added as a column if not already present.
    pub fn key(mut self, columns: &[&str]) -> Self {
        for c in columns {
            self.key.push(c.to_string());
            if !self.columns.iter().any(|(name, _)| name == c) {
                self.columns.push((c.to_string(), c.to_string()));
            }
        }
        self
    }

    /// Column named like its canonical field.
    pub fn column(self, name: &str) -> Self {
        self.column_as(name, name)
    }

    pub fn column_as(mut self, column: &str, field: &str) -> Self {
        self.columns.push((column.to_string(), field.to_string()));
        self
    }

    pub fn references(mut self, columns: &[&str], entity: &str) -> Self {
        self.references.push(ForeignKey {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            entity: entity.to_string(),
        });
        self
    }
}

/// One fact entity plus any number of dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityLayout {
    pub entities: Vec<EntitySpec>,
}

impl EntityLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, spec: EntitySpec) -> Self {
        self.entities.push(spec);
        self
    }

    /// Resolve every column against `schema` and check the layout's shape.
    ///
    /// Fails on columns naming undeclared fields (schema drift), duplicate
    /// entity or column names, empty keys, a fact count other than one,
    /// references to undeclared entities, and foreign keys whose column
    /// count differs from the target's key.
    pub fn bind(&self, schema: &Schema) -> Result<BoundLayout, IntegrityError> {
        let shape = |message: String| IntegrityError::LayoutShape { message };

        let facts = self
            .entities
            .iter()
            .filter(|e| e.kind == EntityKind::Fact)
            .count();
        if facts != 1 {
            return Err(shape(format!("expected exactly one fact entity, found {facts}")));
        }

        let mut names = FxHashSet::default();
        for e in &self.entities {
            if !names.insert(e.name.as_str()) {
                return Err(shape(format!("duplicate entity '{}'", e.name)));
            }
        }

        let mut bound = Vec::with_capacity(self.entities.len());
        for e in &self.entities {
            if e.key.is_empty() {
                return Err(shape(format!("entity '{}' has no natural key", e.name)));
            }

            let mut seen = FxHashSet::default();
            let mut columns = Vec::with_capacity(e.columns.len());
            for (name, field) in &e.columns {
                if !seen.insert(name.as_str()) {
                    return Err(shape(format!("duplicate column '{}.{name}'", e.name)));
                }
                let col = schema
                    .column(field)
                    .ok_or_else(|| IntegrityError::UnknownField {
                        entity: e.name.clone(),
                        field: field.clone(),
                    })?;
                columns.push(Column {
                    name: name.clone(),
                    field: field.clone(),
                    ty: col.ty,
                    nullable: col.nullable,
                });
            }

            let position = |col: &str| {
                columns
                    .iter()
                    .position(|c| c.name == col)
                    .ok_or_else(|| IntegrityError::UnknownField {
                        entity: e.name.clone(),
                        field: col.to_string(),
                    })
            };

            let key = e
                .key
                .iter()
                .map(|k| position(k))
                .collect::<Result<Vec<_>, _>>()?;

            let mut references = Vec::with_capacity(e.references.len());
            for fk in &e.references {
                let target = self
                    .entities
                    .iter()
                    .find(|t| t.name == fk.entity)
                    .ok_or_else(|| IntegrityError::UnknownEntity {
                        entity: fk.entity.clone(),
                    })?;
                if target.name == e.name {
                    return Err(IntegrityError::Cycle {
                        entities: vec![e.name.clone()],
                    });
                }
                if fk.columns.len() != target.key.len() {
                    return Err(IntegrityError::KeyArity {
                        entity: e.name.clone(),
                        target: target.name.clone(),
                        expected: target.key.len(),
                        found: fk.columns.len(),
                    });
                }
                references.push(BoundReference {
                    columns: fk
                        .columns
                        .iter()
                        .map(|c| position(c))
                        .collect::<Result<Vec<_>, _>>()?,
                    entity: target.name.clone(),
                });
            }

            // key columns are never null; foreign key columns always may be
            for &k in &key {
                columns[k].nullable = false;
            }
            for r in &references {
                for &c in &r.columns {
                    if !key.contains(&c) {
                        columns[c].nullable = true;
                    }
                }
            }

            bound.push(BoundEntity {
                name: e.name.clone(),
                kind: e.kind,
                columns,
                key,
                references,
            });
        }

        Ok(BoundLayout {
            schema_version: schema.version,
            entities: bound,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub field: String,
    pub ty: FieldType,
    pub nullable: bool,
}

/// Reference resolved to column positions in the owning entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundReference {
    pub columns: Vec<usize>,
    pub entity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundEntity {
    pub name: String,
    pub kind: EntityKind,
    pub columns: Vec<Column>,
    /// Positions of the natural key columns in `columns`
    pub key: Vec<usize>,
    pub references: Vec<BoundReference>,
}

impl BoundEntity {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.key.iter().map(|&i| self.columns[i].name.as_str())
    }
}

/// Layout validated against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundLayout {
    pub schema_version: u32,
    pub entities: Vec<BoundEntity>,
}

impl BoundLayout {
    pub fn entity(&self, name: &str) -> Option<&BoundEntity> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn fact(&self) -> &BoundEntity {
        // bind() guarantees exactly one fact
        self.entities
            .iter()
            .find(|e| e.kind == EntityKind::Fact)
            .unwrap_or(&self.entities[0])
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &BoundEntity> {
        self.entities
            .iter()
            .filter(|e| e.kind == EntityKind::Dimension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;

    fn schema() -> Schema {
        Schema::new("tracks", 1)
            .field(FieldSpec::required("track_id", "id", FieldType::String))
            .field(FieldSpec::required("artist_id", "artist.id", FieldType::String))
            .field(FieldSpec::optional("artist_name", "artist.name", FieldType::String))
    }

    fn layout() -> EntityLayout {
        EntityLayout::new()
            .entity(
                EntitySpec::dimension("artists")
                    .key(&["artist_id"])
                    .column_as("name", "artist_name"),
            )
            .entity(
                EntitySpec::fact("tracks")
                    .key(&["track_id"])
                    .column("artist_id")
                    .references(&["artist_id"], "artists"),
            )
    }

    #[test]
    fn binds_columns_and_types() {
        let bound = layout().bind(&schema()).unwrap();
        let artists = bound.entity("artists").unwrap();
        assert_eq!(artists.column_names().collect::<Vec<_>>(), ["artist_id", "name"]);
        assert_eq!(artists.columns[1].field, "artist_name");
        assert!(!artists.columns[0].nullable);

        let tracks = bound.fact();
        assert_eq!(tracks.name, "tracks");
        assert_eq!(tracks.references[0].columns, vec![1]);
        // required in the schema, but a foreign key may be nulled by the splitter
        assert!(tracks.columns[1].nullable);
        assert_eq!(bound.dimensions().count(), 1);
    }

    #[test]
    fn unknown_field_is_drift() {
        let l = layout().entity(EntitySpec::dimension("albums").key(&["album_id"]));
        assert_eq!(
            l.bind(&schema()),
            Err(IntegrityError::UnknownField {
                entity: "albums".into(),
                field: "album_id".into()
            })
        );
    }

    #[test]
    fn unknown_reference_target() {
        let l = EntityLayout::new().entity(
            EntitySpec::fact("tracks")
                .key(&["track_id"])
                .column("artist_id")
                .references(&["artist_id"], "nobody"),
        );
        assert!(matches!(
            l.bind(&schema()),
            Err(IntegrityError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn key_arity_checked() {
        let l = EntityLayout::new()
            .entity(EntitySpec::dimension("artists").key(&["artist_id", "artist_name"]))
            .entity(
                EntitySpec::fact("tracks")
                    .key(&["track_id"])
                    .column("artist_id")
                    .references(&["artist_id"], "artists"),
            );
        assert!(matches!(
            l.bind(&schema()),
            Err(IntegrityError::KeyArity {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn requires_exactly_one_fact() {
        let l = EntityLayout::new().entity(EntitySpec::dimension("artists").key(&["artist_id"]));
        assert!(matches!(
            l.bind(&schema()),
            Err(IntegrityError::LayoutShape { .. })
        ));
    }

    #[test]
    fn self_reference_is_cycle() {
        let l = EntityLayout::new().entity(
            EntitySpec::fact("tracks")
                .key(&["track_id"])
                .column("artist_id")
                .references(&["artist_id"], "tracks"),
        );
        assert!(matches!(l.bind(&schema()), Err(IntegrityError::Cycle { .. })));
    }
}
