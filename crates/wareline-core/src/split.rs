//! Canonical records → deduplicated entity sets
//!
//! Every entity set keeps the first row seen for each natural key; later
//! rows with the same key are counted and dropped. Dedup uses an
//! `FxHashSet` per entity, so each insert is O(1) amortized.

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::error::IntegrityError;
use crate::layout::{BoundEntity, BoundLayout, Column, EntityKind};
use crate::normalize::{CanonicalRecord, RejectionReason, ValidationError};
use crate::value::{NaturalKey, Value};

/// One entity row: its natural key and cell values in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: NaturalKey,
    pub values: Vec<Value>,
}

/// Rows of one entity, unique by natural key, in first-seen order.
#[derive(Debug, Clone)]
pub struct EntitySet {
    pub name: String,
    pub kind: EntityKind,
    pub columns: Vec<Column>,
    rows: Vec<Row>,
    seen: FxHashSet<NaturalKey>,
}

impl EntitySet {
    pub fn new(entity: &BoundEntity) -> Self {
        Self {
            name: entity.name.clone(),
            kind: entity.kind,
            columns: entity.columns.clone(),
            rows: Vec::new(),
            seen: FxHashSet::default(),
        }
    }

    /// Insert unless the key was already seen. Returns whether it was new.
    pub fn insert(&mut self, row: Row) -> bool {
        if self.seen.contains(&row.key) {
            return false;
        }
        self.seen.insert(row.key.clone());
        self.rows.push(row);
        true
    }

    pub fn contains(&self, key: &NaturalKey) -> bool {
        self.seen.contains(key)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// All entity sets of a run, in layout declaration order.
#[derive(Debug, Clone, Default)]
pub struct EntitySets {
    sets: Vec<EntitySet>,
}

impl EntitySets {
    pub fn new(layout: &BoundLayout) -> Self {
        Self {
            sets: layout.entities.iter().map(EntitySet::new).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&EntitySet> {
        self.sets.iter().find(|s| s.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut EntitySet> {
        self.sets.iter_mut().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySet> {
        self.sets.iter()
    }

    /// Check that every non-null foreign key resolves to a row of its target set.
    pub fn verify_references(&self, layout: &BoundLayout) -> Result<(), IntegrityError> {
        for entity in &layout.entities {
            let Some(set) = self.get(&entity.name) else {
                continue;
            };
            for reference in &entity.references {
                let target = self
                    .get(&reference.entity)
                    .ok_or_else(|| IntegrityError::UnknownEntity {
                        entity: reference.entity.clone(),
                    })?;
                for row in set.rows() {
                    let values = reference.columns.iter().map(|&c| &row.values[c]);
                    // null foreign keys are allowed (flagged facts)
                    let Some(key) = NaturalKey::from_values(values) else {
                        continue;
                    };
                    if !target.contains(&key) {
                        return Err(IntegrityError::DanglingReference {
                            entity: entity.name.clone(),
                            target: reference.entity.clone(),
                            key: key.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SplitStats {
    pub records: usize,
    pub rejected: usize,
    pub duplicate_facts: usize,
    pub duplicate_dimensions: usize,
    /// Facts whose foreign keys were nulled because a dimension key was null
    pub flagged_facts: usize,
}

/// Streaming splitter: feed records in order, then [`EntitySplitter::finish`].
pub struct EntitySplitter<'a> {
    layout: &'a BoundLayout,
    sets: EntitySets,
    stats: SplitStats,
    rejections: Vec<ValidationError>,
}

fn project(entity: &BoundEntity, record: &CanonicalRecord) -> Vec<Value> {
    entity
        .columns
        .iter()
        .map(|c| record.get(&c.field).clone())
        .collect()
}

fn row_key(entity: &BoundEntity, values: &[Value]) -> Option<NaturalKey> {
    NaturalKey::from_values(entity.key.iter().map(|&i| &values[i]))
}

impl<'a> EntitySplitter<'a> {
    pub fn new(layout: &'a BoundLayout) -> Self {
        Self {
            layout,
            sets: EntitySets::new(layout),
            stats: SplitStats::default(),
            rejections: Vec::new(),
        }
    }

    /// Split one record. `index` numbers the record for rejection reports.
    pub fn push(&mut self, index: usize, record: &CanonicalRecord) {
        self.stats.records += 1;
        let layout = self.layout;
        let fact = layout.fact();

        let mut fact_values = project(fact, record);
        let Some(fact_key) = row_key(fact, &fact_values) else {
            self.stats.rejected += 1;
            self.rejections.push(ValidationError {
                index,
                reason: RejectionReason::NullKey {
                    entity: fact.name.clone(),
                },
            });
            return;
        };

        // a duplicate fact contributes nothing, not even dimension rows
        if self
            .sets
            .get(&fact.name)
            .is_some_and(|s| s.contains(&fact_key))
        {
            self.stats.duplicate_facts += 1;
            return;
        }

        let mut dims = Vec::new();
        let mut null_dims = Vec::new();
        for dim in layout.dimensions() {
            let values = project(dim, record);
            match row_key(dim, &values) {
                Some(key) => dims.push((dim.name.as_str(), Row { key, values })),
                None => null_dims.push(dim.name.as_str()),
            }
        }

        let mut flagged = false;
        for reference in &fact.references {
            if null_dims.contains(&reference.entity.as_str()) {
                for &c in &reference.columns {
                    fact_values[c] = Value::Null;
                }
                flagged = true;
            }
        }
        if flagged {
            self.stats.flagged_facts += 1;
        }

        for (name, row) in dims {
            if let Some(set) = self.sets.get_mut(name) {
                if !set.insert(row) {
                    self.stats.duplicate_dimensions += 1;
                }
            }
        }

        if let Some(set) = self.sets.get_mut(&fact.name) {
            set.insert(Row {
                key: fact_key,
                values: fact_values,
            });
        }
    }

    pub fn finish(self) -> SplitOutput {
        SplitOutput {
            sets: self.sets,
            stats: self.stats,
            rejections: self.rejections,
        }
    }
}

#[derive(Debug)]
pub struct SplitOutput {
    pub sets: EntitySets,
    pub stats: SplitStats,
    pub rejections: Vec<ValidationError>,
}

/// Split a whole record sequence; record indices start at 0.
pub fn split_records(layout: &BoundLayout, records: &[CanonicalRecord]) -> SplitOutput {
    let mut splitter = EntitySplitter::new(layout);
    for (i, record) in records.iter().enumerate() {
        splitter.push(i, record);
    }
    splitter.finish()
}
