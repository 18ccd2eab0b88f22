//! Sink trait and the in-memory sink used for dry runs and tests

use std::collections::BTreeMap;

use crate::error::SinkError;
use crate::layout::BoundEntity;
use crate::split::Row;
use crate::value::{NaturalKey, Value};

/// Transactional batch executor.
///
/// `upsert_batch` is insert-if-absent keyed by the entity's natural key:
/// rows whose key already exists are left untouched, and the return value
/// is the number of rows physically inserted. Implementations must keep at
/// most one row per natural key no matter how often a batch is retried.
pub trait Sink {
    fn begin(&mut self, _entity: &BoundEntity) -> Result<(), SinkError> {
        Ok(())
    }

    fn upsert_batch(&mut self, entity: &BoundEntity, rows: &[Row]) -> Result<usize, SinkError>;

    fn commit(&mut self, _entity: &BoundEntity) -> Result<(), SinkError> {
        Ok(())
    }

    fn rollback(&mut self, _entity: &BoundEntity) -> Result<(), SinkError> {
        Ok(())
    }
}

type Table = BTreeMap<NaturalKey, Vec<Value>>;

/// In-memory tables keyed by natural key.
///
/// Writes outside `begin`/`commit` apply immediately; inside a transaction
/// they are staged and discarded by `rollback`.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: BTreeMap<String, Table>,
    staged: Option<(String, Table)>,
    writes: Vec<(String, usize)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed row count of `entity`.
    pub fn row_count(&self, entity: &str) -> usize {
        self.tables.get(entity).map_or(0, BTreeMap::len)
    }

    pub fn get(&self, entity: &str, key: &NaturalKey) -> Option<&[Value]> {
        self.tables.get(entity)?.get(key).map(Vec::as_slice)
    }

    /// Every `upsert_batch` call as (entity, rows submitted), in call order.
    pub fn writes(&self) -> &[(String, usize)] {
        &self.writes
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

impl Sink for MemorySink {
    fn begin(&mut self, entity: &BoundEntity) -> Result<(), SinkError> {
        if let Some((open, _)) = &self.staged {
            return Err(SinkError::Other(format!(
                "transaction for '{open}' still open"
            )));
        }
        let current = self.tables.get(&entity.name).cloned().unwrap_or_default();
        self.staged = Some((entity.name.clone(), current));
        Ok(())
    }

    fn upsert_batch(&mut self, entity: &BoundEntity, rows: &[Row]) -> Result<usize, SinkError> {
        self.writes.push((entity.name.clone(), rows.len()));
        let table = match &mut self.staged {
            Some((name, table)) if *name == entity.name => table,
            Some((name, _)) => {
                return Err(SinkError::Other(format!(
                    "write to '{}' inside transaction for '{name}'",
                    entity.name
                )))
            }
            None => self.tables.entry(entity.name.clone()).or_default(),
        };
        let mut inserted = 0;
        for row in rows {
            if row.values.len() != entity.columns.len() {
                return Err(SinkError::SchemaDrift {
                    entity: entity.name.clone(),
                    expected: entity.column_names().map(String::from).collect(),
                    found: vec![format!("{} values", row.values.len())],
                });
            }
            if !table.contains_key(&row.key) {
                table.insert(row.key.clone(), row.values.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn commit(&mut self, entity: &BoundEntity) -> Result<(), SinkError> {
        match self.staged.take() {
            Some((name, table)) if name == entity.name => {
                self.tables.insert(name, table);
                Ok(())
            }
            other => {
                self.staged = other;
                Err(SinkError::Other(format!(
                    "commit without transaction for '{}'",
                    entity.name
                )))
            }
        }
    }

    fn rollback(&mut self, _entity: &BoundEntity) -> Result<(), SinkError> {
        self.staged = None;
        Ok(())
    }
}
