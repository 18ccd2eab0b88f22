//! wareline-duckdb: DuckDB warehouse sink
//!
//! One table per entity, keyed by its natural key. Batches are written as
//! multi-row `INSERT … ON CONFLICT DO NOTHING`, so replaying a batch never
//! creates a second row for a key.

mod sql;

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use duckdb::types::{TimeUnit, Value as DbValue};
use duckdb::{params_from_iter, Connection};
use wareline_core::{BoundEntity, BoundLayout, Row, Sink, SinkError, Value};

pub struct DuckDbSink {
    conn: Connection,
    /// Entities whose table exists and matches the layout
    checked: BTreeSet<String>,
    in_tx: bool,
}

impl DuckDbSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open warehouse {}", path.display()))?;
        log::debug!("Opened warehouse {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open DuckDB in-memory connection")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            checked: BTreeSet::new(),
            in_tx: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Create missing tables and check existing ones against the layout.
    pub fn ensure_tables(&mut self, layout: &BoundLayout) -> Result<(), SinkError> {
        for entity in &layout.entities {
            self.ensure_table(entity)?;
        }
        Ok(())
    }

    fn ensure_table(&mut self, entity: &BoundEntity) -> Result<(), SinkError> {
        if self.checked.contains(&entity.name) {
            return Ok(());
        }
        let found = self.table_columns(&entity.name)?;
        if found.is_empty() {
            log::info!("Creating table {}", entity.name);
            self.conn
                .execute_batch(&sql::create_table(entity))
                .map_err(sink_error)?;
        } else {
            let expected = sql::expected_columns(entity);
            if found != expected {
                return Err(SinkError::SchemaDrift {
                    entity: entity.name.clone(),
                    expected,
                    found,
                });
            }
        }
        self.checked.insert(entity.name.clone());
        Ok(())
    }

    /// `name TYPE` of each existing column; empty when the table is absent.
    fn table_columns(&self, table: &str) -> Result<Vec<String>, SinkError> {
        let mut stmt = self
            .conn
            .prepare(sql::existing_columns())
            .map_err(sink_error)?;
        let rows = stmt
            .query_map([table], |row| {
                let name: String = row.get(0)?;
                let ty: String = row.get(1)?;
                Ok(format!("{name} {}", ty.to_uppercase()))
            })
            .map_err(sink_error)?;
        let columns = rows.collect::<Result<Vec<_>, _>>().map_err(sink_error)?;
        Ok(columns)
    }

    pub fn row_count(&self, entity: &str) -> Result<usize, SinkError> {
        let n: i64 = self
            .conn
            .query_row(&sql::count_rows(entity), [], |row| row.get(0))
            .map_err(sink_error)?;
        Ok(n as usize)
    }
}

impl Sink for DuckDbSink {
    fn begin(&mut self, entity: &BoundEntity) -> Result<(), SinkError> {
        self.ensure_table(entity)?;
        self.conn
            .execute_batch("BEGIN TRANSACTION")
            .map_err(sink_error)?;
        self.in_tx = true;
        Ok(())
    }

    fn upsert_batch(&mut self, entity: &BoundEntity, rows: &[Row]) -> Result<usize, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.ensure_table(entity)?;

        // Inserted = growth of the table
        let before = self.row_count(&entity.name)?;
        let params = rows
            .iter()
            .flat_map(|row| row.values.iter().map(to_db_value));
        self.conn
            .execute(&sql::insert_ignore(entity, rows.len()), params_from_iter(params))
            .map_err(sink_error)?;
        let after = self.row_count(&entity.name)?;
        Ok(after.saturating_sub(before))
    }

    fn commit(&mut self, _entity: &BoundEntity) -> Result<(), SinkError> {
        if self.in_tx {
            self.in_tx = false;
            self.conn.execute_batch("COMMIT").map_err(sink_error)?;
        }
        Ok(())
    }

    fn rollback(&mut self, _entity: &BoundEntity) -> Result<(), SinkError> {
        if self.in_tx {
            self.in_tx = false;
            self.conn.execute_batch("ROLLBACK").map_err(sink_error)?;
        }
        Ok(())
    }
}

fn to_db_value(value: &Value) -> DbValue {
    match value {
        Value::Null => DbValue::Null,
        Value::String(s) => DbValue::Text(s.clone()),
        Value::Integer(i) => DbValue::BigInt(*i),
        Value::Float(f) => DbValue::Double(*f),
        Value::Timestamp(ts) => DbValue::Timestamp(TimeUnit::Microsecond, ts.timestamp_micros()),
    }
}

fn sink_error(e: duckdb::Error) -> SinkError {
    let msg = e.to_string();
    if msg.contains("Constraint Error") {
        SinkError::Constraint(msg)
    } else if msg.contains("IO Error") || msg.contains("Connection Error") {
        SinkError::Connection(msg)
    } else {
        SinkError::Other(msg)
    }
}
