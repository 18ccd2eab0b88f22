//! SQL generation for warehouse tables derived from the entity layout.

use wareline_core::{BoundEntity, FieldType};

/// Double-quote an identifier.
pub fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// DuckDB column type for a field type, as reported by `information_schema`.
pub fn column_type(ty: FieldType) -> &'static str {
    match ty {
        FieldType::String => "VARCHAR",
        FieldType::Integer => "BIGINT",
        FieldType::Float => "DOUBLE",
        FieldType::Timestamp => "TIMESTAMP",
    }
}

/// `name TYPE` for each declared column, in declaration order.
pub fn expected_columns(entity: &BoundEntity) -> Vec<String> {
    entity
        .columns
        .iter()
        .map(|c| format!("{} {}", c.name, column_type(c.ty)))
        .collect()
}

/// CREATE TABLE with the natural key as primary key.
///
/// Foreign keys are not declared: load order and the splitter's reference
/// check keep them consistent.
pub fn create_table(entity: &BoundEntity) -> String {
    let mut defs: Vec<String> = entity
        .columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{null}", ident(&c.name), column_type(c.ty))
        })
        .collect();
    let key: Vec<String> = entity.key_names().map(ident).collect();
    defs.push(format!("PRIMARY KEY ({})", key.join(", ")));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        ident(&entity.name),
        defs.join(", ")
    )
}

/// Multi-row insert that leaves rows with an existing key untouched.
pub fn insert_ignore(entity: &BoundEntity, rows: usize) -> String {
    let cols: Vec<String> = entity.column_names().map(ident).collect();
    let placeholders = format!("({})", vec!["?"; cols.len()].join(", "));
    let values = vec![placeholders; rows].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES {values} ON CONFLICT DO NOTHING",
        ident(&entity.name),
        cols.join(", ")
    )
}

pub fn existing_columns() -> &'static str {
    "SELECT column_name, data_type FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = ? \
     ORDER BY ordinal_position"
}

pub fn count_rows(entity: &str) -> String {
    format!("SELECT count(*) FROM {}", ident(entity))
}
