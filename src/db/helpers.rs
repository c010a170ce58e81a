// ========================================
// helpers.rs - Shared database utilities
// ========================================
// Table/column introspection, SQL quoting and timestamp formatting used by
// the binding, guard and read modules.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};

/// Tables owned by this crate (or by SQLite/sqlx) that can never be bound.
pub const RESERVED_TABLES: [&str; 4] = [
    "capture_log",
    "capture_bindings",
    "capture_session",
    "_sqlx_migrations",
];

pub fn is_reserved_table(table: &str) -> bool {
    RESERVED_TABLES.contains(&table) || table.to_ascii_lowercase().starts_with("sqlite_")
}

/// One column as reported by `pragma_table_xinfo`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TableColumn {
    pub name: String,
    pub decl_type: String,
    /// 1-based position in the primary key, 0 if not part of it.
    pub pk: i64,
    /// 0 = ordinary, 1 = hidden (virtual tables), 2/3 = generated.
    pub hidden: i64,
}

impl TableColumn {
    pub fn is_integer(&self) -> bool {
        self.decl_type.to_ascii_uppercase().contains("INT")
    }

    pub fn is_json(&self) -> bool {
        self.decl_type.to_ascii_uppercase().contains("JSON")
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.hidden, 2 | 3)
    }
}

pub fn column_names(columns: &[TableColumn]) -> Vec<String> {
    columns.iter().map(|c| c.name.clone()).collect()
}

/// Checks whether a table exists in the main schema.
pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, sqlx::Error> {
    let hit: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=? LIMIT 1"
    )
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(hit.is_some())
}

/// Columns of a table in declaration order, generated columns included.
/// Hidden virtual-table columns are skipped; they are not part of a row.
pub async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<TableColumn>, sqlx::Error> {
    sqlx::query_as::<_, TableColumn>(
        "SELECT name, COALESCE(\"type\", '') AS decl_type, pk, hidden
         FROM pragma_table_xinfo(?)
         WHERE hidden != 1
         ORDER BY cid"
    )
        .bind(table)
        .fetch_all(&mut *conn)
        .await
}

/// Ordinary tables in the main schema that are not reserved.
pub async fn user_tables(conn: &mut SqliteConnection) -> Result<Vec<String>, sqlx::Error> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name ASC"
    )
        .fetch_all(&mut *conn)
        .await?;

    Ok(names.into_iter().filter(|n| !is_reserved_table(n)).collect())
}

/// Names of the triggers defined on `table`.
pub async fn existing_triggers(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='trigger' AND tbl_name=? ORDER BY name"
    )
        .bind(table)
        .fetch_all(&mut *conn)
        .await
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quotes a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The text form `capture_log.captured_at` is stored in. Comparisons on the
/// column are textual, so bound timestamps must use exactly this shape.
pub fn sql_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
