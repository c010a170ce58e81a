// ========================================
// registry.rs - In-memory binding registry
// ========================================
// Mirrors `capture_bindings` so that bound/unbound checks do not re-read
// the database on every call.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::RwLock;

use crate::error::{CaptureError, Result};
use crate::model::Binding;

/// Thread-safe table_name -> binding map.
pub type BindingRegistry = Arc<RwLock<HashMap<String, Binding>>>;

#[derive(Debug, FromRow)]
pub(crate) struct BindingRow {
    pub table_name: String,
    pub identity_column: String,
    pub capture_mode: String,
    pub columns_fingerprint: String,
    pub bound_at: DateTime<Utc>,
}

impl TryFrom<BindingRow> for Binding {
    type Error = CaptureError;

    fn try_from(row: BindingRow) -> Result<Self> {
        let columns: Vec<String> = serde_json::from_str(&row.columns_fingerprint)?;
        Ok(Binding {
            table_name: row.table_name,
            identity_column: row.identity_column,
            mode: row.capture_mode.parse()?,
            columns,
            bound_at: row.bound_at,
        })
    }
}

/// Empty registry, filled by `fetch_bindings_from_db` on connect.
pub fn create_empty_registry() -> BindingRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

pub async fn fetch_bindings_from_db(pool: &SqlitePool) -> Result<HashMap<String, Binding>> {
    let rows = sqlx::query_as::<_, BindingRow>(
        "SELECT table_name, identity_column, capture_mode, columns_fingerprint, bound_at
         FROM capture_bindings
         ORDER BY table_name ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut bindings = HashMap::with_capacity(rows.len());
    for row in rows {
        let binding = Binding::try_from(row)?;
        bindings.insert(binding.table_name.clone(), binding);
    }

    Ok(bindings)
}

pub async fn lookup(registry: &BindingRegistry, table: &str) -> Option<Binding> {
    registry.read().await.get(table).cloned()
}

pub async fn remember(registry: &BindingRegistry, binding: Binding) {
    registry
        .write()
        .await
        .insert(binding.table_name.clone(), binding);
}

pub async fn forget(registry: &BindingRegistry, table: &str) {
    registry.write().await.remove(table);
}
