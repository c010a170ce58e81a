// ========================================
// schema_guard.rs - Keeps capture triggers aligned with table schemas
// ========================================
// Triggers list the columns that existed when they were generated and refuse
// to capture once the table's columns change. Bindings are compared against
// the live schema and their triggers regenerated when they drift or go
// missing.

use sqlx::{SqliteConnection, SqlitePool};

use super::bindings::{install_triggers, validate_target};
use super::helpers::{column_names, existing_triggers, table_exists};
use super::triggers::{columns_fingerprint, trigger_names};
use crate::db::Database;
use crate::error::{CaptureError, Result};
use crate::model::{Binding, RefreshReport};
use crate::registry::BindingRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshOutcome {
    Unchanged,
    Refreshed,
    Stale,
}

impl Database {
    /// Regenerates triggers for bindings whose table changed shape and
    /// reloads the registry. Call after `ALTER TABLE` on a tracked table.
    pub async fn refresh_bindings(&self) -> Result<RefreshReport> {
        let report = refresh_bindings(&self.pool).await?;
        self.reload_registry().await?;
        Ok(report)
    }
}

pub(crate) async fn refresh_bindings(pool: &SqlitePool) -> Result<RefreshReport> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query_as::<_, BindingRow>(
        "SELECT table_name, identity_column, capture_mode, columns_fingerprint, bound_at
         FROM capture_bindings
         ORDER BY table_name ASC"
    )
        .fetch_all(&mut *tx)
        .await?;

    let mut report = RefreshReport::default();

    for row in rows {
        let binding = Binding::try_from(row)?;
        match refresh_binding(&mut tx, &binding).await? {
            RefreshOutcome::Unchanged => {}
            RefreshOutcome::Refreshed => report.refreshed.push(binding.table_name),
            RefreshOutcome::Stale => report.stale.push(binding.table_name),
        }
    }

    tx.commit().await?;
    Ok(report)
}

pub(crate) async fn refresh_binding(conn: &mut SqliteConnection, binding: &Binding) -> Result<RefreshOutcome> {
    // Dropped tables keep their binding row: the log still refers to them.
    if !table_exists(&mut *conn, &binding.table_name).await? {
        return Ok(RefreshOutcome::Stale);
    }

    let columns = match validate_target(&mut *conn, &binding.table_name, &binding.identity_column).await {
        Ok(columns) => columns,
        Err(CaptureError::InvalidBinding { .. }) => return Ok(RefreshOutcome::Stale),
        Err(e) => return Err(e),
    };

    let names = column_names(&columns);
    let present = existing_triggers(&mut *conn, &binding.table_name).await?;
    let missing_trigger = trigger_names(&binding.table_name)
        .iter()
        .any(|name| !present.contains(name));

    if names == binding.columns && !missing_trigger {
        return Ok(RefreshOutcome::Unchanged);
    }

    install_triggers(
        &mut *conn,
        &binding.table_name,
        &binding.identity_column,
        binding.mode,
        &columns,
    )
        .await?;

    sqlx::query("UPDATE capture_bindings SET columns_fingerprint = ? WHERE table_name = ?")
        .bind(columns_fingerprint(&columns))
        .bind(&binding.table_name)
        .execute(&mut *conn)
        .await?;

    Ok(RefreshOutcome::Refreshed)
}
