// ========================================
// bindings.rs - Binding registration
// ========================================
// Registers tracked tables: validates the table and its identity column,
// installs the generated capture triggers and records the binding in
// capture_bindings, all in one transaction.

use std::collections::HashMap;

use sqlx::SqliteConnection;
use tracing::info;

use super::helpers::{is_reserved_table, table_columns, table_exists, user_tables, TableColumn};
use super::schema_guard::{refresh_binding, RefreshOutcome};
use super::triggers::{columns_fingerprint, create_trigger_sql, drop_trigger_sql, TriggerSpec};
use crate::db::Database;
use crate::error::{CaptureError, Result};
use crate::model::{BindOutcome, Binding, BindingSpec, CaptureMode, Operation, TableCoverage};
use crate::registry::{self, BindingRow};

impl Database {
    /// Binds a table for capture. Re-binding with the same identity column
    /// and mode is a no-op (`AlreadyBound`); any other re-binding conflicts.
    pub async fn bind(&self, spec: &BindingSpec) -> Result<BindOutcome> {
        if is_reserved_table(&spec.table_name) {
            return Err(CaptureError::InvalidBinding {
                table: spec.table_name.clone(),
                reason: "table is reserved and cannot be captured".into(),
            });
        }

        let mut tx = self.pool.begin().await?;

        if let Some(existing) = fetch_binding(&mut tx, &spec.table_name).await? {
            if existing.identity_column != spec.identity_column || existing.mode != spec.mode {
                return Err(CaptureError::BindingConflict {
                    table: existing.table_name,
                    existing: existing.identity_column,
                    mode: existing.mode.to_string(),
                });
            }

            // Idempotent, but heal triggers that were dropped by hand.
            let outcome = refresh_binding(&mut tx, &existing).await?;
            let current = fetch_binding(&mut tx, &spec.table_name).await?;
            tx.commit().await?;

            if outcome == RefreshOutcome::Refreshed {
                info!(table = %spec.table_name, "re-installed capture triggers for existing binding");
            }
            if let Some(binding) = current {
                registry::remember(&self.registry, binding).await;
            }
            return Ok(BindOutcome::AlreadyBound);
        }

        let columns = validate_target(&mut tx, &spec.table_name, &spec.identity_column).await?;
        install_triggers(&mut tx, &spec.table_name, &spec.identity_column, spec.mode, &columns).await?;

        let row = sqlx::query_as::<_, BindingRow>(
            "INSERT INTO capture_bindings (table_name, identity_column, capture_mode, columns_fingerprint)
             VALUES (?, ?, ?, ?)
             RETURNING table_name, identity_column, capture_mode, columns_fingerprint, bound_at"
        )
            .bind(&spec.table_name)
            .bind(&spec.identity_column)
            .bind(spec.mode.as_str())
            .bind(columns_fingerprint(&columns))
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        let binding = Binding::try_from(row)?;
        info!(
            table = %binding.table_name,
            identity = %binding.identity_column,
            mode = %binding.mode,
            columns = binding.columns.len(),
            "table bound for capture"
        );
        registry::remember(&self.registry, binding).await;

        Ok(BindOutcome::Bound)
    }

    /// Binds several tables; stops at the first failure.
    pub async fn bind_all(&self, specs: &[BindingSpec]) -> Result<Vec<(String, BindOutcome)>> {
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in specs {
            let outcome = self.bind(spec).await?;
            outcomes.push((spec.table_name.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Removes a binding and its triggers. Entries already captured stay in
    /// the log. Returns false when the table was not bound.
    pub async fn unbind(&self, table: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let removed: Option<String> = sqlx::query_scalar(
            "DELETE FROM capture_bindings WHERE table_name = ? RETURNING table_name"
        )
            .bind(table)
            .fetch_optional(&mut *tx)
            .await?;

        if removed.is_none() {
            return Ok(false);
        }

        for op in Operation::ALL {
            sqlx::query(&drop_trigger_sql(table, op)).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        registry::forget(&self.registry, table).await;

        info!(table = %table, "table unbound from capture");
        Ok(true)
    }

    pub async fn bindings(&self) -> Result<Vec<Binding>> {
        let rows = sqlx::query_as::<_, BindingRow>(
            "SELECT table_name, identity_column, capture_mode, columns_fingerprint, bound_at
             FROM capture_bindings
             ORDER BY table_name ASC"
        )
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Binding::try_from).collect()
    }

    /// Every user table with its binding, if any. Mutations on unbound
    /// tables are not captured; this listing is how that gets noticed.
    pub async fn coverage(&self) -> Result<Vec<TableCoverage>> {
        let mut conn = self.pool.acquire().await?;
        let tables = user_tables(&mut *conn).await?;
        drop(conn);

        let bound: HashMap<String, String> = self
            .bindings()
            .await?
            .into_iter()
            .map(|b| (b.table_name, b.identity_column))
            .collect();

        Ok(tables
            .into_iter()
            .map(|table_name| TableCoverage {
                identity_column: bound.get(&table_name).cloned(),
                table_name,
            })
            .collect())
    }

    pub async fn unbound_tables(&self) -> Result<Vec<String>> {
        Ok(self
            .coverage()
            .await?
            .into_iter()
            .filter(|c| !c.is_bound())
            .map(|c| c.table_name)
            .collect())
    }

    /// Registry lookup; does not touch the database.
    pub async fn is_bound(&self, table: &str) -> bool {
        registry::lookup(&self.registry, table).await.is_some()
    }

    pub async fn binding(&self, table: &str) -> Option<Binding> {
        registry::lookup(&self.registry, table).await
    }
}

pub(super) async fn fetch_binding(conn: &mut SqliteConnection, table: &str) -> Result<Option<Binding>> {
    let row = sqlx::query_as::<_, BindingRow>(
        "SELECT table_name, identity_column, capture_mode, columns_fingerprint, bound_at
         FROM capture_bindings
         WHERE table_name = ?"
    )
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(Binding::try_from).transpose()
}

/// Checks that `table` can be captured with `identity_column` as record_id
/// and returns its columns.
pub(super) async fn validate_target(
    conn: &mut SqliteConnection,
    table: &str,
    identity_column: &str,
) -> Result<Vec<TableColumn>> {
    let invalid = |reason: String| CaptureError::InvalidBinding {
        table: table.to_string(),
        reason,
    };

    if is_reserved_table(table) {
        return Err(invalid("table is reserved and cannot be captured".into()));
    }

    if !table_exists(&mut *conn, table).await? {
        return Err(invalid("no such table".into()));
    }

    let columns = table_columns(&mut *conn, table).await?;

    if let Some(bad) = columns.iter().find(|c| c.name.contains('"')) {
        return Err(invalid(format!("column name {:?} contains a double quote", bad.name)));
    }

    let identity = columns
        .iter()
        .find(|c| c.name == identity_column)
        .ok_or_else(|| invalid(format!("no such column '{}'", identity_column)))?;

    let pk_columns = columns.iter().filter(|c| c.pk > 0).count();
    if identity.pk != 1 || pk_columns != 1 {
        return Err(invalid(format!(
            "'{}' must be the table's single-column primary key",
            identity_column
        )));
    }

    if !identity.is_integer() {
        return Err(invalid(format!(
            "'{}' must have an integer type, found '{}'",
            identity_column, identity.decl_type
        )));
    }

    Ok(columns)
}

/// Drops and recreates the three capture triggers of a table.
pub(super) async fn install_triggers(
    conn: &mut SqliteConnection,
    table: &str,
    identity_column: &str,
    mode: CaptureMode,
    columns: &[TableColumn],
) -> Result<()> {
    let spec = TriggerSpec {
        table,
        identity_column,
        mode,
        columns,
    };

    for op in Operation::ALL {
        sqlx::query(&drop_trigger_sql(table, op)).execute(&mut *conn).await?;
        sqlx::query(&create_trigger_sql(&spec, op)).execute(&mut *conn).await?;
    }

    Ok(())
}
