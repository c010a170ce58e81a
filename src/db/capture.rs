// ========================================
// capture.rs - Capture scopes and explicit appends
// ========================================
// A scope is a transaction opened on behalf of a named actor. The actor is
// parked in capture_session for the lifetime of the transaction, where the
// capture triggers pick it up; SQLite's single-writer lock keeps other
// connections from observing or reusing the slot. Committing clears the
// slot, rolling back discards it together with every captured entry.

use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{CaptureError, Result};
use crate::model::NewCaptureEntry;

pub struct CaptureScope {
    id: Uuid,
    actor: String,
    tx: Transaction<'static, Sqlite>,
}

impl Database {
    /// Opens a transaction whose mutations are attributed to `actor`.
    pub async fn scope(&self, actor: &str) -> Result<CaptureScope> {
        if actor.trim().is_empty() {
            return Err(CaptureError::InvalidEntry("actor is empty".into()));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO capture_session (slot, actor) VALUES (1, ?)
             ON CONFLICT(slot) DO UPDATE SET actor = excluded.actor"
        )
            .bind(actor)
            .execute(&mut *tx)
            .await
            .map_err(CaptureError::Write)?;

        let id = Uuid::new_v4();
        debug!(scope = %id, actor = %actor, "capture scope opened");

        Ok(CaptureScope {
            id,
            actor: actor.to_string(),
            tx,
        })
    }

    /// Appends one entry in its own transaction.
    pub async fn append(&self, entry: &NewCaptureEntry) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        append_entry(&mut *conn, entry).await
    }
}

impl CaptureScope {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Runs a statement inside the scope. Failures of the capture triggers
    /// come back as `Serialization` or `Write`; the caller's own failures
    /// as `Database`. Either way the scope should be rolled back.
    pub async fn execute<'q>(
        &mut self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<SqliteQueryResult> {
        query
            .execute(&mut *self.tx)
            .await
            .map_err(CaptureError::from_mutation)
    }

    /// The underlying connection, for reads and `query_as` inside the scope.
    /// Errors from mutations issued this way can be classified with
    /// `CaptureError::from_mutation`.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    /// Appends an explicit entry inside the scope's transaction.
    pub async fn append(&mut self, entry: &NewCaptureEntry) -> Result<i64> {
        append_entry(&mut *self.tx, entry).await
    }

    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("DELETE FROM capture_session WHERE slot = 1")
            .execute(&mut *self.tx)
            .await
            .map_err(CaptureError::Write)?;

        self.tx.commit().await?;
        debug!(scope = %self.id, actor = %self.actor, "capture scope committed");
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        debug!(scope = %self.id, actor = %self.actor, "capture scope rolled back");
        Ok(())
    }
}

pub(crate) async fn append_entry(conn: &mut SqliteConnection, entry: &NewCaptureEntry) -> Result<i64> {
    entry.validate()?;

    let encode = |doc: &crate::model::RowDocument| {
        serde_json::to_string(doc).map_err(|e| CaptureError::Serialization {
            reason: e.to_string(),
        })
    };
    let old_state = entry.old_state.as_ref().map(encode).transpose()?;
    let new_state = entry.new_state.as_ref().map(encode).transpose()?;

    let audit_id: i64 = sqlx::query_scalar(
        "INSERT INTO capture_log (table_name, operation, record_id, old_state, new_state, actor)
         VALUES (?, ?, ?, ?, ?, ?)
         RETURNING audit_id"
    )
        .bind(&entry.table_name)
        .bind(entry.operation.as_str())
        .bind(entry.record_id)
        .bind(old_state)
        .bind(new_state)
        .bind(&entry.actor)
        .fetch_one(&mut *conn)
        .await
        .map_err(CaptureError::Write)?;

    Ok(audit_id)
}
