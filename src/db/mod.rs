// ========================================
// mod.rs - Database entry point
// ========================================
// Organises the submodules and exposes the `Database` handle: a SQLite pool
// with the capture schema migrated and the binding registry loaded.

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::{sync::OnceLock, time::Duration};
use tracing::{info, warn};

use crate::config::{CaptureConfig, DatabaseLocation};
use crate::error::Result;
use crate::registry::BindingRegistry;

mod helpers;
mod migrations;
mod schema_guard;
mod triggers;
mod bindings;
mod capture;
mod audit;
mod export;

pub use capture::CaptureScope;
pub use helpers::{is_reserved_table, TableColumn};
pub use migrations::CURRENT_SCHEMA_VERSION;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
    pub registry: BindingRegistry,
}

static DB_CONNECT_LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

impl Database {
    pub async fn connect(config: &CaptureConfig) -> Result<Self> {
        // Concurrent connects in one process would race on migrations.
        let _guard = DB_CONNECT_LOCK
            .get_or_init(|| tokio::sync::Mutex::new(()))
            .lock()
            .await;

        if let DatabaseLocation::File(path) = &config.database {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = match &config.database {
            DatabaseLocation::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
            DatabaseLocation::Memory => SqliteConnectOptions::from_str("sqlite::memory:")?,
        }
            .busy_timeout(config.busy_timeout)
            // Cascaded deletes only fire the child table's triggers with FKs on.
            .foreign_keys(true)
            // Rows deleted by REPLACE conflict resolution only fire DELETE
            // triggers with this on.
            .pragma("recursive_triggers", "ON");

        let max_connections = config.effective_max_connections();

        // The in-memory database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if config.database == DatabaseLocation::Memory { 1 } else { 0 })
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        info!(database = ?config.database, max_connections, "connected to capture database");

        Self::with_pool(pool, config.refresh_on_connect).await
    }

    /// Builds a handle over an existing pool: migrates, refreshes bindings
    /// if asked to, and loads the registry. The pool must enforce foreign
    /// keys for cascades to be captured, and must have `recursive_triggers`
    /// on for rows removed by `INSERT OR REPLACE` to be captured.
    pub async fn with_pool(pool: SqlitePool, refresh_bindings: bool) -> Result<Self> {
        // Retry when SQLite is busy (code 5)
        for attempt in 1..=5 {
            match migrations::apply(&pool).await {
                Ok(_) => break,
                Err(e) if Self::is_sqlite_locked(&e) && attempt < 5 => {
                    warn!(attempt, "SQLite locked during migrations, retrying");
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let db = Self {
            pool,
            registry: crate::registry::create_empty_registry(),
        };

        if refresh_bindings {
            let report = schema_guard::refresh_bindings(&db.pool).await?;
            if !report.refreshed.is_empty() {
                info!(tables = ?report.refreshed, "regenerated capture triggers after schema change");
            }
            for table in &report.stale {
                warn!(table = %table, "binding refers to a table that no longer qualifies for capture");
            }
        }

        db.reload_registry().await?;

        Ok(db)
    }

    /// Re-reads `capture_bindings` into the in-memory registry (for example
    /// after another process changed the bindings).
    pub async fn reload_registry(&self) -> Result<()> {
        let bindings = crate::registry::fetch_bindings_from_db(&self.pool).await?;
        let mut cache_lock = self.registry.write().await;
        *cache_lock = bindings;
        Ok(())
    }

    // Detects "database is locked" (SQLite code 5)
    fn is_sqlite_locked(e: &crate::error::CaptureError) -> bool {
        use crate::error::CaptureError;

        let sqlx_err = match e {
            CaptureError::Database(err) => err,
            CaptureError::Migrate(sqlx::migrate::MigrateError::Execute(err)) => err,
            other => return other.to_string().to_lowercase().contains("database is locked"),
        };

        match sqlx_err {
            sqlx::Error::Database(db) => db.code().as_deref() == Some("5")
                || db.message().to_lowercase().contains("database is locked"),
            _ => sqlx_err.to_string().to_lowercase().contains("database is locked"),
        }
    }

    pub async fn schema_version(&self) -> Result<i64> {
        migrations::read_schema_version(&self.pool).await
    }

    /// Foreign key violations as readable strings (empty when consistent).
    pub async fn validate_integrity(&self) -> Result<Vec<String>> {
        use sqlx::Row;

        let rows = sqlx::query("PRAGMA foreign_key_check;")
            .fetch_all(&self.pool)
            .await?;

        let mut issues: Vec<String> = Vec::new();

        for r in rows {
            let table: String = r.try_get("table").unwrap_or_else(|_| "<unknown_table>".to_string());
            // rowid is NULL for WITHOUT ROWID tables
            let rowid: Option<i64> = r.try_get("rowid").unwrap_or(None);
            let parent: String =
                r.try_get("parent").unwrap_or_else(|_| "<unknown_parent>".to_string());
            let fkid: i64 = r.try_get("fkid").unwrap_or(-1);

            issues.push(format!(
                "ForeignKey violation: table='{}' rowid={} parent='{}' fkid={}",
                table,
                rowid.map(|r| r.to_string()).unwrap_or_else(|| "NULL".to_string()),
                parent,
                fkid
            ));
        }

        Ok(issues)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
