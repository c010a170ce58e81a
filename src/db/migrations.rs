// ========================================
// migrations.rs - Capture schema migrations
// ========================================
// Runs the embedded sqlx migrations. Databases whose capture tables were
// created by the older standalone setup script (no _sqlx_migrations table)
// are stamped as migrated instead of having the DDL replayed.

use sqlx::{migrate::Migrator, SqlitePool};
use tracing::info;

use crate::error::Result;

// Single source of truth: ./migrations (crate root)
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // 1) sqlx already tracks this database: run normally.
    if sqlx_migrations_table_exists(pool).await? {
        MIGRATOR.run(pool).await?;
        return Ok(());
    }

    // 2) Either a fresh database, or one set up by the legacy script.
    if legacy_db_looks_already_migrated(pool).await? {
        info!("capture tables predate migration tracking, stamping them as applied");
        ensure_sqlx_migrations_table(pool).await?;
        stamp_all_migrations_as_applied(pool).await?;
        return Ok(());
    }

    // 3) Default: fresh database.
    MIGRATOR.run(pool).await?;
    info!(version = CURRENT_SCHEMA_VERSION, "capture schema migrated");
    Ok(())
}

pub async fn read_schema_version(pool: &SqlitePool) -> Result<i64> {
    if !sqlx_migrations_table_exists(pool).await? {
        return Ok(0);
    }

    // MAX(version) where success=TRUE
    let v: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(version) FROM _sqlx_migrations WHERE success = TRUE"
    )
        .fetch_one(pool)
        .await?;

    Ok(v.unwrap_or(0))
}

async fn sqlx_migrations_table_exists(pool: &SqlitePool) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'"
    )
        .fetch_one(pool)
        .await?;

    Ok(count > 0)
}

async fn legacy_db_looks_already_migrated(pool: &SqlitePool) -> Result<bool> {
    // Every object the migrations create must already be there, otherwise
    // stamping would hide a missing table.
    let present: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE (type='table' AND name IN ('capture_log', 'capture_bindings', 'capture_session'))
            OR (type='trigger' AND name='capture_log_immutable')"
    )
        .fetch_one(pool)
        .await?;

    Ok(present == 4)
}

async fn ensure_sqlx_migrations_table(pool: &SqlitePool) -> Result<()> {
    // Exactly the schema SQLx creates for SQLite
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _sqlx_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT NOT NULL,
            installed_on TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            success BOOLEAN NOT NULL,
            checksum BLOB NOT NULL,
            execution_time BIGINT NOT NULL
        );
        "#,
    )
        .execute(pool)
        .await?;

    Ok(())
}

async fn stamp_all_migrations_as_applied(pool: &SqlitePool) -> Result<()> {
    // Mark every embedded migration as applied with its real checksum.
    for m in MIGRATOR.iter() {
        sqlx::query(
            r#"
            INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time)
            VALUES (?1, ?2, TRUE, ?3, -1)
            ON CONFLICT(version) DO UPDATE SET
            description=excluded.description,
            success=excluded.success,
            checksum=excluded.checksum,
            execution_time=excluded.execution_time;
            "#,
        )
            .bind(m.version)
            .bind(m.description.as_ref())
            .bind(m.checksum.as_ref())
            .execute(pool)
            .await?;
    }

    Ok(())
}
