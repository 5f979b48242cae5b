//! Database connection pool management.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Kernel tables. They exist before the pool is handed to any component,
/// so the first audit write always has a table to land in.
const KERNEL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS plugin_audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        action TEXT NOT NULL,
        plugin_id TEXT NOT NULL,
        admin_user TEXT,
        details TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE INDEX IF NOT EXISTS idx_plugin_audit_log_plugin ON plugin_audit_log (plugin_id, id)",
    "CREATE TABLE IF NOT EXISTS plugin_schema_state (
        project_id TEXT NOT NULL,
        plugin_id TEXT NOT NULL,
        version TEXT NOT NULL,
        checksum TEXT NOT NULL DEFAULT '',
        applied_at INTEGER NOT NULL,
        PRIMARY KEY (project_id, plugin_id)
    )",
];

/// Open (creating if needed) the project's SQLite database.
pub async fn create_pool(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .context("invalid database path")?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;

    Ok(pool)
}

/// Create the kernel tables.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in KERNEL_SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to create kernel tables")?;
    }
    Ok(())
}

/// Check if the database connection is healthy.
pub async fn check_health(pool: &SqlitePool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
