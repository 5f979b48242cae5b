//! Plugin schema application.
//!
//! A plugin's `schemas` then `indexes` run once per project, on its first
//! activation there. Completion is recorded in `plugin_schema_state`; schema
//! evolution after that belongs to the plugin's own `migrations/` folder,
//! which the runtime reports but never executes.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::error::HostError;
use crate::plugin::PluginManifest;

/// Run `manifest`'s statements unless already applied for `project`.
///
/// Returns whether anything ran. Statements run inside one transaction, so a
/// failure leaves neither tables nor the state row behind.
pub async fn apply_schemas(
    pool: &SqlitePool,
    project: &str,
    plugin: &str,
    manifest: &PluginManifest,
) -> Result<bool, HostError> {
    let checksum = schema_checksum(manifest);
    if let Some(applied) = applied_checksum(pool, project, plugin).await? {
        if applied != checksum {
            warn!(
                plugin = %plugin,
                project = %project,
                "plugin schemas changed since first activation; not re-applied"
            );
        }
        return Ok(false);
    }

    let mut tx = pool.begin().await?;
    for (index, statement) in manifest
        .schemas
        .iter()
        .chain(manifest.indexes.iter())
        .enumerate()
    {
        sqlx::query(statement.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|source| HostError::Schema {
                plugin: plugin.to_string(),
                index,
                source,
            })?;
    }

    sqlx::query(
        "INSERT INTO plugin_schema_state (project_id, plugin_id, version, checksum, applied_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (project_id, plugin_id) DO NOTHING",
    )
    .bind(project)
    .bind(plugin)
    .bind(&manifest.version)
    .bind(&checksum)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        plugin = %plugin,
        project = %project,
        statements = manifest.schemas.len() + manifest.indexes.len(),
        "applied plugin schemas"
    );
    Ok(true)
}

pub async fn is_applied(pool: &SqlitePool, project: &str, plugin: &str) -> Result<bool, HostError> {
    Ok(applied_checksum(pool, project, plugin).await?.is_some())
}

async fn applied_checksum(
    pool: &SqlitePool,
    project: &str,
    plugin: &str,
) -> Result<Option<String>, HostError> {
    let checksum = sqlx::query_scalar(
        "SELECT checksum FROM plugin_schema_state WHERE project_id = ? AND plugin_id = ?",
    )
    .bind(project)
    .bind(plugin)
    .fetch_optional(pool)
    .await?;
    Ok(checksum)
}

/// Hex SHA-256 over the schema then index statements.
pub fn schema_checksum(manifest: &PluginManifest) -> String {
    let mut hasher = Sha256::new();
    for statement in manifest.schemas.iter().chain(manifest.indexes.iter()) {
        hasher.update(statement.trim().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Forget that `plugin`'s schemas were applied in `project`.
pub async fn clear(pool: &SqlitePool, project: &str, plugin: &str) -> Result<(), HostError> {
    sqlx::query("DELETE FROM plugin_schema_state WHERE project_id = ? AND plugin_id = ?")
        .bind(project)
        .bind(plugin)
        .execute(pool)
        .await?;
    Ok(())
}
