//! Audit logging service.
//!
//! Every plugin lifecycle action is emitted on the `audit` tracing target and
//! then appended to `plugin_audit_log`. Persistence is best-effort: a failed
//! insert is logged and never reaches the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_sdk::{AuditRecord, AuditSink};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::{info, warn};

/// Audit logging service.
#[derive(Clone)]
pub struct AuditService {
    pool: SqlitePool,
}

/// A stored audit row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub plugin_id: String,
    pub admin_user: Option<String>,
    #[sqlx(json)]
    pub details: serde_json::Value,
}

impl AuditService {
    /// Create a new audit service.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn persist(&self, record: &AuditRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO plugin_audit_log (timestamp, action, plugin_id, admin_user, details) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.timestamp)
        .bind(&record.action)
        .bind(&record.plugin_id)
        .bind(&record.admin_user)
        .bind(sqlx::types::Json(&record.details))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent entries first, optionally for one plugin.
    pub async fn recent(
        &self,
        plugin_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let limit = limit.clamp(1, 1000);
        match plugin_id {
            Some(plugin_id) => {
                sqlx::query_as::<_, AuditEntry>(
                    "SELECT id, timestamp, action, plugin_id, admin_user, details \
                     FROM plugin_audit_log WHERE plugin_id = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(plugin_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, AuditEntry>(
                    "SELECT id, timestamp, action, plugin_id, admin_user, details \
                     FROM plugin_audit_log ORDER BY id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
    }
}

#[async_trait]
impl AuditSink for AuditService {
    async fn record(&self, record: AuditRecord) {
        info!(
            target: "audit",
            action = %record.action,
            plugin = %record.plugin_id,
            admin_user = record.admin_user.as_deref().unwrap_or("-"),
            details = %record.details,
            "audit"
        );

        if let Err(e) = self.persist(&record).await {
            warn!(
                action = %record.action,
                plugin = %record.plugin_id,
                error = %e,
                "failed to persist audit record"
            );
        }
    }
}

impl std::fmt::Debug for AuditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditService").finish()
    }
}
