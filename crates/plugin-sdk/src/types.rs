//! Core types exchanged between the runtime and plugins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated caller, inserted into request extensions by the
/// `auth` and `admin` middleware tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable subject identifier (user id or service account name).
    pub subject: String,

    /// Whether the principal may use admin-scoped routes.
    pub admin: bool,
}

impl Principal {
    pub fn new(subject: impl Into<String>, admin: bool) -> Self {
        Self {
            subject: subject.into(),
            admin,
        }
    }
}

/// A single audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub plugin_id: String,
    pub admin_user: Option<String>,
    pub details: serde_json::Value,
}

impl AuditRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        action: impl Into<String>,
        plugin_id: impl Into<String>,
        admin_user: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            plugin_id: plugin_id.into(),
            admin_user,
            details,
        }
    }
}

/// Append-only, best-effort audit destination.
///
/// Implementations must emit every record to the log sink; persistence
/// failures are logged, never returned.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Which lifecycle hooks a plugin module exports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSet {
    pub on_load: bool,
    pub on_activate: bool,
    pub on_deactivate: bool,
}

impl HookSet {
    /// All three hooks.
    pub fn all() -> Self {
        Self {
            on_load: true,
            on_activate: true,
            on_deactivate: true,
        }
    }

    /// Whether the named hook (`on_load`, `on_activate`, `on_deactivate`) is exported.
    pub fn exports(&self, hook: &str) -> bool {
        match hook {
            "on_load" => self.on_load,
            "on_activate" => self.on_activate,
            "on_deactivate" => self.on_deactivate,
            _ => false,
        }
    }
}
