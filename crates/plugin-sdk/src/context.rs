//! Per-plugin context handed to lifecycle hooks and handler builders.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use sqlx::SqlitePool;

use crate::types::{AuditRecord, AuditSink};

type SharedService = Arc<dyn Any + Send + Sync>;

/// A named, type-erased service table.
///
/// The runtime keeps one process-wide registry; every plugin context also
/// carries a fresh one the plugin fills during its hooks. Entries are
/// retrieved by name and downcast to the concrete type.
#[derive(Default)]
pub struct ServiceRegistry {
    services: parking_lot::RwLock<HashMap<String, SharedService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous entry with the same name.
    pub fn insert<T: Any + Send + Sync>(&self, name: impl Into<String>, service: Arc<T>) {
        self.services.write().insert(name.into(), service);
    }

    /// Register an already type-erased service.
    pub fn insert_erased(&self, name: impl Into<String>, service: Arc<dyn Any + Send + Sync>) {
        self.services.write().insert(name.into(), service);
    }

    /// Fetch a service by name. Returns `None` if absent or of another type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let service = self.services.read().get(name).cloned()?;
        service.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.services.write().remove(name).is_some()
    }

    /// Remove every service whose name starts with `prefix`.
    pub fn remove_prefixed(&self, prefix: &str) -> usize {
        let mut services = self.services.write();
        let before = services.len();
        services.retain(|name, _| !name.starts_with(prefix));
        before - services.len()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<(String, Arc<dyn Any + Send + Sync>)> {
        self.services
            .read()
            .iter()
            .map(|(name, service)| (name.clone(), service.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

/// Everything the host assembles before calling `on_load`.
pub struct ContextParts {
    pub plugin_id: String,
    pub project_id: String,
    pub directory: PathBuf,
    pub db: SqlitePool,
    pub config: serde_json::Value,
    pub runtime_services: Arc<ServiceRegistry>,
    pub audit: Arc<dyn AuditSink>,
}

/// The context a plugin sees.
///
/// Created on `on_load`, reused by `on_activate`, and torn down after
/// `on_deactivate`.
pub struct PluginContext {
    plugin_id: String,
    project_id: String,
    directory: PathBuf,
    db: SqlitePool,
    config: serde_json::Value,
    services: ServiceRegistry,
    runtime_services: Arc<ServiceRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl PluginContext {
    pub fn new(parts: ContextParts) -> Self {
        Self {
            plugin_id: parts.plugin_id,
            project_id: parts.project_id,
            directory: parts.directory,
            db: parts.db,
            config: parts.config,
            services: ServiceRegistry::new(),
            runtime_services: parts.runtime_services,
            audit: parts.audit,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Plugin directory on disk.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Shared database handle.
    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Resolved configuration subtree (schema defaults overlaid with the
    /// operator's settings).
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// Typed lookup of a single top-level setting.
    pub fn setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// This plugin's own service table.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// The runtime's process-wide service registry.
    pub fn runtime_services(&self) -> &Arc<ServiceRegistry> {
        &self.runtime_services
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Emit an audit record attributed to this plugin.
    pub async fn audit_event(
        &self,
        action: &str,
        actor: Option<String>,
        details: serde_json::Value,
    ) {
        self.audit
            .record(AuditRecord::new(action, self.plugin_id.clone(), actor, details))
            .await;
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("project_id", &self.project_id)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}
