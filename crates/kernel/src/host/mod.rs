//! Host surface: what the runtime hands to plugins.
//!
//! Builds per-plugin contexts, applies plugin schemas, mounts contributed
//! routes, and publishes plugin services into the runtime registry.

mod error;
pub mod routes;
pub mod schema;

pub use error::HostError;
pub use routes::{RouteTable, dispatch};

use std::sync::Arc;

use keystone_sdk::{AuditSink, ContextParts, HandlerSet, PluginContext, ServiceRegistry};
use sqlx::SqlitePool;
use tracing::debug;

use crate::plugin::{PluginManifest, PluginRecord};

/// Shared collaborators every plugin context is built from.
pub struct Host {
    db: SqlitePool,
    project_id: String,
    runtime_services: Arc<ServiceRegistry>,
    audit: Arc<dyn AuditSink>,
    routes: Arc<RouteTable>,
}

impl Host {
    pub fn new(
        db: SqlitePool,
        project_id: impl Into<String>,
        runtime_services: Arc<ServiceRegistry>,
        audit: Arc<dyn AuditSink>,
        routes: Arc<RouteTable>,
    ) -> Self {
        Self {
            db,
            project_id: project_id.into(),
            runtime_services,
            audit,
            routes,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn runtime_services(&self) -> &Arc<ServiceRegistry> {
        &self.runtime_services
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// A fresh context for `record`, with settings resolved over schema defaults.
    pub fn build_context(
        &self,
        record: &PluginRecord,
        settings: Option<&serde_json::Value>,
    ) -> PluginContext {
        let config = record
            .manifest
            .as_ref()
            .map(|m| m.resolve_config(settings))
            .unwrap_or_else(|| serde_json::json!({}));

        PluginContext::new(ContextParts {
            plugin_id: record.id.clone(),
            project_id: self.project_id.clone(),
            directory: record.directory_path.clone(),
            db: self.db.clone(),
            config,
            runtime_services: self.runtime_services.clone(),
            audit: self.audit.clone(),
        })
    }

    pub async fn apply_schemas(
        &self,
        plugin: &str,
        manifest: &PluginManifest,
    ) -> Result<bool, HostError> {
        schema::apply_schemas(&self.db, &self.project_id, plugin, manifest).await
    }

    /// Drop the record of `plugin`'s applied schemas. Tables are left alone.
    pub async fn forget_schemas(&self, plugin: &str) -> Result<(), HostError> {
        schema::clear(&self.db, &self.project_id, plugin).await
    }

    pub fn mount(
        &self,
        plugin: &str,
        manifest: &PluginManifest,
        handlers: &HandlerSet,
    ) -> Result<usize, HostError> {
        self.routes.mount(plugin, &manifest.routes, handlers)
    }

    pub fn unmount(&self, plugin: &str) -> bool {
        self.routes.unmount(plugin)
    }

    /// Copy the plugin's services into the runtime registry as `<plugin>.<name>`.
    pub fn publish_services(&self, ctx: &PluginContext) -> Vec<String> {
        let mut published = Vec::new();
        for (name, service) in ctx.services().entries() {
            let qualified = format!("{}.{name}", ctx.plugin_id());
            self.runtime_services.insert_erased(qualified.clone(), service);
            published.push(qualified);
        }
        published.sort();
        if !published.is_empty() {
            debug!(plugin = %ctx.plugin_id(), services = ?published, "published plugin services");
        }
        published
    }

    /// Remove every `<plugin>.*` service from the runtime registry.
    pub fn withdraw_services(&self, plugin: &str) -> usize {
        self.runtime_services.remove_prefixed(&format!("{plugin}."))
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("project_id", &self.project_id)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}
