//! Application state shared across all handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use keystone_sdk::ServiceRegistry;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Bootstrap;
use crate::config_store::{ConfigStore, DEFAULT_DATABASE};
use crate::db;
use crate::host::{Host, RouteTable};
use crate::middleware::auth::{AuthGate, TokenAuthGate};
use crate::plugin::{LifecycleController, ModuleRegistry, PluginRoots, Registry, ScanReport};
use crate::services::audit::AuditService;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// The YAML config file.
    config: Arc<ConfigStore>,

    /// SQLite pool for the current project.
    db: SqlitePool,

    /// Plugin catalog.
    registry: Arc<Registry>,

    /// Serialized plugin state transitions.
    lifecycle: Arc<LifecycleController>,

    /// Contexts, schemas, routes, and services handed to plugins.
    host: Arc<Host>,

    audit: Arc<AuditService>,

    /// Authentication collaborator for the control plane and plugin routes.
    gate: Arc<dyn AuthGate>,

    /// Result of the startup scan.
    scan: ScanReport,
}

impl AppState {
    /// Load the config file, open the project database, and scan plugins.
    ///
    /// Plugins are not enabled here; call [`AppState::boot`] for that.
    pub async fn new(bootstrap: &Bootstrap, modules: ModuleRegistry) -> Result<Self> {
        let config = ConfigStore::load(&bootstrap.config_path).with_context(|| {
            format!("failed to load config {}", bootstrap.config_path.display())
        })?;

        let database = database_path(&config);
        let pool = db::create_pool(&database, bootstrap.database_max_connections)
            .await
            .context("failed to open project database")?;
        info!(path = %database.display(), "Database opened");

        let roots = PluginRoots {
            core: bootstrap.core_plugins_dir.clone(),
            user: bootstrap.user_plugins_dir.clone(),
            example: bootstrap.example_plugins_dir.clone(),
        };

        Self::build(config, pool, roots, modules).await
    }

    /// Assemble state from an already loaded config and an open pool.
    pub async fn build(
        config: ConfigStore,
        pool: SqlitePool,
        roots: PluginRoots,
        modules: ModuleRegistry,
    ) -> Result<Self> {
        db::run_migrations(&pool)
            .await
            .context("failed to create kernel tables")?;

        let config = Arc::new(config);
        let project_id = config
            .current_project()
            .map(|p| p.id)
            .unwrap_or_else(|| config.server().default_project);

        let auth = config.auth();
        let gate: Arc<dyn AuthGate> =
            Arc::new(TokenAuthGate::new(auth.service_token, &auth.jwt_secret));
        let audit = Arc::new(AuditService::new(pool.clone()));
        let routes = Arc::new(RouteTable::new(gate.clone()));
        let host = Arc::new(Host::new(
            pool.clone(),
            project_id.clone(),
            Arc::new(ServiceRegistry::new()),
            audit.clone(),
            routes,
        ));

        let registry = Arc::new(Registry::new(roots, Arc::new(modules)));
        let scan = registry.scan(&config);
        info!(
            project = %project_id,
            plugins = scan.total,
            failed = scan.failed,
            missing = scan.missing,
            "Plugins scanned"
        );
        if scan.missing > 0 {
            warn!(
                missing = scan.missing,
                "configured plugins are missing on disk; see GET /plugins/missing"
            );
        }

        let lifecycle = Arc::new(LifecycleController::new(
            registry.clone(),
            config.clone(),
            host.clone(),
        ));

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                db: pool,
                registry,
                lifecycle,
                host,
                audit,
                gate,
                scan,
            }),
        })
    }

    /// Enable every plugin the config marks as enabled.
    pub async fn boot(&self) {
        self.inner.lifecycle.boot().await;
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.inner.lifecycle
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.inner.host
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        self.inner.host.routes()
    }

    pub fn audit(&self) -> &Arc<AuditService> {
        &self.inner.audit
    }

    pub fn gate(&self) -> &Arc<dyn AuthGate> {
        &self.inner.gate
    }

    pub fn scan_report(&self) -> &ScanReport {
        &self.inner.scan
    }

    /// Check if the database is healthy.
    pub async fn db_healthy(&self) -> bool {
        db::check_health(&self.inner.db).await
    }
}

/// `projects[current].database`, relative to the config file's directory.
fn database_path(config: &ConfigStore) -> PathBuf {
    let file = config
        .current_project()
        .and_then(|p| p.database)
        .unwrap_or_else(|| DEFAULT_DATABASE.to_string());
    let file = PathBuf::from(file);
    if file.is_absolute() {
        file
    } else {
        config.base_dir().join(file)
    }
}
