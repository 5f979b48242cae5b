#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Every test gets its own [`TestApp`]: a temp directory holding the config
//! file, a plugin root, and a WAL-mode SQLite database, with the REAL kernel
//! state and router built on top. Nothing is shared between tests, so they
//! can run in parallel.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use keystone_kernel::config_store::ConfigStore;
use keystone_kernel::middleware::auth::Claims;
use keystone_kernel::plugin::{ModuleRegistry, PluginRoots};
use keystone_kernel::services::audit::AuditEntry;
use keystone_kernel::{AppState, routes};
use keystone_test_utils::{PluginDir, file_pool, write_config};

/// Config used when a test does not care about the file's contents.
pub const BASE_CONFIG: &str = r#"
dev:
  enable_logging: false
  enable_cors: false
projects:
  - id: default
    name: Test Project
    database: keystone.db
    plugins: {}
"#;

/// Who a request is sent as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    /// The configured service token.
    Admin,
    /// A signed JWT without the admin flag.
    User,
}

/// Test application wrapper.
pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub router: Router,
}

/// A temp directory with an empty plugin root, ready for [`PluginDir::write`].
pub fn workspace() -> TempDir {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    std::fs::create_dir_all(dir.path().join("plugins")).expect("failed to create plugin root");
    std::fs::create_dir_all(dir.path().join("core")).expect("failed to create core root");
    dir
}

/// Where test plugins are written.
pub fn plugin_root(dir: &TempDir) -> PathBuf {
    dir.path().join("plugins")
}

/// Write each plugin directory under the plugin root.
pub fn write_plugins(dir: &TempDir, plugins: &[PluginDir]) {
    for plugin in plugins {
        plugin
            .write(&plugin_root(dir))
            .expect("failed to write plugin directory");
    }
}

impl TestApp {
    /// Build state over `dir` with `config` and `modules`. Nothing is booted.
    pub async fn start(dir: TempDir, config: &str, modules: ModuleRegistry) -> Self {
        let path = write_config(dir.path(), config).expect("failed to write config");
        Self::open(dir, &path, modules).await
    }

    /// Build state over an existing config file.
    pub async fn open(dir: TempDir, config_path: &Path, modules: ModuleRegistry) -> Self {
        let config = ConfigStore::load(config_path).expect("failed to load config");
        let pool = file_pool(&dir.path().join("keystone.db"), 4)
            .await
            .expect("failed to open test database");
        let roots = PluginRoots {
            core: dir.path().join("core"),
            user: plugin_root(&dir),
            example: None,
        };
        let state = AppState::build(config, pool, roots, modules)
            .await
            .expect("failed to build app state");
        let router = routes::app(state.clone());
        Self { dir, state, router }
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.yml")
    }

    /// Bearer value for `caller`, if any.
    pub fn bearer(&self, caller: Caller) -> Option<String> {
        match caller {
            Caller::Anonymous => None,
            Caller::Admin => Some(self.state.config().auth().service_token),
            Caller::User => {
                let claims = Claims {
                    sub: "player-1".to_string(),
                    admin: false,
                    exp: (chrono::Utc::now().timestamp() + 3600) as u64,
                };
                let secret = self.state.config().auth().jwt_secret;
                Some(
                    jsonwebtoken::encode(
                        &Header::new(Algorithm::HS256),
                        &claims,
                        &EncodingKey::from_secret(secret.as_bytes()),
                    )
                    .expect("failed to sign test token"),
                )
            }
        }
    }

    /// Send a request and decode the JSON body (`Null` when empty).
    pub async fn request(
        &self,
        caller: Caller,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = self.bearer(caller) {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn admin(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request(Caller::Admin, method, uri, body).await
    }

    /// Audit rows for `plugin`, oldest first.
    pub async fn audit_trail(&self, plugin: &str) -> Vec<AuditEntry> {
        let mut entries = self
            .state
            .audit()
            .recent(Some(plugin), 1000)
            .await
            .expect("failed to read audit log");
        entries.reverse();
        entries
    }

    /// The config file as it is on disk right now.
    pub fn config_on_disk(&self) -> serde_yml::Value {
        let text = std::fs::read_to_string(self.config_path()).expect("failed to read config");
        serde_yml::from_str(&text).expect("config on disk is not YAML")
    }
}
