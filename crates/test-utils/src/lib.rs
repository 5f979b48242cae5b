//! Keystone test utilities.
//!
//! Helpers for integration testing: SQLite pools, on-disk plugin
//! directories, a scripted plugin module whose hooks can be told to fail,
//! panic, or stall, and an audit sink that remembers what it was given.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keystone_sdk::axum::{Json, routing::any};
use keystone_sdk::{AuditRecord, AuditSink, HandlerSet, HookError, HookSet, Plugin, PluginContext};
use parking_lot::Mutex;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

/// Single-connection in-memory database.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}

/// File-backed database in WAL mode, for tests that need real concurrency.
pub async fn file_pool(path: &Path, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Write `contents` to `<dir>/config.yml` and return the path.
pub fn write_config(dir: &Path, contents: &str) -> io::Result<PathBuf> {
    let path = dir.join("config.yml");
    fs::write(&path, contents)?;
    Ok(path)
}

/// Builder for a plugin directory on disk.
#[derive(Debug, Clone)]
pub struct PluginDir {
    name: String,
    manifest: Value,
    module: Option<String>,
}

impl PluginDir {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            manifest: json!({
                "name": name,
                "version": "1.0.0",
                "description": format!("{name} test plugin"),
            }),
            module: None,
        }
    }

    /// Name the compiled-in module in `plugin.toml`.
    pub fn module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }

    pub fn depends_on(self, deps: &[&str]) -> Self {
        self.set("dependencies", json!(deps))
    }

    pub fn hooks(self, hooks: &[&str]) -> Self {
        self.set("hooks", json!(hooks))
    }

    pub fn route(mut self, method: &str, path: &str, handler: &str, tags: &[&str]) -> Self {
        let route = json!({
            "method": method,
            "path": path,
            "handler_ref": handler,
            "middleware_tags": tags,
        });
        match self.manifest.get_mut("routes").and_then(Value::as_array_mut) {
            Some(routes) => routes.push(route),
            None => self.manifest["routes"] = json!([route]),
        }
        self
    }

    pub fn schema(mut self, statement: &str) -> Self {
        match self.manifest.get_mut("schemas").and_then(Value::as_array_mut) {
            Some(schemas) => schemas.push(json!(statement)),
            None => self.manifest["schemas"] = json!([statement]),
        }
        self
    }

    /// Set any top-level manifest field.
    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.manifest[key] = value;
        self
    }

    /// Write the directory under `root` and return its path.
    pub fn write(&self, root: &Path) -> io::Result<PathBuf> {
        let dir = root.join(&self.name);
        fs::create_dir_all(&dir)?;
        let manifest = serde_json::to_string_pretty(&self.manifest)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join("plugin.json"), manifest)?;
        if let Some(module) = &self.module {
            fs::write(dir.join("plugin.toml"), format!("module = \"{module}\"\n"))?;
        }
        Ok(dir)
    }
}

/// What a scripted hook does when called.
#[derive(Debug, Clone, Default)]
pub enum HookBehavior {
    #[default]
    Succeed,
    Fail(String),
    Panic,
    Sleep(Duration),
}

#[derive(Debug, Clone, Default)]
struct Script {
    on_load: HookBehavior,
    on_activate: HookBehavior,
    on_deactivate: HookBehavior,
}

/// Ordered log of `<plugin>:<hook>` calls.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// A plugin module whose hook outcomes are set by the test.
///
/// Clones share their script and call log, so a test can keep one handle,
/// register clones as the module factory, and change behavior between
/// lifecycle operations.
#[derive(Debug, Clone)]
pub struct ScriptedPlugin {
    name: String,
    script: Arc<Mutex<Script>>,
    calls: CallLog,
}

impl ScriptedPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(Mutex::new(Script::default())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Share the call log with other scripted plugins.
    pub fn with_log(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }

    pub fn set_on_load(&self, behavior: HookBehavior) {
        self.script.lock().on_load = behavior;
    }

    pub fn set_on_activate(&self, behavior: HookBehavior) {
        self.script.lock().on_activate = behavior;
    }

    pub fn set_on_deactivate(&self, behavior: HookBehavior) {
        self.script.lock().on_deactivate = behavior;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn run(&self, hook: &str, behavior: HookBehavior) -> Result<(), HookError> {
        self.calls.lock().push(format!("{}:{hook}", self.name));
        match behavior {
            HookBehavior::Succeed => Ok(()),
            HookBehavior::Fail(message) => Err(HookError::new(message)),
            HookBehavior::Panic => panic!("{} panicked in {hook}", self.name),
            HookBehavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn hooks(&self) -> HookSet {
        HookSet::all()
    }

    async fn on_load(&self, _ctx: &PluginContext) -> Result<(), HookError> {
        let behavior = self.script.lock().on_load.clone();
        self.run("on_load", behavior).await
    }

    async fn on_activate(&self, ctx: &PluginContext) -> Result<(), HookError> {
        let behavior = self.script.lock().on_activate.clone();
        self.run("on_activate", behavior).await?;
        ctx.services().insert("status", Arc::new(format!("{} ready", self.name)));
        Ok(())
    }

    async fn on_deactivate(&self, _ctx: &PluginContext) -> Result<(), HookError> {
        let behavior = self.script.lock().on_deactivate.clone();
        self.run("on_deactivate", behavior).await
    }

    /// One handler, `ping`, answering with the plugin id and resolved config.
    fn handlers(&self, ctx: &PluginContext) -> HandlerSet {
        let body = json!({ "plugin": ctx.plugin_id(), "config": ctx.config() });
        let mut handlers = HandlerSet::new();
        handlers.insert(
            "ping".to_string(),
            any(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        handlers
    }
}

/// Audit sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn for_plugin(&self, plugin_id: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.plugin_id == plugin_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}
