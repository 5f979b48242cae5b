//! Lifecycle controller.
//!
//! Realizes operator intents (enable, disable, reload, ...) as state
//! transitions on the registry's records. All transitions are serialized
//! through one async mutex that also owns the loaded module instances and
//! their contexts. Every operation, including no-ops and failures, leaves an
//! audit record.
//!
//! Hooks run on a spawned task so a panicking plugin becomes a
//! [`LifecycleError::HookFailure`] instead of taking the controller down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keystone_sdk::{AuditRecord, Plugin, PluginContext};
use serde::Serialize;
use serde_json::{Value, json};
use serde_yml::Value as YamlValue;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};

use super::dependency::{DependencyError, resolve_order};
use super::error::{LifecycleError, PluginError};
use super::module::ModuleHandle;
use super::record::{FailedPhase, PluginRecord, PluginState};
use super::registry::{Registry, ScanReport};
use crate::config_store::ConfigStore;
use crate::host::Host;
use crate::host::routes::panic_message;

/// Who is asking, and by when.
#[derive(Debug, Clone, Default)]
pub struct OpOptions {
    pub actor: Option<String>,
    pub deadline: Option<Instant>,
}

impl OpOptions {
    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            deadline: None,
        }
    }

    /// Operations the runtime performs on its own behalf.
    pub fn system() -> Self {
        Self::by("system")
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// Result of a lifecycle operation.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub plugin: String,
    pub action: &'static str,
    pub state: PluginState,
    /// False for no-ops such as enabling an Active plugin.
    pub changed: bool,
    /// Plugins activated by this operation, dependencies first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub activated: Vec<String>,
    /// Active plugins that depend on the one just disabled.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_error: Option<String>,
}

impl Transition {
    fn unchanged(plugin: &str, action: &'static str, state: PluginState) -> Self {
        Self {
            plugin: plugin.to_string(),
            action,
            state,
            changed: false,
            activated: Vec::new(),
            dependents: Vec::new(),
            hook_error: None,
        }
    }

    fn changed(plugin: &str, action: &'static str, state: PluginState) -> Self {
        Self {
            changed: true,
            ..Self::unchanged(plugin, action, state)
        }
    }
}

/// Outcome of enabling configured plugins at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootReport {
    pub activated: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Load,
    Activate,
    Deactivate,
}

impl Hook {
    fn name(self) -> &'static str {
        match self {
            Self::Load => "on_load",
            Self::Activate => "on_activate",
            Self::Deactivate => "on_deactivate",
        }
    }
}

/// A plugin whose module has been loaded.
struct LoadedPlugin {
    handle: Option<ModuleHandle>,
    instance: Option<Arc<dyn Plugin>>,
    context: Arc<PluginContext>,
}

#[derive(Default)]
struct Runtime {
    loaded: HashMap<String, LoadedPlugin>,
}

pub struct LifecycleController {
    registry: Arc<Registry>,
    config: Arc<ConfigStore>,
    host: Arc<Host>,
    runtime: Mutex<Runtime>,
}

impl LifecycleController {
    pub fn new(registry: Arc<Registry>, config: Arc<ConfigStore>, host: Arc<Host>) -> Self {
        Self {
            registry,
            config,
            host,
            runtime: Mutex::new(Runtime::default()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Activate `id`, enabling its inactive dependencies first.
    pub async fn enable(&self, id: &str, opts: OpOptions) -> Result<Transition, LifecycleError> {
        let mut rt = self.acquire(id, "enable", &opts).await?;
        let result = self.enable_locked(&mut rt, id, &opts).await;
        self.audit_result("enable", id, &opts, &result).await;
        result
    }

    /// Deactivate `id`. Dependents are reported, not cascaded.
    pub async fn disable(&self, id: &str, opts: OpOptions) -> Result<Transition, LifecycleError> {
        let mut rt = self.acquire(id, "disable", &opts).await?;
        let result = self.disable_locked(&mut rt, id, &opts).await;
        self.audit_result("disable", id, &opts, &result).await;
        result
    }

    /// Enable if Disabled, disable if Active.
    pub async fn toggle(&self, id: &str, opts: OpOptions) -> Result<Transition, LifecycleError> {
        let mut rt = self.acquire(id, "toggle", &opts).await?;
        let result = match self.registry.state(id) {
            None => Err(LifecycleError::NotFound(id.to_string())),
            Some(PluginState::Active) => {
                let result = self.disable_locked(&mut rt, id, &opts).await;
                self.audit_result("disable", id, &opts, &result).await;
                return result;
            }
            Some(PluginState::Disabled) => {
                let result = self.enable_locked(&mut rt, id, &opts).await;
                self.audit_result("enable", id, &opts, &result).await;
                return result;
            }
            Some(state) => Err(LifecycleError::InvalidState {
                plugin: id.to_string(),
                state,
                operation: "toggle",
            }),
        };
        self.audit_result("toggle", id, &opts, &result).await;
        result
    }

    /// Disable then enable with a fresh manifest. From Failed this is a recovery.
    pub async fn reload(&self, id: &str, opts: OpOptions) -> Result<Transition, LifecycleError> {
        let mut rt = self.acquire(id, "reload", &opts).await?;
        let result = self.reload_locked(&mut rt, id, &opts).await;
        self.audit_result("reload", id, &opts, &result).await;
        result
    }

    /// Discovered or Disabled to Loaded: instantiate the module and call `on_load`.
    pub async fn load(&self, id: &str, opts: OpOptions) -> Result<Transition, LifecycleError> {
        let mut rt = self.acquire(id, "load", &opts).await?;
        let result = match self.registry.state(id) {
            None => Err(LifecycleError::NotFound(id.to_string())),
            Some(state @ (PluginState::Loaded | PluginState::Active)) => {
                Ok(Transition::unchanged(id, "load", state))
            }
            Some(PluginState::Discovered | PluginState::Disabled) => self
                .load_locked(&mut rt, id, &opts)
                .await
                .map(|()| Transition::changed(id, "load", PluginState::Loaded)),
            Some(state) => Err(LifecycleError::InvalidState {
                plugin: id.to_string(),
                state,
                operation: "load",
            }),
        };
        self.audit_result("load", id, &opts, &result).await;
        result
    }

    /// Missing to Suppressed: stop nagging the operator about it.
    pub async fn suppress(&self, id: &str, opts: OpOptions) -> Result<Transition, LifecycleError> {
        let _rt = self.acquire(id, "suppress", &opts).await?;
        let result = match self.registry.state(id) {
            None => Err(LifecycleError::NotFound(id.to_string())),
            Some(PluginState::Suppressed) => {
                Ok(Transition::unchanged(id, "suppress", PluginState::Suppressed))
            }
            Some(PluginState::Missing) => self
                .config
                .update_plugin_entry(id, vec![("suppressed", YamlValue::Bool(true))])
                .map_err(LifecycleError::from)
                .map(|()| {
                    self.registry
                        .update(id, |r| r.transition(PluginState::Suppressed));
                    Transition::changed(id, "suppress", PluginState::Suppressed)
                }),
            Some(state) => Err(LifecycleError::InvalidState {
                plugin: id.to_string(),
                state,
                operation: "suppress",
            }),
        };
        self.audit_result("suppress", id, &opts, &result).await;
        result
    }

    /// Delete the config entry of a Missing or Suppressed plugin and drop its record.
    pub async fn forget(&self, id: &str, opts: OpOptions) -> Result<Transition, LifecycleError> {
        let _rt = self.acquire(id, "forget", &opts).await?;
        let result = match self.registry.state(id) {
            None => Err(LifecycleError::NotFound(id.to_string())),
            Some(state @ (PluginState::Missing | PluginState::Suppressed)) => {
                match self.config.remove_plugin_entry(id) {
                    Ok(_) => {
                        self.registry.remove(id);
                        // A reinstall starts from a clean schema record.
                        if let Err(e) = self.host.forget_schemas(id).await {
                            warn!(plugin = %id, error = %e, "failed to clear schema state");
                        }
                        Ok(Transition::changed(id, "forget", state))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Some(state) => Err(LifecycleError::InvalidState {
                plugin: id.to_string(),
                state,
                operation: "forget",
            }),
        };
        self.audit_result("forget", id, &opts, &result).await;
        result
    }

    /// Validate and store operator settings. Running plugins see them after a reload.
    pub async fn update_settings(
        &self,
        id: &str,
        settings: Value,
        opts: OpOptions,
    ) -> Result<Value, LifecycleError> {
        let _rt = self.acquire(id, "config_update", &opts).await?;
        let result = self.update_settings_locked(id, &settings);
        match &result {
            Ok(_) => {
                let keys: Vec<&String> = settings
                    .as_object()
                    .map(|m| m.keys().collect())
                    .unwrap_or_default();
                self.audit("config_update", id, &opts, json!({ "keys": keys }))
                    .await;
            }
            Err(e) => self.audit_failure("config_update", id, &opts, e).await,
        }
        result
    }

    /// Operator settings and the resolved view a plugin context receives.
    pub fn settings(&self, id: &str) -> Option<(Value, Value)> {
        let record = self.registry.get(id)?;
        let raw = self
            .config
            .plugin_entry(id)
            .and_then(|e| e.config)
            .unwrap_or_else(|| json!({}));
        let resolved = record
            .manifest
            .as_ref()
            .map(|m| m.resolve_config(Some(&raw)))
            .unwrap_or_else(|| raw.clone());
        Some((raw, resolved))
    }

    /// Rescan the plugin roots between transitions.
    pub async fn rescan(&self) -> ScanReport {
        let _rt = self.runtime.lock().await;
        self.registry.scan(&self.config)
    }

    /// Enable every plugin whose config entry says `enabled: true`.
    ///
    /// Failures are logged and recorded, never fatal.
    pub async fn boot(&self) -> BootReport {
        let opts = OpOptions::system();
        let mut rt = self.runtime.lock().await;
        let mut report = BootReport::default();

        let wanted: Vec<String> = self
            .config
            .plugin_entries()
            .into_iter()
            .filter(|(_, entry)| entry.enabled && !entry.suppressed)
            .map(|(id, _)| id)
            .filter(|id| {
                matches!(
                    self.registry.state(id),
                    Some(PluginState::Discovered | PluginState::Disabled | PluginState::Loaded)
                )
            })
            .collect();

        let graph = self.registry.dependency_graph();
        let order = match resolve_order(wanted.iter().map(String::as_str), &graph) {
            Ok(order) => order.into_iter().filter(|id| wanted.contains(id)).collect(),
            Err(_) => wanted.clone(),
        };

        for id in order {
            if self.registry.state(&id) == Some(PluginState::Active) {
                continue;
            }
            let result = self.enable_locked(&mut rt, &id, &opts).await;
            self.audit_result("enable", &id, &opts, &result).await;
            match result {
                Ok(transition) => report.activated.extend(transition.activated),
                Err(e) => {
                    error!(plugin = %id, error = %e, "failed to enable plugin at startup");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            activated = report.activated.len(),
            failed = report.failed.len(),
            "plugin boot complete"
        );
        report
    }

    /// Deactivate every active plugin, dependents first. Config is left as is.
    pub async fn shutdown(&self) {
        let mut rt = self.runtime.lock().await;
        let active: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|r| r.state == PluginState::Active)
            .map(|r| r.id)
            .collect();
        let graph = self.registry.dependency_graph();
        let mut order = resolve_order(active.iter().map(String::as_str), &graph)
            .map(|o| o.into_iter().filter(|id| active.contains(id)).collect())
            .unwrap_or(active);
        order.reverse();

        for id in order {
            if let Some((instance, ctx)) = hook_target(&rt, &id, self.declares(&id, Hook::Deactivate))
                && let Err(e) = self
                    .run_hook(&id, Hook::Deactivate, instance, ctx, None)
                    .await
            {
                warn!(plugin = %id, error = %e, "on_deactivate failed during shutdown");
            }
            self.teardown(&mut rt, &id, true);
        }
    }

    async fn acquire(
        &self,
        id: &str,
        action: &'static str,
        opts: &OpOptions,
    ) -> Result<MutexGuard<'_, Runtime>, LifecycleError> {
        let Some(deadline) = opts.deadline else {
            return Ok(self.runtime.lock().await);
        };
        match timeout_at(deadline, self.runtime.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let err = LifecycleError::DeadlineExceeded {
                    plugin: id.to_string(),
                    operation: action,
                };
                self.audit_failure(action, id, opts, &err).await;
                Err(err)
            }
        }
    }

    async fn enable_locked(
        &self,
        rt: &mut Runtime,
        id: &str,
        opts: &OpOptions,
    ) -> Result<Transition, LifecycleError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        match record.state {
            PluginState::Active => return Ok(Transition::unchanged(id, "enable", PluginState::Active)),
            PluginState::Disabled | PluginState::Loaded | PluginState::Discovered => {}
            state => {
                return Err(LifecycleError::InvalidState {
                    plugin: id.to_string(),
                    state,
                    operation: "enable",
                });
            }
        }

        let graph = self.registry.dependency_graph();
        let order = resolve_order([id], &graph).map_err(|e| match e {
            DependencyError::Missing(pairs) => {
                let mut blocking: Vec<String> = pairs.into_iter().map(|(_, dep)| dep).collect();
                blocking.sort();
                blocking.dedup();
                LifecycleError::DependencyUnmet {
                    plugin: id.to_string(),
                    blocking,
                }
            }
            DependencyError::Cycle(plugins) => LifecycleError::Cycle { plugins },
        })?;

        let blocking: Vec<String> = order
            .iter()
            .filter(|dep| dep.as_str() != id)
            .filter(|dep| {
                !matches!(
                    self.registry.state(dep),
                    Some(
                        PluginState::Active
                            | PluginState::Disabled
                            | PluginState::Loaded
                            | PluginState::Discovered
                    )
                )
            })
            .cloned()
            .collect();
        if !blocking.is_empty() {
            return Err(LifecycleError::DependencyUnmet {
                plugin: id.to_string(),
                blocking,
            });
        }

        let mut activated = Vec::new();
        for pid in &order {
            if self.registry.state(pid) == Some(PluginState::Active) {
                continue;
            }
            let induced_by = (pid != id).then_some(id);
            match self.activate_one(rt, pid, induced_by, opts).await {
                Ok(details) => {
                    if pid != id {
                        self.audit("enable", pid, opts, details).await;
                    }
                    activated.push(pid.clone());
                }
                Err(e) if pid != id => {
                    self.audit_failure("enable", pid, opts, &e).await;
                    return Err(match e {
                        LifecycleError::DeadlineExceeded { .. } => {
                            LifecycleError::DeadlineExceeded {
                                plugin: id.to_string(),
                                operation: "enable",
                            }
                        }
                        _ => LifecycleError::DependencyUnmet {
                            plugin: id.to_string(),
                            blocking: vec![pid.clone()],
                        },
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Transition {
            activated,
            ..Transition::changed(id, "enable", PluginState::Active)
        })
    }

    /// Activate one plugin whose dependencies are already Active.
    async fn activate_one(
        &self,
        rt: &mut Runtime,
        pid: &str,
        induced_by: Option<&str>,
        opts: &OpOptions,
    ) -> Result<Value, LifecycleError> {
        let record = self
            .registry
            .get(pid)
            .ok_or_else(|| LifecycleError::NotFound(pid.to_string()))?;
        let prior = record.state;

        let loaded_here = !rt.loaded.contains_key(pid);
        if loaded_here && let Err(e) = self.load_locked(rt, pid, opts).await {
            if !matches!(e, LifecycleError::DeadlineExceeded { .. }) {
                self.record_disabled(pid);
            }
            return Err(e);
        }

        match self.activate_loaded(rt, &record, induced_by, opts).await {
            Ok(details) => Ok(details),
            Err(e @ LifecycleError::DeadlineExceeded { .. }) => {
                self.teardown(rt, pid, loaded_here);
                self.set_state(pid, prior);
                Err(e)
            }
            Err(e @ LifecycleError::Config(_)) => {
                // The activation happened but could not be recorded; undo it.
                self.revert_activation(rt, pid, opts).await;
                self.teardown(rt, pid, loaded_here);
                self.set_state(pid, prior);
                Err(e)
            }
            Err(e) => {
                self.teardown(rt, pid, true);
                self.fail(pid, FailedPhase::Activate, &e);
                self.record_disabled(pid);
                Err(e)
            }
        }
    }

    async fn activate_loaded(
        &self,
        rt: &mut Runtime,
        record: &PluginRecord,
        induced_by: Option<&str>,
        opts: &OpOptions,
    ) -> Result<Value, LifecycleError> {
        let pid = record.id.as_str();
        let manifest = record.manifest.as_ref().ok_or_else(|| LifecycleError::InvalidState {
            plugin: pid.to_string(),
            state: record.state,
            operation: "enable",
        })?;
        let (instance, ctx) = {
            let loaded = rt
                .loaded
                .get(pid)
                .ok_or_else(|| LifecycleError::NotFound(pid.to_string()))?;
            (loaded.instance.clone(), loaded.context.clone())
        };

        let schemas_applied = with_deadline(
            opts.deadline,
            pid,
            "enable",
            self.host.apply_schemas(pid, manifest),
        )
        .await??;

        if manifest.declares_hook(Hook::Activate.name())
            && let Some(instance) = &instance
        {
            self.run_hook(pid, Hook::Activate, instance.clone(), ctx.clone(), opts.deadline)
                .await?;
        }

        let handlers = instance
            .as_ref()
            .map(|i| i.handlers(&ctx))
            .unwrap_or_default();
        let routes = match self.host.mount(pid, manifest, &handlers) {
            Ok(routes) => routes,
            Err(e) => {
                // on_activate already ran; give the plugin a chance to release what it took.
                self.revert_activation(rt, pid, opts).await;
                return Err(e.into());
            }
        };
        let services = self.host.publish_services(&ctx);

        let now = Utc::now().to_rfc3339();
        self.config.update_plugin_entry(
            pid,
            vec![
                ("enabled", YamlValue::Bool(true)),
                ("enabledAt", YamlValue::from(now)),
                (
                    "enabledByDependency",
                    induced_by.map(YamlValue::from).unwrap_or(YamlValue::Null),
                ),
                (
                    "path",
                    YamlValue::from(record.directory_path.display().to_string()),
                ),
                ("origin", YamlValue::from(record.origin.as_str())),
            ],
        )?;

        self.registry.update(pid, |r| {
            r.transition(PluginState::Active);
            r.enabled_by_dependency = induced_by.map(str::to_string);
            r.last_error = None;
        });
        info!(plugin = %pid, routes, services = services.len(), "plugin activated");

        let mut details = json!({
            "routes": routes,
            "services": services,
            "schemasApplied": schemas_applied,
        });
        if let Some(by) = induced_by {
            details["enabledByDependency"] = json!(by);
        }
        Ok(details)
    }

    /// Run `on_deactivate` for an activation that is being rolled back.
    async fn revert_activation(&self, rt: &Runtime, pid: &str, opts: &OpOptions) {
        if let Some((instance, ctx)) = hook_target(rt, pid, self.declares(pid, Hook::Deactivate))
            && let Err(e) = self
                .run_hook(pid, Hook::Deactivate, instance, ctx, opts.deadline)
                .await
        {
            warn!(plugin = %pid, error = %e, "on_deactivate failed while reverting activation");
        }
    }

    async fn load_locked(
        &self,
        rt: &mut Runtime,
        pid: &str,
        opts: &OpOptions,
    ) -> Result<(), LifecycleError> {
        let record = self
            .registry
            .get(pid)
            .ok_or_else(|| LifecycleError::NotFound(pid.to_string()))?;
        let prior = record.state;
        let Some(manifest) = record.manifest.as_ref() else {
            return Err(LifecycleError::InvalidState {
                plugin: pid.to_string(),
                state: prior,
                operation: "load",
            });
        };

        let mut handle = match &record.module {
            Some(name) => match self.registry.modules().get(name) {
                Some(factory) => Some(ModuleHandle::new(name.clone(), factory)),
                None => {
                    let err = LifecycleError::from(PluginError::unknown_module(
                        pid,
                        name,
                        &self.registry.modules().names(),
                    ));
                    self.fail(pid, FailedPhase::Load, &err);
                    return Err(err);
                }
            },
            None => None,
        };
        let instance = handle.as_mut().map(ModuleHandle::load);

        let settings = self.config.plugin_entry(pid).and_then(|e| e.config);
        let context = Arc::new(self.host.build_context(&record, settings.as_ref()));

        if manifest.declares_hook(Hook::Load.name())
            && let Some(instance) = &instance
            && let Err(e) = self
                .run_hook(pid, Hook::Load, instance.clone(), context.clone(), opts.deadline)
                .await
        {
            if let Some(handle) = handle.as_mut() {
                handle.unload();
            }
            match e {
                LifecycleError::DeadlineExceeded { .. } => self.set_state(pid, prior),
                _ => self.fail(pid, FailedPhase::Load, &e),
            }
            return Err(e);
        }

        rt.loaded.insert(
            pid.to_string(),
            LoadedPlugin {
                handle,
                instance,
                context,
            },
        );
        self.set_state(pid, PluginState::Loaded);
        Ok(())
    }

    async fn disable_locked(
        &self,
        rt: &mut Runtime,
        id: &str,
        opts: &OpOptions,
    ) -> Result<Transition, LifecycleError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        match record.state {
            PluginState::Active => {}
            PluginState::Disabled => {
                return Ok(Transition::unchanged(id, "disable", PluginState::Disabled));
            }
            state => {
                return Err(LifecycleError::InvalidState {
                    plugin: id.to_string(),
                    state,
                    operation: "disable",
                });
            }
        }

        let dependents: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|r| r.state == PluginState::Active && r.dependencies().iter().any(|d| d == id))
            .map(|r| r.id)
            .collect();
        if !dependents.is_empty() {
            warn!(plugin = %id, dependents = ?dependents, "disabling a plugin other active plugins depend on");
        }

        let mut hook_error = None;
        if let Some((instance, ctx)) = hook_target(rt, id, self.declares(id, Hook::Deactivate)) {
            match self
                .run_hook(id, Hook::Deactivate, instance, ctx, opts.deadline)
                .await
            {
                Ok(()) => {}
                Err(e @ LifecycleError::DeadlineExceeded { .. }) => return Err(e),
                Err(e) => {
                    warn!(plugin = %id, error = %e, "on_deactivate failed; disabling anyway");
                    hook_error = Some(e.to_string());
                }
            }
        }

        self.teardown(rt, id, true);
        self.registry.update(id, |r| {
            r.transition(PluginState::Disabled);
            r.last_error = hook_error.clone();
            r.enabled_by_dependency = None;
        });
        info!(plugin = %id, "plugin disabled");

        self.config.update_plugin_entry(
            id,
            vec![
                ("enabled", YamlValue::Bool(false)),
                ("disabledAt", YamlValue::from(Utc::now().to_rfc3339())),
                ("enabledByDependency", YamlValue::Null),
            ],
        )?;

        Ok(Transition {
            dependents,
            hook_error,
            ..Transition::changed(id, "disable", PluginState::Disabled)
        })
    }

    async fn reload_locked(
        &self,
        rt: &mut Runtime,
        id: &str,
        opts: &OpOptions,
    ) -> Result<Transition, LifecycleError> {
        let state = self
            .registry
            .state(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        match state {
            PluginState::Active => {
                let disabled = self.disable_locked(rt, id, opts).await;
                self.audit_result("disable", id, opts, &disabled).await;
                let disabled = disabled?;

                self.rescan_plugin(id)?;
                let enabled = self.enable_locked(rt, id, opts).await;
                self.audit_result("enable", id, opts, &enabled).await;
                let enabled = enabled?;

                Ok(Transition {
                    dependents: disabled.dependents,
                    hook_error: disabled.hook_error,
                    ..Transition {
                        action: "reload",
                        ..enabled
                    }
                })
            }
            PluginState::Failed => {
                self.teardown(rt, id, true);
                self.rescan_plugin(id)?;
                let enabled = self.enable_locked(rt, id, opts).await;
                self.audit_result("enable", id, opts, &enabled).await;
                Ok(Transition {
                    action: "reload",
                    ..enabled?
                })
            }
            PluginState::Discovered | PluginState::Disabled | PluginState::Loaded => {
                self.teardown(rt, id, true);
                let record = self.rescan_plugin(id)?;
                Ok(Transition {
                    changed: state != record.state,
                    ..Transition::unchanged(id, "reload", record.state)
                })
            }
            PluginState::Missing | PluginState::Suppressed => Err(LifecycleError::InvalidState {
                plugin: id.to_string(),
                state,
                operation: "reload",
            }),
        }
    }

    fn update_settings_locked(&self, id: &str, settings: &Value) -> Result<Value, LifecycleError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let manifest = record.manifest.as_ref().ok_or_else(|| LifecycleError::InvalidState {
            plugin: id.to_string(),
            state: record.state,
            operation: "configure",
        })?;

        manifest
            .check_settings(settings)
            .map_err(|problems| PluginError::invalid(id, problems.join("; ")))?;

        let yaml = serde_yml::to_value(settings).map_err(|e| PluginError::invalid(id, e.to_string()))?;
        self.config
            .update_plugin_entry(id, vec![("config", yaml)])?;

        Ok(manifest.resolve_config(Some(settings)))
    }

    /// Re-read the plugin directory. A manifest that no longer loads is an error.
    fn rescan_plugin(&self, id: &str) -> Result<PluginRecord, LifecycleError> {
        let record = self.registry.rescan_one(id, &self.config)?;
        if record.state == PluginState::Failed {
            return Err(PluginError::invalid(
                id,
                record
                    .load_error
                    .clone()
                    .unwrap_or_else(|| "manifest failed to load".to_string()),
            )
            .into());
        }
        Ok(record)
    }

    /// Run one hook on its own task, bounded by `deadline`.
    async fn run_hook(
        &self,
        pid: &str,
        hook: Hook,
        instance: Arc<dyn Plugin>,
        ctx: Arc<PluginContext>,
        deadline: Option<Instant>,
    ) -> Result<(), LifecycleError> {
        let mut task = tokio::spawn(async move {
            match hook {
                Hook::Load => instance.on_load(&ctx).await,
                Hook::Activate => instance.on_activate(&ctx).await,
                Hook::Deactivate => instance.on_deactivate(&ctx).await,
            }
        });

        let joined = match deadline {
            None => (&mut task).await,
            Some(deadline) => match timeout_at(deadline, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    warn!(plugin = %pid, hook = hook.name(), "hook exceeded the deadline");
                    return Err(LifecycleError::DeadlineExceeded {
                        plugin: pid.to_string(),
                        operation: hook.name(),
                    });
                }
            },
        };

        let message = match joined {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.message().to_string(),
            Err(join) if join.is_panic() => {
                format!("panicked: {}", panic_message(join.into_panic().as_ref()))
            }
            Err(join) => join.to_string(),
        };
        error!(plugin = %pid, hook = hook.name(), error = %message, "plugin hook failed");
        Err(LifecycleError::HookFailure {
            plugin: pid.to_string(),
            hook: hook.name(),
            message,
        })
    }

    fn declares(&self, pid: &str, hook: Hook) -> bool {
        self.registry
            .get(pid)
            .and_then(|r| r.manifest)
            .is_some_and(|m| m.declares_hook(hook.name()))
    }

    /// Unmount routes, withdraw services, and optionally drop the module.
    fn teardown(&self, rt: &mut Runtime, pid: &str, unload: bool) {
        self.host.unmount(pid);
        self.host.withdraw_services(pid);
        if unload && let Some(mut loaded) = rt.loaded.remove(pid) {
            if let Some(handle) = loaded.handle.as_mut() {
                handle.unload();
            }
        }
    }

    fn set_state(&self, pid: &str, state: PluginState) {
        self.registry.update(pid, |r| r.transition(state));
    }

    fn fail(&self, pid: &str, phase: FailedPhase, err: &LifecycleError) {
        error!(plugin = %pid, phase = phase.as_str(), error = %err, "plugin failed");
        self.registry.update(pid, |r| r.fail(phase, err.to_string()));
    }

    /// Record `enabled = false` after a failed activation. Errors are logged only.
    fn record_disabled(&self, pid: &str) {
        if let Err(e) = self.config.update_plugin_entry(
            pid,
            vec![
                ("enabled", YamlValue::Bool(false)),
                ("disabledAt", YamlValue::from(Utc::now().to_rfc3339())),
            ],
        ) {
            warn!(plugin = %pid, error = %e, "failed to record disabled state in config");
        }
    }

    async fn audit(&self, action: &str, plugin: &str, opts: &OpOptions, details: Value) {
        self.host
            .audit()
            .record(AuditRecord::new(action, plugin, opts.actor.clone(), details))
            .await;
    }

    async fn audit_failure(&self, action: &str, plugin: &str, opts: &OpOptions, err: &LifecycleError) {
        let mut details = json!({
            "error": err.to_string(),
            "kind": err.kind(),
        });
        if let (Some(extra), Some(map)) = (err.details(), details.as_object_mut())
            && let Value::Object(extra) = extra
        {
            map.extend(extra);
        }
        self.audit(action, plugin, opts, details).await;
    }

    async fn audit_result(
        &self,
        action: &str,
        plugin: &str,
        opts: &OpOptions,
        result: &Result<Transition, LifecycleError>,
    ) {
        match result {
            Ok(t) => {
                let mut details = json!({ "state": t.state, "changed": t.changed });
                if !t.changed {
                    details["noop"] = json!(true);
                }
                if !t.dependents.is_empty() {
                    details["dependents"] = json!(t.dependents);
                }
                if let Some(hook_error) = &t.hook_error {
                    details["hookError"] = json!(hook_error);
                }
                if let Some(by) = self
                    .registry
                    .get(plugin)
                    .and_then(|r| r.enabled_by_dependency)
                    && t.state == PluginState::Active
                {
                    details["enabledByDependency"] = json!(by);
                }
                self.audit(action, plugin, opts, details).await;
            }
            Err(e) => self.audit_failure(action, plugin, opts, e).await,
        }
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

fn hook_target(
    rt: &Runtime,
    pid: &str,
    declared: bool,
) -> Option<(Arc<dyn Plugin>, Arc<PluginContext>)> {
    if !declared {
        return None;
    }
    let loaded = rt.loaded.get(pid)?;
    Some((loaded.instance.clone()?, loaded.context.clone()))
}

async fn with_deadline<F: Future>(
    deadline: Option<Instant>,
    plugin: &str,
    operation: &'static str,
    fut: F,
) -> Result<F::Output, LifecycleError> {
    match deadline {
        None => Ok(fut.await),
        Some(deadline) => timeout_at(deadline, fut)
            .await
            .map_err(|_| LifecycleError::DeadlineExceeded {
                plugin: plugin.to_string(),
                operation,
            }),
    }
}
