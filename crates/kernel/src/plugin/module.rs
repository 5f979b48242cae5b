//! Compiled-in plugin modules.
//!
//! Plugins are native Rust crates linked into the host binary. Each one is
//! registered under a module name; a plugin directory's entry file selects
//! the module by that name. Loading creates a fresh instance from the
//! factory, unloading drops it, so a reload never sees state from the
//! previous instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use keystone_sdk::{Plugin, PluginFactory};

/// Module name to factory.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Register a module built by a plain constructor.
    pub fn register_fn<P, F>(&mut self, name: impl Into<String>, build: F)
    where
        P: Plugin,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.register(name, Arc::new(move || Arc::new(build()) as Arc<dyn Plugin>));
    }

    pub fn with<P, F>(mut self, name: impl Into<String>, build: F) -> Self
    where
        P: Plugin,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.register_fn(name, build);
        self
    }

    pub fn get(&self, name: &str) -> Option<PluginFactory> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

/// A plugin's module with an explicit load/unload pair.
pub struct ModuleHandle {
    name: String,
    factory: PluginFactory,
    instance: Option<Arc<dyn Plugin>>,
}

impl ModuleHandle {
    pub fn new(name: impl Into<String>, factory: PluginFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            instance: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a fresh instance, replacing any previous one.
    pub fn load(&mut self) -> Arc<dyn Plugin> {
        let instance = (self.factory)();
        self.instance = Some(instance.clone());
        instance
    }

    /// Drop the instance. Returns whether one was loaded.
    pub fn unload(&mut self) -> bool {
        self.instance.take().is_some()
    }

    pub fn instance(&self) -> Option<&Arc<dyn Plugin>> {
        self.instance.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.instance.is_some()
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
