//! The plugin module contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::MethodRouter;

use crate::context::PluginContext;
use crate::error::HookError;
use crate::types::HookSet;

/// Handlers a plugin exports, keyed by the `handler_ref` its manifest uses.
///
/// Each handler is a state-free `MethodRouter` (build it with
/// `axum::routing::any(handler).with_state(state)`); the host restricts it to
/// the method declared in the manifest when it mounts the route.
pub type HandlerSet = HashMap<String, MethodRouter>;

/// A native plugin module.
///
/// Hooks are straight-line: any asynchronous work a hook starts must be
/// finished before it returns. The host only calls hooks the manifest
/// declares, and refuses manifests that declare hooks missing from
/// [`Plugin::hooks`].
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Manifest fields exported by the module. Merged over `plugin.json`;
    /// the exported values win on conflict.
    fn manifest(&self) -> Option<serde_json::Value> {
        None
    }

    /// Hooks this module exports.
    fn hooks(&self) -> HookSet {
        HookSet::default()
    }

    async fn on_load(&self, _ctx: &PluginContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_activate(&self, _ctx: &PluginContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_deactivate(&self, _ctx: &PluginContext) -> Result<(), HookError> {
        Ok(())
    }

    /// Route handlers, resolved against the manifest's `routes` at mount time.
    fn handlers(&self, _ctx: &PluginContext) -> HandlerSet {
        HandlerSet::new()
    }
}

/// Creates a fresh module instance. Called on every load, so reload gets a
/// new instance rather than a cache-invalidated old one.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;
