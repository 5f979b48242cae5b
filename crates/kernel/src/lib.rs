//! Keystone Kernel Library
//!
//! Config store, plugin registry, lifecycle controller, and the host
//! surface plugins run against. The `keystone` binary wires these into an
//! HTTP server; integration tests drive them directly.

pub mod cli;
pub mod config;
pub mod config_store;
pub mod db;
pub mod error;
pub mod host;
pub mod middleware;
pub mod plugin;
pub mod routes;
pub mod services;
pub mod state;

pub use state::AppState;

use plugin::ModuleRegistry;

/// Plugin modules compiled into this binary.
pub fn builtin_modules() -> ModuleRegistry {
    ModuleRegistry::new().with(keystone_economy::MODULE_NAME, keystone_economy::EconomyPlugin::new)
}
