//! Keystone Plugin SDK
//!
//! Types and traits shared by the Keystone runtime and the native plugins it
//! hosts. A plugin crate implements [`Plugin`], declares itself in a
//! `plugin.json` / `plugin.toml` pair on disk, and receives a
//! [`PluginContext`] from the host when it is loaded.

pub mod context;
pub mod error;
pub mod plugin;
pub mod types;

pub use context::{ContextParts, PluginContext, ServiceRegistry};
pub use error::{ApiError, ErrorKind, HookError};
pub use plugin::{HandlerSet, Plugin, PluginFactory};
pub use types::{AuditRecord, AuditSink, HookSet, Principal};

// Re-exported so plugin crates build handlers against the same axum version.
#[doc(hidden)]
pub use axum;

pub mod prelude {
    pub use crate::context::{PluginContext, ServiceRegistry};
    pub use crate::error::{ApiError, ErrorKind, HookError};
    pub use crate::plugin::{HandlerSet, Plugin};
    pub use crate::types::{AuditRecord, AuditSink, HookSet, Principal};
}
