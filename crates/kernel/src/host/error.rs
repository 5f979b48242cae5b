//! Host surface errors.

use keystone_sdk::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    /// A manifest route names a handler the module did not provide.
    #[error("plugin '{plugin}': route {method} {path} references handler '{handler_ref}' which the module does not provide")]
    UnresolvedHandler {
        plugin: String,
        method: String,
        path: String,
        handler_ref: String,
    },

    #[error("plugin '{plugin}': route {method} {path} cannot be mounted: {reason}")]
    InvalidRoute {
        plugin: String,
        method: String,
        path: String,
        reason: String,
    },

    /// Building the plugin router panicked (overlapping or malformed routes).
    #[error("plugin '{plugin}': mounting routes failed: {message}")]
    MountFailed { plugin: String, message: String },

    /// A `schemas`/`indexes` statement failed.
    #[error("plugin '{plugin}': schema statement {index} failed: {source}")]
    Schema {
        plugin: String,
        index: usize,
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnresolvedHandler { .. } | Self::InvalidRoute { .. } => ErrorKind::Validation,
            Self::MountFailed { .. } => ErrorKind::Internal,
            Self::Schema { .. } | Self::Database(_) => ErrorKind::Io,
        }
    }
}
