//! Config store error types.

use std::path::PathBuf;

use keystone_sdk::ErrorKind;
use thiserror::Error;

/// Errors raised while loading, querying or persisting the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("config file {}: failed to read: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Writing the temp file, syncing it, or renaming it over the target failed.
    #[error("config file {}: atomic write failed: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A required value is present but malformed.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// Legacy root `plugins` and multi-project `projects` both present.
    #[error(
        "config file {}: both a root 'plugins' mapping and a 'projects' sequence are present; \
         remove one of them",
        path.display()
    )]
    SchemaMismatch { path: PathBuf },

    /// A dot path could not be resolved for writing.
    #[error("config path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// The in-memory tree could not be rendered as YAML.
    #[error("failed to serialize config: {0}")]
    Serialize(String),
}

impl ConfigError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Read { .. } | Self::Write { .. } | Self::Serialize(_) => ErrorKind::Io,
            Self::Invalid(_) | Self::InvalidPath { .. } => ErrorKind::Validation,
            Self::SchemaMismatch { .. } => ErrorKind::Corruption,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_mismatch_tells_operator_what_to_do() {
        let err = ConfigError::SchemaMismatch {
            path: PathBuf::from("/etc/keystone/config.yml"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/etc/keystone/config.yml"));
        assert!(msg.contains("remove one of them"));
    }

    #[test]
    fn write_failures_are_io() {
        let err = ConfigError::Write {
            path: PathBuf::from("config.yml"),
            source: std::io::Error::other("disk full"),
        };
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
