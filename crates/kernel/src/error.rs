//! Application error types.

use axum::response::{IntoResponse, Response};
use keystone_sdk::{ApiError, ErrorKind};
use thiserror::Error;

use crate::config_store::ConfigError;
use crate::plugin::{LifecycleError, PluginError};

/// Application errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Lifecycle(e) => {
                let api = ApiError::new(e.kind(), e.to_string());
                match e.details() {
                    Some(details) => api.with_details(details),
                    None => api,
                }
            }
            AppError::Plugin(e) => ApiError::new(e.kind(), e.to_string()),
            AppError::Config(e) => ApiError::new(e.kind(), e.to_string()),
            AppError::NotFound(what) => ApiError::not_found(format!("{what} not found")),
            AppError::BadRequest(msg) => ApiError::validation(msg),
            AppError::Database(e) => ApiError::new(ErrorKind::Io, e.to_string()),
            AppError::Internal(e) => ApiError::internal(format!("{e:#}")),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::StatusCode;

    use super::*;
    use crate::plugin::PluginState;

    #[test]
    fn lifecycle_errors_keep_their_status() {
        let conflict = AppError::from(LifecycleError::InvalidState {
            plugin: "economy".into(),
            state: PluginState::Missing,
            operation: "enable",
        });
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let unmet = ApiError::from(AppError::from(LifecycleError::DependencyUnmet {
            plugin: "shop".into(),
            blocking: vec!["economy".into()],
        }));
        assert_eq!(unmet.kind, ErrorKind::DependencyUnmet);
        assert_eq!(unmet.details.unwrap()["blocking"][0], "economy");

        let timeout = AppError::from(LifecycleError::DeadlineExceeded {
            plugin: "economy".into(),
            operation: "enable",
        });
        assert_eq!(timeout.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn database_errors_are_opaque() {
        let response = AppError::Database(sqlx::Error::PoolTimedOut).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
