//! Error kinds shared by the runtime and plugins.
//!
//! Every typed error in the workspace classifies itself into an
//! [`ErrorKind`]. The kind alone decides the HTTP status at the boundary,
//! so plugins and the control plane answer failures the same way.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Inputs violate stated constraints.
    Validation,
    /// Named entity absent.
    NotFound,
    /// Already rolled back, id collision, invalid state for the operation.
    Conflict,
    /// Optimistic-lock failure; the caller may retry.
    Concurrent,
    /// Balance would go negative.
    Insufficient,
    /// Lifecycle precondition failed.
    DependencyUnmet,
    /// A plugin hook raised.
    HookFailure,
    /// Storage or filesystem failure.
    Io,
    /// Config file unparsable.
    Corruption,
    /// An operator deadline expired.
    Timeout,
    /// No credential or an invalid one.
    Unauthorized,
    /// Authenticated but not allowed.
    Forbidden,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// HTTP status for this kind.
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Validation | Self::Insufficient | Self::DependencyUnmet => {
                StatusCode::BAD_REQUEST
            }
            Self::Conflict | Self::Concurrent => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::HookFailure | Self::Io | Self::Corruption | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the caller is expected to retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Concurrent)
    }

    /// Whether the message may leak internals and must not reach clients.
    fn is_opaque(self) -> bool {
        matches!(self, Self::Io | Self::Corruption | Self::Internal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Concurrent => "concurrent",
            Self::Insufficient => "insufficient",
            Self::DependencyUnmet => "dependency_unmet",
            Self::HookFailure => "hook_failure",
            Self::Io => "io",
            Self::Corruption => "corruption",
            Self::Timeout => "timeout",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error ready to be rendered at the HTTP boundary.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();

        // In development the log carries the details; clients only see the kind.
        let message = if self.kind.is_opaque() {
            tracing::error!(kind = %self.kind, error = %self.message, "request failed");
            "internal server error"
        } else {
            self.message.as_str()
        };

        let body = ApiErrorBody {
            error: message,
            kind: self.kind,
            details: if self.kind.is_opaque() {
                None
            } else {
                self.details.as_ref()
            },
            retryable: self.kind.is_retryable(),
        };

        let mut response = (status, Json(body)).into_response();
        if self.kind.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// Error returned by a plugin lifecycle hook.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<sqlx::Error> for HookError {
    fn from(e: sqlx::Error) -> Self {
        Self::new(format!("database error: {e}"))
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(ErrorKind::Validation.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Concurrent.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::Insufficient.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorKind::DependencyUnmet.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorKind::HookFailure.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ErrorKind::Io.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn concurrent_carries_retry_hint() {
        let response = ApiError::new(ErrorKind::Concurrent, "balance changed").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["retryable"], true);
        assert_eq!(body["kind"], "concurrent");
    }

    #[tokio::test]
    async fn internal_errors_are_opaque() {
        let response = ApiError::new(ErrorKind::Io, "disk /var/db exploded")
            .with_details(serde_json::json!({"path": "/var/db"}))
            .into_response();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "internal server error");
        assert!(body.get("details").is_none());
    }
}
