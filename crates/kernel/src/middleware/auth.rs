//! Bearer token authentication.
//!
//! Checks `Authorization: Bearer <token>` headers against the configured
//! service-account token or an HS256 JWT signed with `auth.jwt_secret`, and
//! stores the resulting [`Principal`] in request extensions.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use keystone_sdk::{ApiError, ErrorKind, Principal};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Subject of the service account authenticated by `auth.service_token`.
pub const SERVICE_ACCOUNT: &str = "service-account";

/// The authentication collaborator.
pub trait AuthGate: Send + Sync {
    /// Resolve the caller from request headers, or `None` if unauthenticated.
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal>;
}

/// JWT claims accepted by [`TokenAuthGate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub admin: bool,
    pub exp: u64,
}

/// Default gate: service token or HS256 JWT.
pub struct TokenAuthGate {
    service_token: String,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenAuthGate {
    pub fn new(service_token: impl Into<String>, jwt_secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = ["exp", "sub"].iter().map(|s| s.to_string()).collect();
        Self {
            service_token: service_token.into(),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation,
        }
    }

    fn verify(&self, token: &str) -> Option<Principal> {
        if !self.service_token.is_empty()
            && bool::from(token.as_bytes().ct_eq(self.service_token.as_bytes()))
        {
            return Some(Principal::new(SERVICE_ACCOUNT, true));
        }

        match jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(Principal::new(data.claims.sub, data.claims.admin)),
            Err(e) => {
                debug!(error = %e, "invalid bearer token");
                None
            }
        }
    }
}

impl AuthGate for TokenAuthGate {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))?;
        self.verify(token.trim())
    }
}

impl std::fmt::Debug for TokenAuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthGate").finish_non_exhaustive()
    }
}

/// Middleware for the `auth` tag: any authenticated principal.
pub async fn require_auth(
    State(gate): State<Arc<dyn AuthGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(principal) = gate.authenticate(request.headers()) else {
        return unauthorized();
    };
    request.extensions_mut().insert(principal);
    next.run(request).await
}

/// Middleware for the `admin` tag: a principal with the admin flag.
pub async fn require_admin(
    State(gate): State<Arc<dyn AuthGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(principal) = gate.authenticate(request.headers()) else {
        return unauthorized();
    };
    if !principal.admin {
        debug!(subject = %principal.subject, "non-admin principal refused");
        return ApiError::new(ErrorKind::Forbidden, "admin privileges required").into_response();
    }
    request.extensions_mut().insert(principal);
    next.run(request).await
}

fn unauthorized() -> Response {
    let mut response =
        ApiError::new(ErrorKind::Unauthorized, "authentication required").into_response();
    response.headers_mut().insert(
        axum::http::header::WWW_AUTHENTICATE,
        axum::http::HeaderValue::from_static("Bearer"),
    );
    response
}
