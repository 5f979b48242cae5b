//! Health check endpoints.
//!
//! `GET /health` returns 200 OK if the project database is reachable,
//! 503 Service Unavailable otherwise. `GET /health/plugins` groups the
//! catalog by state and requires an admin principal.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::middleware::auth::require_admin;
use crate::plugin::PluginState;
use crate::state::AppState;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: bool,
}

#[derive(Debug, Serialize)]
struct PluginHealth {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct PluginHealthResponse {
    status: &'static str,
    counts: BTreeMap<&'static str, usize>,
    plugins: BTreeMap<&'static str, Vec<PluginHealth>>,
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = state.db_healthy().await;

    let (status_code, status) = if database {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (status_code, Json(HealthResponse { status, database }))
}

/// Grouped plugin snapshot. Degraded when anything is Failed or Missing.
async fn plugin_health(State(state): State<AppState>) -> Json<PluginHealthResponse> {
    let mut plugins: BTreeMap<&'static str, Vec<PluginHealth>> = BTreeMap::new();
    for record in state.registry().list() {
        plugins
            .entry(record.state.as_str())
            .or_default()
            .push(PluginHealth {
                error: record.error_message().map(str::to_string),
                id: record.id,
            });
    }

    let counts = plugins.iter().map(|(state, list)| (*state, list.len())).collect();
    let degraded = [PluginState::Failed, PluginState::Missing]
        .iter()
        .any(|s| plugins.contains_key(s.as_str()));

    Json(PluginHealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        counts,
        plugins,
    })
}

/// Create the health check router.
pub fn router(state: &AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/health/plugins", get(plugin_health))
        .route_layer(from_fn_with_state(state.gate().clone(), require_admin));

    Router::new()
        .route("/health", get(health_check))
        .merge(admin)
}
