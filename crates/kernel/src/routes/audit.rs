//! Audit trail listing.

use axum::{
    Json, Router,
    extract::{Query, State},
    middleware::from_fn_with_state,
    routing::get,
};
use serde::Deserialize;

use crate::error::AppResult;
use crate::middleware::auth::require_admin;
use crate::services::audit::AuditEntry;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub plugin_id: Option<String>,
    pub limit: Option<i64>,
}

/// GET /audit?plugin_id=&limit=
async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> AppResult<Json<Vec<AuditEntry>>> {
    let entries = state
        .audit()
        .recent(query.plugin_id.as_deref(), query.limit.unwrap_or(50))
        .await?;
    Ok(Json(entries))
}

pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/audit", get(list_audit))
        .route_layer(from_fn_with_state(state.gate().clone(), require_admin))
}
