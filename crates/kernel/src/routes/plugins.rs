//! Control-plane routes for plugin management.
//!
//! All endpoints require an admin principal. Lifecycle endpoints accept
//! `?timeout_ms=` as the operation deadline.

use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware::from_fn_with_state,
    routing::{get, post},
};
use keystone_sdk::Principal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AppError, AppResult};
use crate::middleware::auth::require_admin;
use crate::plugin::{
    FailedPhase, OpOptions, Origin, PluginRecord, PluginState, ScanReport, Transition,
    ValidationReport, validate_system,
};
use crate::state::AppState;

/// Longest deadline an operator may ask for.
const MAX_TIMEOUT_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Default, Deserialize)]
pub struct LifecycleQuery {
    pub timeout_ms: Option<u64>,
}

impl LifecycleQuery {
    fn options(&self, principal: &Principal) -> OpOptions {
        let opts = OpOptions::by(principal.subject.clone());
        match self.timeout_ms {
            Some(ms) => opts.with_timeout(Duration::from_millis(ms.min(MAX_TIMEOUT_MS))),
            None => opts,
        }
    }
}

/// Catalog row.
#[derive(Debug, Serialize)]
pub struct PluginSummary {
    pub id: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub origin: Origin,
    pub state: PluginState,
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<FailedPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_by_dependency: Option<String>,
    pub directory: String,
}

impl From<&PluginRecord> for PluginSummary {
    fn from(record: &PluginRecord) -> Self {
        Self {
            id: record.id.clone(),
            version: record.manifest.as_ref().map(|m| m.version.clone()),
            description: record.manifest.as_ref().map(|m| m.description.clone()),
            origin: record.origin,
            state: record.state,
            dependencies: record.dependencies().to_vec(),
            failed_phase: record.failed_phase,
            error: record.error_message().map(str::to_string),
            enabled_by_dependency: record.enabled_by_dependency.clone(),
            directory: record.directory_path.display().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PluginDetail {
    #[serde(flatten)]
    pub record: PluginRecord,
    pub mounted: bool,
    /// Active plugins that depend on this one.
    pub dependents: Vec<String>,
    pub services: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PluginConfigView {
    pub plugin: String,
    /// Values stored in the config file.
    pub settings: Value,
    /// Settings merged over the manifest's defaults.
    pub resolved: Value,
    pub schema: Value,
}

/// GET /plugins
async fn list_plugins(State(state): State<AppState>) -> Json<Value> {
    let plugins: Vec<PluginSummary> = state
        .registry()
        .list()
        .iter()
        .map(PluginSummary::from)
        .collect();
    Json(json!({
        "plugins": plugins,
        "warnings": state.registry().warnings(),
    }))
}

/// GET /plugins/missing
///
/// Missing plugins the operator has not suppressed yet.
async fn list_missing(State(state): State<AppState>) -> Json<Value> {
    let missing: Vec<PluginSummary> = state
        .registry()
        .list()
        .iter()
        .filter(|r| r.state == PluginState::Missing)
        .map(PluginSummary::from)
        .collect();
    Json(json!({ "missing": missing }))
}

/// GET /plugins/{id}
async fn get_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PluginDetail>> {
    let record = state
        .registry()
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("plugin '{id}'")))?;

    let dependents = state
        .registry()
        .list()
        .into_iter()
        .filter(|r| r.state == PluginState::Active && r.dependencies().contains(&id))
        .map(|r| r.id)
        .collect();
    let prefix = format!("{id}.");
    let services = state
        .host()
        .runtime_services()
        .names()
        .into_iter()
        .filter(|name| name.starts_with(&prefix))
        .collect();

    Ok(Json(PluginDetail {
        mounted: state.routes().is_mounted(&id),
        record,
        dependents,
        services,
    }))
}

/// POST /plugins/{id}/enable
async fn enable_plugin(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LifecycleQuery>,
) -> AppResult<Json<Transition>> {
    let transition = state
        .lifecycle()
        .enable(&id, query.options(&principal))
        .await?;
    Ok(Json(transition))
}

/// POST /plugins/{id}/disable
async fn disable_plugin(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LifecycleQuery>,
) -> AppResult<Json<Transition>> {
    let transition = state
        .lifecycle()
        .disable(&id, query.options(&principal))
        .await?;
    Ok(Json(transition))
}

/// POST /plugins/{id}/toggle
async fn toggle_plugin(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LifecycleQuery>,
) -> AppResult<Json<Transition>> {
    let transition = state
        .lifecycle()
        .toggle(&id, query.options(&principal))
        .await?;
    Ok(Json(transition))
}

/// POST /plugins/{id}/reload
async fn reload_plugin(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LifecycleQuery>,
) -> AppResult<Json<Transition>> {
    let transition = state
        .lifecycle()
        .reload(&id, query.options(&principal))
        .await?;
    Ok(Json(transition))
}

/// POST /plugins/{id}/suppress
async fn suppress_plugin(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LifecycleQuery>,
) -> AppResult<Json<Transition>> {
    let transition = state
        .lifecycle()
        .suppress(&id, query.options(&principal))
        .await?;
    Ok(Json(transition))
}

/// DELETE /plugins/{id}
///
/// Forgets a Missing or Suppressed plugin's config entry.
async fn forget_plugin(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<LifecycleQuery>,
) -> AppResult<Json<Transition>> {
    let transition = state
        .lifecycle()
        .forget(&id, query.options(&principal))
        .await?;
    Ok(Json(transition))
}

/// GET /plugins/{id}/config
async fn get_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PluginConfigView>> {
    let record = state
        .registry()
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("plugin '{id}'")))?;
    let (settings, resolved) = state
        .lifecycle()
        .settings(&id)
        .ok_or_else(|| AppError::NotFound(format!("plugin '{id}'")))?;
    let schema = record
        .manifest
        .as_ref()
        .map(|m| serde_json::to_value(&m.config_schema))
        .transpose()
        .map_err(|e| AppError::Internal(e.into()))?
        .unwrap_or_else(|| json!({}));

    Ok(Json(PluginConfigView {
        plugin: id,
        settings,
        resolved,
        schema,
    }))
}

/// PUT /plugins/{id}/config
async fn put_config(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(settings): Json<Value>,
) -> AppResult<Json<Value>> {
    if !settings.is_object() {
        return Err(AppError::BadRequest(
            "plugin settings must be a JSON object".to_string(),
        ));
    }
    let resolved = state
        .lifecycle()
        .update_settings(&id, settings, OpOptions::by(principal.subject))
        .await?;
    Ok(Json(json!({
        "plugin": id,
        "resolved": resolved,
        "applies": "on next reload",
    })))
}

/// POST /plugins/validate
async fn validate(State(state): State<AppState>) -> Json<ValidationReport> {
    Json(validate_system(state.registry()))
}

/// POST /plugins/rescan
///
/// Picks up plugin directories added or removed since startup.
async fn rescan(State(state): State<AppState>) -> Json<ScanReport> {
    Json(state.lifecycle().rescan().await)
}

/// Create the plugin control-plane router.
pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/plugins", get(list_plugins))
        .route("/plugins/missing", get(list_missing))
        .route("/plugins/validate", post(validate))
        .route("/plugins/rescan", post(rescan))
        .route("/plugins/{id}", get(get_plugin).delete(forget_plugin))
        .route("/plugins/{id}/enable", post(enable_plugin))
        .route("/plugins/{id}/disable", post(disable_plugin))
        .route("/plugins/{id}/toggle", post(toggle_plugin))
        .route("/plugins/{id}/reload", post(reload_plugin))
        .route("/plugins/{id}/suppress", post(suppress_plugin))
        .route("/plugins/{id}/config", get(get_config).put(put_config))
        .route_layer(from_fn_with_state(state.gate().clone(), require_admin))
}
