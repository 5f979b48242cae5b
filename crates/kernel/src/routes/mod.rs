//! HTTP route handlers.

pub mod audit;
pub mod health;
pub mod plugins;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::host::dispatch;
use crate::state::AppState;

/// The kernel router: control plane plus the plugin dispatch fallback.
///
/// Plugin routes are not part of this router. Requests that match no
/// control-plane route fall through to the route table, which forwards
/// `/<plugin>/...` to whichever plugin is mounted under that name.
pub fn app(state: AppState) -> Router {
    let dev = state.config().dev();

    let mut app = Router::new()
        .merge(plugins::router(&state))
        .merge(health::router(&state))
        .merge(audit::router(&state))
        .with_state(state.clone())
        .fallback_service(
            Router::new()
                .fallback(dispatch)
                .with_state(state.routes().clone()),
        );

    // Last added = first executed: TraceLayer → CORS → routes
    if dev.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    if dev.enable_logging {
        app = app.layer(TraceLayer::new_for_http());
    }
    app
}
