//! Plugin route table.
//!
//! Each active plugin owns one axum [`Router`] nested under `/<plugin>`.
//! The kernel router's fallback looks up the first path segment here and
//! forwards the request, so plugins can be mounted and unmounted at runtime
//! without rebuilding the kernel router.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::Method,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter},
};
use keystone_sdk::{ApiError, HandlerSet};
use parking_lot::RwLock;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tracing::debug;

use super::error::HostError;
use crate::middleware::auth::{AuthGate, require_admin, require_auth};
use crate::plugin::RouteSpec;

/// Mounted plugin routers keyed by plugin name.
pub struct RouteTable {
    mounted: RwLock<HashMap<String, Router>>,
    gate: Arc<dyn AuthGate>,
}

impl RouteTable {
    pub fn new(gate: Arc<dyn AuthGate>) -> Self {
        Self {
            mounted: RwLock::new(HashMap::new()),
            gate,
        }
    }

    pub fn gate(&self) -> &Arc<dyn AuthGate> {
        &self.gate
    }

    /// Build and mount the router for `plugin`, replacing any previous one.
    ///
    /// Returns the number of routes mounted.
    pub fn mount(
        &self,
        plugin: &str,
        routes: &[RouteSpec],
        handlers: &HandlerSet,
    ) -> Result<usize, HostError> {
        let router = build_router(plugin, routes, handlers, &self.gate)?;
        self.mounted.write().insert(plugin.to_string(), router);
        debug!(plugin = %plugin, routes = routes.len(), "mounted plugin routes");
        Ok(routes.len())
    }

    /// Remove `plugin`'s router. Requests already dispatched finish normally.
    pub fn unmount(&self, plugin: &str) -> bool {
        let removed = self.mounted.write().remove(plugin).is_some();
        if removed {
            debug!(plugin = %plugin, "unmounted plugin routes");
        }
        removed
    }

    pub fn is_mounted(&self, plugin: &str) -> bool {
        self.mounted.read().contains_key(plugin)
    }

    pub fn mounted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mounted.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Router owning `path`, by its first segment.
    fn router_for(&self, path: &str) -> Option<Router> {
        let prefix = path.trim_start_matches('/').split('/').next()?;
        self.mounted.read().get(prefix).cloned()
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("mounted", &self.mounted())
            .finish_non_exhaustive()
    }
}

/// Kernel router fallback: forward to the owning plugin or answer 404.
pub async fn dispatch(State(table): State<Arc<RouteTable>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(router) = table.router_for(&path) else {
        return ApiError::not_found(format!("no route for {path}")).into_response();
    };
    match router.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

fn build_router(
    plugin: &str,
    routes: &[RouteSpec],
    handlers: &HandlerSet,
    gate: &Arc<dyn AuthGate>,
) -> Result<Router, HostError> {
    let invalid = |route: &RouteSpec, reason: String| HostError::InvalidRoute {
        plugin: plugin.to_string(),
        method: route.method.clone(),
        path: route.path.clone(),
        reason,
    };

    // Routes sharing a path are combined into one method router, together
    // with the methods it already answers (including implicit preflights).
    let mut by_path: Vec<(String, MethodRouter, Vec<Method>)> = Vec::new();

    for route in routes {
        let handler = handlers
            .get(&route.handler_ref)
            .cloned()
            .ok_or_else(|| HostError::UnresolvedHandler {
                plugin: plugin.to_string(),
                method: route.method.clone(),
                path: route.path.clone(),
                handler_ref: route.handler_ref.clone(),
            })?;
        let method = Method::from_bytes(route.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| invalid(route, e.to_string()))?;
        let filter = MethodFilter::try_from(method.clone()).map_err(|e| invalid(route, e.to_string()))?;

        let cors = route.middleware_tags.iter().any(|t| t == "cors");
        let handler = apply_tags(handler, &route.middleware_tags, gate);

        let slot = match by_path.iter().position(|(p, _, _)| p == &route.path) {
            Some(index) => index,
            None => {
                by_path.push((route.path.clone(), MethodRouter::new(), Vec::new()));
                by_path.len() - 1
            }
        };
        let (_, method_router, methods) = &mut by_path[slot];
        if methods.contains(&method) {
            let reason = if method == Method::OPTIONS {
                "OPTIONS is already answered by a cors route on this path".to_string()
            } else {
                format!("{method} is already routed on this path")
            };
            return Err(invalid(route, reason));
        }
        methods.push(method.clone());

        let mut combined = std::mem::take(method_router).on_service(filter, handler.clone());
        if cors && method != Method::OPTIONS && !methods.contains(&Method::OPTIONS) {
            // Preflight requests must reach the CORS layer.
            combined = combined.on_service(MethodFilter::OPTIONS, handler);
            methods.push(Method::OPTIONS);
        }
        *method_router = combined;
    }

    let prefix = format!("/{plugin}");
    let built = catch_unwind(AssertUnwindSafe(move || {
        let inner = by_path
            .into_iter()
            .fold(Router::new(), |router, (path, method_router, _)| {
                router.route(&path, method_router)
            });
        Router::new().nest(&prefix, inner)
    }));

    built.map_err(|panic| HostError::MountFailed {
        plugin: plugin.to_string(),
        message: panic_message(panic.as_ref()),
    })
}

/// Wrap a handler in the layers its middleware tags name.
fn apply_tags(handler: MethodRouter, tags: &[String], gate: &Arc<dyn AuthGate>) -> MethodRouter {
    let has = |tag: &str| tags.iter().any(|t| t == tag);
    let mut handler = handler;
    if has("admin") {
        handler = handler.layer(from_fn_with_state(gate.clone(), require_admin));
    } else if has("auth") {
        handler = handler.layer(from_fn_with_state(gate.clone(), require_auth));
    }
    if has("cors") {
        handler = handler.layer(CorsLayer::permissive());
    }
    handler
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::any;
    use http_body_util::BodyExt;
    use keystone_sdk::Principal;

    struct AllowAll;

    impl AuthGate for AllowAll {
        fn authenticate(&self, headers: &axum::http::HeaderMap) -> Option<Principal> {
            headers
                .contains_key("x-user")
                .then(|| Principal::new("tester", headers.contains_key("x-admin")))
        }
    }

    fn route(method: &str, path: &str, handler: &str, tags: &[&str]) -> RouteSpec {
        RouteSpec {
            method: method.into(),
            path: path.into(),
            handler_ref: handler.into(),
            middleware_tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn handlers() -> HandlerSet {
        let mut set = HandlerSet::new();
        set.insert("hello".into(), any(|| async { "hello" }));
        set.insert("echo".into(), any(|body: String| async move { body }));
        set
    }

    fn table() -> Arc<RouteTable> {
        Arc::new(RouteTable::new(Arc::new(AllowAll)))
    }

    async fn call(table: &Arc<RouteTable>, request: Request<Body>) -> (StatusCode, String) {
        let response = dispatch(State(table.clone()), request).await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn mounted_routes_answer_under_prefix() {
        let table = table();
        table
            .mount(
                "shop",
                &[route("GET", "/hello", "hello", &[]), route("POST", "/hello", "echo", &[])],
                &handlers(),
            )
            .unwrap();

        assert_eq!(call(&table, get("/shop/hello")).await, (StatusCode::OK, "hello".into()));

        let post = Request::builder()
            .method("POST")
            .uri("/shop/hello")
            .body(Body::from("ping"))
            .unwrap();
        assert_eq!(call(&table, post).await, (StatusCode::OK, "ping".into()));

        let delete = Request::builder()
            .method("DELETE")
            .uri("/shop/hello")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&table, delete).await.0, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unmount_removes_routes() {
        let table = table();
        table
            .mount("shop", &[route("GET", "/hello", "hello", &[])], &handlers())
            .unwrap();
        assert!(table.unmount("shop"));
        assert_eq!(call(&table, get("/shop/hello")).await.0, StatusCode::NOT_FOUND);
        assert!(!table.unmount("shop"));
    }

    #[tokio::test]
    async fn tags_enforce_principals() {
        let table = table();
        table
            .mount(
                "shop",
                &[
                    route("GET", "/me", "hello", &["auth"]),
                    route("GET", "/admin", "hello", &["admin"]),
                ],
                &handlers(),
            )
            .unwrap();

        assert_eq!(call(&table, get("/shop/me")).await.0, StatusCode::UNAUTHORIZED);

        let user = Request::builder()
            .uri("/shop/me")
            .header("x-user", "1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&table, user).await.0, StatusCode::OK);

        let user_on_admin = Request::builder()
            .uri("/shop/admin")
            .header("x-user", "1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(&table, user_on_admin).await.0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn unresolved_handler_is_reported() {
        let table = table();
        let err = table
            .mount("shop", &[route("GET", "/x", "missing", &[])], &handlers())
            .unwrap_err();
        assert!(matches!(err, HostError::UnresolvedHandler { .. }));
        assert!(!table.is_mounted("shop"));
    }

    #[test]
    fn overlapping_routes_fail_instead_of_panicking() {
        let table = table();
        let err = table
            .mount(
                "shop",
                &[route("GET", "/{a}", "hello", &[]), route("GET", "/{b}", "hello", &[])],
                &handlers(),
            )
            .unwrap_err();
        assert!(matches!(err, HostError::MountFailed { .. }));
    }

    #[test]
    fn explicit_options_after_cors_route_is_rejected() {
        let table = table();
        let err = table
            .mount(
                "shop",
                &[
                    route("GET", "/x", "hello", &["cors"]),
                    route("OPTIONS", "/x", "hello", &[]),
                ],
                &handlers(),
            )
            .unwrap_err();
        match err {
            HostError::InvalidRoute { method, path, .. } => {
                assert_eq!(method, "OPTIONS");
                assert_eq!(path, "/x");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!table.is_mounted("shop"));
    }

    #[test]
    fn same_method_twice_on_a_path_is_rejected() {
        let table = table();
        let err = table
            .mount(
                "shop",
                &[route("GET", "/x", "hello", &[]), route("get", "/x", "echo", &[])],
                &handlers(),
            )
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidRoute { .. }));
    }

    #[tokio::test]
    async fn explicit_options_before_cors_route_is_kept() {
        let table = table();
        table
            .mount(
                "shop",
                &[
                    route("OPTIONS", "/x", "echo", &[]),
                    route("GET", "/x", "hello", &["cors"]),
                ],
                &handlers(),
            )
            .unwrap();
        assert_eq!(call(&table, get("/shop/x")).await, (StatusCode::OK, "hello".into()));
    }
}
