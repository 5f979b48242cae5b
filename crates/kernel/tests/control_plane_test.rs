//! Integration tests for the HTTP control plane and plugin dispatch.
//!
//! Requests go through the real router (`routes::app`) with `tower::oneshot`,
//! authenticated with the configured service token or a signed JWT.

mod common;

use axum::http::StatusCode;
use keystone_kernel::middleware::auth::SERVICE_ACCOUNT;
use keystone_kernel::plugin::{ModuleRegistry, PluginState};
use keystone_test_utils::{HookBehavior, PluginDir, ScriptedPlugin};
use serde_json::json;

use common::{BASE_CONFIG, Caller, TestApp, plugin_root, workspace, write_plugins};

fn bank_dir() -> PluginDir {
    PluginDir::new("bank")
        .module("bank")
        .hooks(&["on_activate"])
        .set(
            "config_schema",
            json!({ "greeting": { "type": "string", "default": "hello" } }),
        )
        .route("GET", "/ping", "ping", &[])
        .route("GET", "/me", "ping", &["auth"])
        .route("POST", "/vault", "ping", &["admin"])
}

async fn bank_app(extra: &[PluginDir], config: &str) -> (TestApp, ScriptedPlugin) {
    let dir = workspace();
    let mut dirs = vec![bank_dir()];
    dirs.extend_from_slice(extra);
    write_plugins(&dir, &dirs);

    let bank = ScriptedPlugin::new("bank");
    let shop = ScriptedPlugin::new("shop");
    let factory = bank.clone();
    let modules = ModuleRegistry::new()
        .with("bank", move || factory.clone())
        .with("shop", move || shop.clone());
    (TestApp::start(dir, config, modules).await, bank)
}

#[tokio::test]
async fn health_is_public_but_plugin_health_is_not() {
    let (app, _) = bank_app(&[], BASE_CONFIG).await;

    let (status, body) = app.request(Caller::Anonymous, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], true);

    let (status, body) = app
        .request(Caller::Anonymous, "GET", "/health/plugins", None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");

    let (status, _) = app.request(Caller::User, "GET", "/health/plugins", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.admin("GET", "/health/plugins", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["counts"]["discovered"], 1);
}

#[tokio::test]
async fn control_plane_requires_an_admin() {
    let (app, _) = bank_app(&[], BASE_CONFIG).await;

    for (method, uri) in [
        ("GET", "/plugins"),
        ("POST", "/plugins/bank/enable"),
        ("GET", "/plugins/bank/config"),
        ("GET", "/audit"),
    ] {
        let (status, _) = app.request(Caller::Anonymous, method, uri, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
        let (status, body) = app.request(Caller::User, method, uri, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
        assert_eq!(body["kind"], "forbidden");
    }
    assert_eq!(app.state.registry().state("bank"), Some(PluginState::Discovered));
}

#[tokio::test]
async fn enable_mounts_routes_and_dispatch_reaches_the_plugin() {
    let (app, _) = bank_app(&[], BASE_CONFIG).await;

    let (status, _) = app.request(Caller::Anonymous, "GET", "/bank/ping", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app.admin("POST", "/plugins/bank/enable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "active");
    assert_eq!(body["changed"], true);

    let (status, body) = app.request(Caller::Anonymous, "GET", "/bank/ping", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plugin"], "bank");
    assert_eq!(body["config"]["greeting"], "hello");

    // Middleware tags are enforced per route.
    let (status, _) = app.request(Caller::Anonymous, "GET", "/bank/me", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app.request(Caller::User, "GET", "/bank/me", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.request(Caller::User, "POST", "/bank/vault", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app.admin("POST", "/bank/vault", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.admin("GET", "/plugins/bank", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mounted"], true);
    assert_eq!(body["services"], json!(["bank.status"]));

    let (status, body) = app.admin("POST", "/plugins/bank/disable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "disabled");

    let (status, body) = app.request(Caller::Anonymous, "GET", "/bank/ping", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn lifecycle_errors_use_the_shared_taxonomy() {
    let (app, bank) = bank_app(
        &[PluginDir::new("shop").module("shop").depends_on(&["vault"])],
        BASE_CONFIG,
    )
    .await;

    let (status, body) = app.admin("POST", "/plugins/nope/enable", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, body) = app.admin("POST", "/plugins/shop/enable", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "dependency_unmet");
    assert_eq!(body["details"]["blocking"], json!(["vault"]));

    bank.set_on_activate(HookBehavior::Sleep(std::time::Duration::from_secs(5)));
    let (status, body) = app
        .admin("POST", "/plugins/bank/enable?timeout_ms=50", None)
        .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["kind"], "timeout");
    assert_eq!(app.state.registry().state("bank"), Some(PluginState::Discovered));

    bank.set_on_activate(HookBehavior::Fail("vault sealed".into()));
    let (status, body) = app.admin("POST", "/plugins/bank/enable", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "hook_failure");
    assert!(body["message"].as_str().unwrap().contains("vault sealed"));

    // Failed plugins show up in the catalog with their phase.
    let (_, body) = app.admin("GET", "/plugins", None).await;
    let row = body["plugins"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["id"] == "bank")
        .unwrap()
        .clone();
    assert_eq!(row["state"], "failed");
    assert_eq!(row["failed_phase"], "activate");

    let (_, body) = app.admin("GET", "/health/plugins", None).await;
    assert_eq!(body["status"], "degraded");
}

#[tokio::test]
async fn settings_round_trip_and_apply_on_reload() {
    let (app, _) = bank_app(&[], BASE_CONFIG).await;
    app.admin("POST", "/plugins/bank/enable", None).await;

    let (status, body) = app.admin("GET", "/plugins/bank/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settings"], json!({}));
    assert_eq!(body["resolved"]["greeting"], "hello");
    assert_eq!(body["schema"]["greeting"]["type"], "string");

    let (status, body) = app
        .admin("PUT", "/plugins/bank/config", Some(json!({ "greeting": 7 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (status, _) = app
        .admin("PUT", "/plugins/bank/config", Some(json!(["greeting"])))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .admin("PUT", "/plugins/bank/config", Some(json!({ "greeting": "ahoy" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resolved"]["greeting"], "ahoy");

    // The running instance keeps its context until reloaded.
    let (_, body) = app.request(Caller::Anonymous, "GET", "/bank/ping", None).await;
    assert_eq!(body["config"]["greeting"], "hello");

    let (status, body) = app.admin("POST", "/plugins/bank/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "reload");
    let (_, body) = app.request(Caller::Anonymous, "GET", "/bank/ping", None).await;
    assert_eq!(body["config"]["greeting"], "ahoy");

    // Persisted under the current project.
    let on_disk = app.config_on_disk();
    assert_eq!(
        on_disk["projects"][0]["plugins"]["bank"]["config"]["greeting"]
            .as_str(),
        Some("ahoy")
    );
}

#[tokio::test]
async fn missing_plugins_are_listed_suppressed_and_forgotten() {
    let config = r#"
dev:
  enable_logging: false
  enable_cors: false
projects:
  - id: default
    database: keystone.db
    plugins:
      ghost:
        enabled: true
"#;
    let (app, _) = bank_app(&[], config).await;

    let (status, body) = app.admin("GET", "/plugins/missing", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["missing"][0]["id"], "ghost");

    let (status, body) = app.admin("POST", "/plugins/ghost/enable", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");

    let (status, body) = app.admin("POST", "/plugins/ghost/suppress", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "suppressed");
    let (_, body) = app.admin("GET", "/plugins/missing", None).await;
    assert_eq!(body["missing"], json!([]));

    let (status, _) = app.admin("DELETE", "/plugins/ghost", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.admin("GET", "/plugins/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(
        app.config_on_disk()["projects"][0]["plugins"]
            .get("ghost")
            .is_none()
    );
}

#[tokio::test]
async fn validate_flags_active_plugins_with_inactive_dependencies() {
    let (app, _) = bank_app(
        &[PluginDir::new("shop").module("shop").depends_on(&["bank"])],
        BASE_CONFIG,
    )
    .await;

    let (status, body) = app.admin("POST", "/plugins/shop/enable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["activated"], json!(["bank", "shop"]));

    let (_, body) = app.admin("POST", "/plugins/validate", None).await;
    assert_eq!(body["valid"], true);

    let (_, body) = app.admin("POST", "/plugins/bank/disable", None).await;
    assert_eq!(body["dependents"], json!(["shop"]));

    let (_, body) = app.admin("POST", "/plugins/validate", None).await;
    assert_eq!(body["valid"], false);
    assert_eq!(body["issues"][0]["plugin"], "shop");
}

#[tokio::test]
async fn rescan_picks_up_new_directories() {
    let (app, _) = bank_app(&[], BASE_CONFIG).await;
    let (status, _) = app.admin("GET", "/plugins/notes", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    PluginDir::new("notes")
        .schema("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT)")
        .write(&plugin_root(&app.dir))
        .unwrap();

    let (status, body) = app.admin("POST", "/plugins/rescan", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    // A plugin without a module is still enabled: its schemas are applied.
    let (status, body) = app.admin("POST", "/plugins/notes/enable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "active");
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'notes'",
    )
    .fetch_one(app.state.db())
    .await
    .unwrap();
    assert_eq!(tables, 1);
}

#[tokio::test]
async fn audit_trail_is_queryable() {
    let (app, _) = bank_app(&[], BASE_CONFIG).await;
    app.admin("POST", "/plugins/bank/enable", None).await;
    app.admin("POST", "/plugins/bank/enable", None).await;

    let (status, body) = app.admin("GET", "/audit?plugin_id=bank&limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    // Newest first: the second enable was a no-op.
    assert_eq!(entries[0]["details"]["noop"], true);
    assert_eq!(entries[1]["details"]["state"], "active");
    for entry in entries {
        assert_eq!(entry["action"], "enable");
        assert_eq!(entry["admin_user"], SERVICE_ACCOUNT);
    }
}

#[tokio::test]
async fn legacy_config_is_migrated_and_booted() {
    let legacy = r#"
server:
  port: 4100
database:
  file: legacy.db
plugins:
  bank:
    enabled: true
    config:
      greeting: hey
"#;
    let (app, _) = bank_app(&[], legacy).await;

    let report = app.state.config().report();
    let backup = report.migrated_backup.clone().unwrap();
    assert!(backup.exists());
    assert_eq!(app.state.config().server().port, 4100);
    assert_eq!(
        app.state.config().current_project().unwrap().database.as_deref(),
        Some("legacy.db")
    );

    let boot = app.state.lifecycle().boot().await;
    assert_eq!(boot.activated, vec!["bank"]);
    let (_, body) = app.request(Caller::Anonymous, "GET", "/bank/ping", None).await;
    assert_eq!(body["config"]["greeting"], "hey");

    let on_disk = app.config_on_disk();
    assert!(on_disk.get("plugins").is_none());
    assert_eq!(on_disk["projects"][0]["plugins"]["bank"]["enabled"].as_bool(), Some(true));
    assert!(
        on_disk["auth"]["service_token"]
            .as_str()
            .is_some_and(|t| !t.is_empty())
    );
}
