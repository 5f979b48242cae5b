//! Integration tests for plugin lifecycle transitions.
//!
//! ## Test Coverage
//!
//! - Dependency-aware enable, cycles, and non-cascading disable
//! - Hook failures, panics, deadlines, and route mount failures
//! - Missing plugins: suppress and forget
//! - Startup boot from config, reload, toggle
//! - Serialization of concurrent operations

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keystone_kernel::plugin::{
    FailedPhase, LifecycleError, ModuleRegistry, OpOptions, PluginState,
};
use keystone_test_utils::{CallLog, HookBehavior, PluginDir, ScriptedPlugin};
use parking_lot::Mutex;
use serde_json::json;

use common::{BASE_CONFIG, TestApp, workspace, write_plugins};

const ALL_HOOKS: &[&str] = &["on_load", "on_activate", "on_deactivate"];

/// A plugin directory backed by the scripted module of the same name.
fn scripted_dir(name: &str) -> PluginDir {
    PluginDir::new(name)
        .module(name)
        .hooks(ALL_HOOKS)
        .route("GET", "/ping", "ping", &[])
}

/// One scripted module per name, all writing to one call log.
fn scripted_modules(names: &[&str]) -> (ModuleRegistry, HashMap<String, ScriptedPlugin>, CallLog) {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut modules = ModuleRegistry::new();
    let mut plugins = HashMap::new();
    for name in names {
        let plugin = ScriptedPlugin::new(name).with_log(log.clone());
        let factory = plugin.clone();
        modules.register_fn(*name, move || factory.clone());
        plugins.insert(name.to_string(), plugin);
    }
    (modules, plugins, log)
}

async fn app_with(dirs: &[PluginDir], names: &[&str], config: &str) -> (TestApp, HashMap<String, ScriptedPlugin>, CallLog) {
    let dir = workspace();
    write_plugins(&dir, dirs);
    let (modules, plugins, log) = scripted_modules(names);
    (TestApp::start(dir, config, modules).await, plugins, log)
}

fn state_of(app: &TestApp, id: &str) -> Option<PluginState> {
    app.state.registry().state(id)
}

#[tokio::test]
async fn enable_activates_inactive_dependencies_first() {
    let (app, _, log) = app_with(
        &[scripted_dir("bank"), scripted_dir("shop").depends_on(&["bank"])],
        &["bank", "shop"],
        BASE_CONFIG,
    )
    .await;

    let transition = app
        .state
        .lifecycle()
        .enable("shop", OpOptions::by("ops"))
        .await
        .unwrap();
    assert!(transition.changed);
    assert_eq!(transition.activated, vec!["bank", "shop"]);

    assert_eq!(
        log.lock().clone(),
        vec![
            "bank:on_load",
            "bank:on_activate",
            "shop:on_load",
            "shop:on_activate"
        ]
    );
    assert_eq!(state_of(&app, "bank"), Some(PluginState::Active));
    assert_eq!(state_of(&app, "shop"), Some(PluginState::Active));

    let bank = app.state.registry().get("bank").unwrap();
    assert_eq!(bank.enabled_by_dependency.as_deref(), Some("shop"));
    let entry = app.state.config().plugin_entry("bank").unwrap();
    assert!(entry.enabled);
    assert_eq!(entry.enabled_by_dependency.as_deref(), Some("shop"));
    assert!(entry.enabled_at.is_some());

    // The dependency's activation is audited on its own, naming the cause.
    let trail = app.audit_trail("bank").await;
    let enable = trail.iter().find(|e| e.action == "enable").unwrap();
    assert_eq!(enable.details["enabledByDependency"], "shop");
    assert_eq!(enable.admin_user.as_deref(), Some("ops"));

    // Services are published under the plugin's namespace.
    let services = app.state.host().runtime_services().names();
    assert!(services.contains(&"bank.status".to_string()));
    assert!(services.contains(&"shop.status".to_string()));
}

#[tokio::test]
async fn disable_reports_dependents_without_cascading() {
    let (app, _, _) = app_with(
        &[scripted_dir("bank"), scripted_dir("shop").depends_on(&["bank"])],
        &["bank", "shop"],
        BASE_CONFIG,
    )
    .await;
    let lifecycle = app.state.lifecycle();
    lifecycle.enable("shop", OpOptions::system()).await.unwrap();

    let transition = lifecycle.disable("bank", OpOptions::by("ops")).await.unwrap();
    assert_eq!(transition.state, PluginState::Disabled);
    assert_eq!(transition.dependents, vec!["shop"]);
    assert_eq!(state_of(&app, "shop"), Some(PluginState::Active));

    let entry = app.state.config().plugin_entry("bank").unwrap();
    assert!(!entry.enabled);
    assert!(entry.disabled_at.is_some());
    assert!(entry.enabled_by_dependency.is_none());
    assert!(!app.state.routes().is_mounted("bank"));
    assert!(
        !app.state
            .host()
            .runtime_services()
            .names()
            .contains(&"bank.status".to_string())
    );

    let trail = app.audit_trail("bank").await;
    let disable = trail.iter().rfind(|e| e.action == "disable").unwrap();
    assert_eq!(disable.details["dependents"], json!(["shop"]));

    // Disabling again is a recorded no-op.
    let again = lifecycle.disable("bank", OpOptions::by("ops")).await.unwrap();
    assert!(!again.changed);
    let trail = app.audit_trail("bank").await;
    assert_eq!(trail.last().unwrap().details["noop"], true);
}

#[tokio::test]
async fn unmet_dependency_blocks_enable() {
    let (app, _, log) = app_with(
        &[scripted_dir("shop").depends_on(&["vault"])],
        &["shop"],
        BASE_CONFIG,
    )
    .await;

    let err = app
        .state
        .lifecycle()
        .enable("shop", OpOptions::system())
        .await
        .unwrap_err();
    match err {
        LifecycleError::DependencyUnmet { plugin, blocking } => {
            assert_eq!(plugin, "shop");
            assert_eq!(blocking, vec!["vault"]);
        }
        other => panic!("expected DependencyUnmet, got {other:?}"),
    }
    assert_eq!(state_of(&app, "shop"), Some(PluginState::Discovered));
    assert!(log.lock().is_empty(), "no hook may run when dependencies are unmet");

    let trail = app.audit_trail("shop").await;
    assert_eq!(trail.last().unwrap().details["kind"], "dependency_unmet");
}

#[tokio::test]
async fn failing_activate_hook_marks_plugin_failed_until_reload() {
    let (app, plugins, _) = app_with(&[scripted_dir("bank")], &["bank"], BASE_CONFIG).await;
    let bank = &plugins["bank"];
    bank.set_on_activate(HookBehavior::Fail("ledger unavailable".into()));

    let err = app
        .state
        .lifecycle()
        .enable("bank", OpOptions::system())
        .await
        .unwrap_err();
    match &err {
        LifecycleError::HookFailure { hook, message, .. } => {
            assert_eq!(*hook, "on_activate");
            assert_eq!(message, "ledger unavailable");
        }
        other => panic!("expected HookFailure, got {other:?}"),
    }

    let record = app.state.registry().get("bank").unwrap();
    assert_eq!(record.state, PluginState::Failed);
    assert_eq!(record.failed_phase, Some(FailedPhase::Activate));
    assert!(record.error_message().unwrap().contains("ledger unavailable"));
    assert!(!app.state.routes().is_mounted("bank"));
    assert!(!app.state.config().plugin_entry("bank").unwrap().enabled);

    // Enable refuses a Failed plugin; reload is the recovery path.
    let refused = app
        .state
        .lifecycle()
        .enable("bank", OpOptions::system())
        .await
        .unwrap_err();
    assert!(matches!(refused, LifecycleError::InvalidState { .. }));

    bank.set_on_activate(HookBehavior::Succeed);
    let reloaded = app
        .state
        .lifecycle()
        .reload("bank", OpOptions::system())
        .await
        .unwrap();
    assert_eq!(reloaded.action, "reload");
    assert_eq!(reloaded.state, PluginState::Active);
    assert!(app.state.routes().is_mounted("bank"));
    assert!(app.state.registry().get("bank").unwrap().last_error.is_none());
}

#[tokio::test]
async fn panicking_hook_is_contained() {
    let (app, plugins, _) = app_with(
        &[scripted_dir("bank"), scripted_dir("shop")],
        &["bank", "shop"],
        BASE_CONFIG,
    )
    .await;
    plugins["bank"].set_on_load(HookBehavior::Panic);

    let err = app
        .state
        .lifecycle()
        .enable("bank", OpOptions::system())
        .await
        .unwrap_err();
    match &err {
        LifecycleError::HookFailure { hook, message, .. } => {
            assert_eq!(*hook, "on_load");
            assert!(message.contains("panicked"), "message was {message}");
        }
        other => panic!("expected HookFailure, got {other:?}"),
    }
    let record = app.state.registry().get("bank").unwrap();
    assert_eq!(record.state, PluginState::Failed);
    assert_eq!(record.failed_phase, Some(FailedPhase::Load));

    // The controller keeps serving other plugins.
    let shop = app
        .state
        .lifecycle()
        .enable("shop", OpOptions::system())
        .await
        .unwrap();
    assert_eq!(shop.state, PluginState::Active);
}

#[tokio::test]
async fn deadline_leaves_prior_state() {
    let (app, plugins, _) = app_with(&[scripted_dir("bank")], &["bank"], BASE_CONFIG).await;
    let bank = &plugins["bank"];
    bank.set_on_activate(HookBehavior::Sleep(Duration::from_secs(5)));

    let err = app
        .state
        .lifecycle()
        .enable(
            "bank",
            OpOptions::by("ops").with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::DeadlineExceeded { .. }));

    let record = app.state.registry().get("bank").unwrap();
    assert_eq!(record.state, PluginState::Discovered);
    assert!(record.failed_phase.is_none());
    assert!(!app.state.routes().is_mounted("bank"));
    assert!(app.state.config().plugin_entry("bank").is_none());

    let trail = app.audit_trail("bank").await;
    assert_eq!(trail.last().unwrap().details["kind"], "timeout");

    bank.set_on_activate(HookBehavior::Succeed);
    let enabled = app
        .state
        .lifecycle()
        .enable("bank", OpOptions::system())
        .await
        .unwrap();
    assert_eq!(enabled.state, PluginState::Active);
}

#[tokio::test]
async fn failing_deactivate_hook_still_disables() {
    let (app, plugins, _) = app_with(&[scripted_dir("bank")], &["bank"], BASE_CONFIG).await;
    let lifecycle = app.state.lifecycle();
    lifecycle.enable("bank", OpOptions::system()).await.unwrap();
    plugins["bank"].set_on_deactivate(HookBehavior::Fail("flush failed".into()));

    let transition = lifecycle.disable("bank", OpOptions::system()).await.unwrap();
    assert_eq!(transition.state, PluginState::Disabled);
    assert!(transition.hook_error.unwrap().contains("flush failed"));

    let record = app.state.registry().get("bank").unwrap();
    assert_eq!(record.state, PluginState::Disabled);
    assert!(record.last_error.unwrap().contains("flush failed"));
    assert!(!app.state.routes().is_mounted("bank"));
}

#[tokio::test]
async fn missing_plugins_can_be_suppressed_and_forgotten() {
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
        path: plugins/ghost
"#;
    let (app, _, _) = app_with(&[], &[], config).await;
    let lifecycle = app.state.lifecycle();

    assert_eq!(app.state.scan_report().missing, 1);
    assert_eq!(state_of(&app, "ghost"), Some(PluginState::Missing));

    let boot = lifecycle.boot().await;
    assert!(boot.activated.is_empty());

    let err = lifecycle.enable("ghost", OpOptions::system()).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidState {
            state: PluginState::Missing,
            ..
        }
    ));

    let suppressed = lifecycle.suppress("ghost", OpOptions::by("ops")).await.unwrap();
    assert_eq!(suppressed.state, PluginState::Suppressed);
    assert!(app.state.config().plugin_entry("ghost").unwrap().suppressed);

    lifecycle.forget("ghost", OpOptions::by("ops")).await.unwrap();
    assert!(app.state.registry().get("ghost").is_none());
    assert!(app.state.config().plugin_entry("ghost").is_none());

    let err = lifecycle.forget("ghost", OpOptions::by("ops")).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotFound(_)));
}

#[tokio::test]
async fn forget_refuses_installed_plugins() {
    let (app, _, _) = app_with(&[scripted_dir("bank")], &["bank"], BASE_CONFIG).await;
    let err = app
        .state
        .lifecycle()
        .forget("bank", OpOptions::system())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }));
    assert!(app.state.registry().get("bank").is_some());
}

#[tokio::test]
async fn boot_enables_configured_plugins_in_dependency_order() {
    let config = r#"
dev:
  enable_logging: false
  enable_cors: false
projects:
  - id: default
    database: keystone.db
    plugins:
      shop:
        enabled: true
      bank:
        enabled: true
      broken:
        enabled: true
      idle:
        enabled: false
"#;
    let (app, plugins, log) = app_with(
        &[
            scripted_dir("shop").depends_on(&["bank"]),
            scripted_dir("bank"),
            scripted_dir("broken"),
            scripted_dir("idle"),
        ],
        &["shop", "bank", "broken", "idle"],
        config,
    )
    .await;
    plugins["broken"].set_on_activate(HookBehavior::Fail("bad state".into()));

    let report = app.state.lifecycle().boot().await;
    assert!(report.activated.contains(&"bank".to_string()));
    assert!(report.activated.contains(&"shop".to_string()));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken");

    let calls = log.lock().clone();
    let bank_at = calls.iter().position(|c| c == "bank:on_activate").unwrap();
    let shop_at = calls.iter().position(|c| c == "shop:on_activate").unwrap();
    assert!(bank_at < shop_at);
    assert!(!calls.iter().any(|c| c.starts_with("idle:")));

    assert_eq!(state_of(&app, "idle"), Some(PluginState::Disabled));
    assert_eq!(state_of(&app, "broken"), Some(PluginState::Failed));
}

#[tokio::test]
async fn shutdown_deactivates_dependents_first() {
    let (app, _, log) = app_with(
        &[scripted_dir("bank"), scripted_dir("shop").depends_on(&["bank"])],
        &["bank", "shop"],
        BASE_CONFIG,
    )
    .await;
    app.state
        .lifecycle()
        .enable("shop", OpOptions::system())
        .await
        .unwrap();
    log.lock().clear();

    app.state.lifecycle().shutdown().await;
    assert_eq!(
        log.lock().clone(),
        vec!["shop:on_deactivate", "bank:on_deactivate"]
    );
    // Config still says enabled so the next start brings them back.
    assert!(app.state.config().plugin_entry("shop").unwrap().enabled);
}

#[tokio::test]
async fn reload_picks_up_manifest_changes() {
    let dir = workspace();
    let plugin = scripted_dir("bank");
    write_plugins(&dir, &[plugin.clone()]);
    let (modules, _, log) = scripted_modules(&["bank"]);
    let app = TestApp::start(dir, BASE_CONFIG, modules).await;
    let lifecycle = app.state.lifecycle();
    lifecycle.enable("bank", OpOptions::system()).await.unwrap();

    plugin
        .set("version", json!("2.0.0"))
        .write(&common::plugin_root(&app.dir))
        .unwrap();
    log.lock().clear();

    let transition = lifecycle.reload("bank", OpOptions::system()).await.unwrap();
    assert_eq!(transition.state, PluginState::Active);
    let record = app.state.registry().get("bank").unwrap();
    assert_eq!(record.manifest.unwrap().version, "2.0.0");
    assert_eq!(
        log.lock().clone(),
        vec!["bank:on_deactivate", "bank:on_load", "bank:on_activate"]
    );
}

#[tokio::test]
async fn toggle_flips_between_active_and_disabled() {
    let (app, _, _) = app_with(&[scripted_dir("bank")], &["bank"], BASE_CONFIG).await;
    let lifecycle = app.state.lifecycle();

    // Toggle only moves between the two settled states.
    let err = lifecycle.toggle("bank", OpOptions::system()).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }));

    lifecycle.enable("bank", OpOptions::system()).await.unwrap();
    let off = lifecycle.toggle("bank", OpOptions::system()).await.unwrap();
    assert_eq!(off.state, PluginState::Disabled);
    let on = lifecycle.toggle("bank", OpOptions::system()).await.unwrap();
    assert_eq!(on.state, PluginState::Active);
}

#[tokio::test]
async fn settings_are_checked_against_the_schema() {
    let dir = workspace();
    write_plugins(
        &dir,
        &[scripted_dir("bank").set(
            "config_schema",
            json!({ "greeting": { "type": "string", "default": "hello" } }),
        )],
    );
    let (modules, _, _) = scripted_modules(&["bank"]);
    let app = TestApp::start(dir, BASE_CONFIG, modules).await;
    let lifecycle = app.state.lifecycle();

    let (raw, resolved) = lifecycle.settings("bank").unwrap();
    assert_eq!(raw, json!({}));
    assert_eq!(resolved["greeting"], "hello");

    let err = lifecycle
        .update_settings("bank", json!({ "greeting": 5 }), OpOptions::system())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("greeting"));

    let err = lifecycle
        .update_settings("bank", json!({ "colour": "red" }), OpOptions::system())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown setting"));

    let resolved = lifecycle
        .update_settings("bank", json!({ "greeting": "hi" }), OpOptions::by("ops"))
        .await
        .unwrap();
    assert_eq!(resolved["greeting"], "hi");
    let (raw, _) = lifecycle.settings("bank").unwrap();
    assert_eq!(raw, json!({ "greeting": "hi" }));

    let trail = app.audit_trail("bank").await;
    let update = trail.iter().rfind(|e| e.action == "config_update").unwrap();
    assert_eq!(update.details["keys"], json!(["greeting"]));
}

#[tokio::test]
async fn concurrent_operations_are_serialized() {
    let (app, _, log) = app_with(&[scripted_dir("bank")], &["bank"], BASE_CONFIG).await;
    let lifecycle = app.state.lifecycle().clone();

    let mut tasks = Vec::new();
    for i in 0..12 {
        let lifecycle = lifecycle.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                lifecycle.enable("bank", OpOptions::system()).await
            } else {
                lifecycle.disable("bank", OpOptions::system()).await
            }
        }));
    }
    for task in tasks {
        // Disable before any enable is a harmless InvalidState from Discovered.
        match task.await.unwrap() {
            Ok(_) | Err(LifecycleError::InvalidState { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    // Hooks never interleave: every activation is closed by a deactivation
    // before the next load.
    let calls = log.lock().clone();
    let mut active = false;
    for call in &calls {
        match call.as_str() {
            "bank:on_activate" => {
                assert!(!active, "activated twice without deactivating: {calls:?}");
                active = true;
            }
            "bank:on_deactivate" => {
                assert!(active, "deactivated while inactive: {calls:?}");
                active = false;
            }
            _ => {}
        }
    }

    let state = state_of(&app, "bank").unwrap();
    assert_eq!(state == PluginState::Active, active);
    assert_eq!(app.state.routes().is_mounted("bank"), active);
    let entry = app.state.config().plugin_entry("bank");
    assert_eq!(entry.map(|e| e.enabled).unwrap_or(false), active);
}

#[tokio::test]
async fn dependency_cycle_blocks_enable_and_changes_nothing() {
    let (app, _, log) = app_with(
        &[
            scripted_dir("a").depends_on(&["b"]),
            scripted_dir("b").depends_on(&["a"]),
        ],
        &["a", "b"],
        BASE_CONFIG,
    )
    .await;

    let err = app
        .state
        .lifecycle()
        .enable("a", OpOptions::by("ops"))
        .await
        .unwrap_err();
    match &err {
        LifecycleError::Cycle { plugins } => assert_eq!(plugins, &vec!["a", "b"]),
        other => panic!("expected Cycle, got {other:?}"),
    }

    assert_eq!(state_of(&app, "a"), Some(PluginState::Discovered));
    assert_eq!(state_of(&app, "b"), Some(PluginState::Discovered));
    assert!(log.lock().is_empty(), "no hook may run on a cycle");
    assert!(app.state.routes().mounted().is_empty());
    assert!(app.state.host().runtime_services().names().is_empty());
    assert!(app.state.config().plugin_entry("a").is_none());

    let trail = app.audit_trail("a").await;
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, "enable");
    assert_eq!(trail[0].details["kind"], "validation");
    assert!(app.audit_trail("b").await.is_empty());
}

#[tokio::test]
async fn failed_mount_runs_deactivate_before_teardown() {
    let (app, _, log) = app_with(
        &[scripted_dir("bank").route("GET", "/vault", "open_vault", &[])],
        &["bank"],
        BASE_CONFIG,
    )
    .await;

    let err = app
        .state
        .lifecycle()
        .enable("bank", OpOptions::system())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("open_vault"), "{err}");

    assert_eq!(
        log.lock().clone(),
        vec!["bank:on_load", "bank:on_activate", "bank:on_deactivate"]
    );
    let record = app.state.registry().get("bank").unwrap();
    assert_eq!(record.state, PluginState::Failed);
    assert_eq!(record.failed_phase, Some(FailedPhase::Activate));
    assert!(!app.state.routes().is_mounted("bank"));
    assert!(app.state.host().runtime_services().names().is_empty());

    let trail = app.audit_trail("bank").await;
    assert_eq!(trail.last().unwrap().details["kind"], "validation");
}

#[tokio::test]
async fn preflight_clash_fails_one_plugin_and_boot_continues() {
    let config = r#"
dev:
  enable_logging: false
  enable_cors: false
projects:
  - id: default
    database: keystone.db
    plugins:
      bank:
        enabled: true
      shop:
        enabled: true
"#;
    let (app, _, _) = app_with(
        &[
            scripted_dir("bank"),
            scripted_dir("shop")
                .route("GET", "/cart", "ping", &["cors"])
                .route("OPTIONS", "/cart", "ping", &[]),
        ],
        &["bank", "shop"],
        config,
    )
    .await;

    let shop = app.state.registry().get("shop").unwrap();
    assert_eq!(shop.state, PluginState::Failed);
    assert_eq!(shop.failed_phase, Some(FailedPhase::ManifestLoad));
    assert!(shop.error_message().unwrap().contains("cors"));

    let boot = app.state.lifecycle().boot().await;
    assert_eq!(boot.activated, vec!["bank"]);
    assert_eq!(state_of(&app, "bank"), Some(PluginState::Active));
    assert!(!app.state.routes().is_mounted("shop"));
}

#[tokio::test]
async fn rescan_keeps_runtime_failures() {
    let (app, plugins, _) = app_with(&[scripted_dir("bank")], &["bank"], BASE_CONFIG).await;
    plugins["bank"].set_on_activate(HookBehavior::Fail("ledger unavailable".into()));
    let lifecycle = app.state.lifecycle();
    lifecycle.enable("bank", OpOptions::system()).await.unwrap_err();

    let report = lifecycle.rescan().await;
    assert_eq!(report.failed, 1);
    let record = app.state.registry().get("bank").unwrap();
    assert_eq!(record.state, PluginState::Failed);
    assert_eq!(record.failed_phase, Some(FailedPhase::Activate));
}
