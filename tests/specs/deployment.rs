// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deployment engine specs (S5, S6, property 5).

use ember_config::{ConfigPath, ConfigStore, ConfigValue};
use ember_core::{
    deployment_id, DeploymentDoc, DeploymentRecord, DeploymentSource, DeploymentStatus, ErrorKind,
    ServiceState, SystemClock,
};
use ember_daemon::env::{service_config_path, services_root};
use ember_daemon::{
    DeploymentEngine, EmberPaths, EngineCtx, EngineDriver, FakeScriptRunner, NoopBroadcaster,
    ScriptPhase, ScriptRunner, Supervisor, SupervisorConfig, TokenRegistry,
    ValidationBroadcaster,
};
use std::sync::Arc;
use std::time::Duration;

struct Deployer {
    engine: DeploymentEngine,
    store: Arc<ConfigStore>,
    supervisor: Supervisor<SystemClock>,
    runner: Arc<FakeScriptRunner>,
    paths: EmberPaths,
    _dir: tempfile::TempDir,
}

fn deployer(broadcaster: Arc<dyn ValidationBroadcaster>) -> Deployer {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = EmberPaths::new(dir.path());
    std::fs::create_dir_all(paths.recipes_dir()).expect("recipes dir");

    let store = Arc::new(ConfigStore::new());
    let runner = Arc::new(FakeScriptRunner::new());
    let clock = SystemClock::default();
    let (supervisor, driver) = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&runner) as Arc<dyn ScriptRunner>,
        clock.clone(),
        SupervisorConfig { work_root: dir.path().join("work"), ..SupervisorConfig::default() },
    );
    tokio::spawn(driver.run());

    let ctx = EngineCtx {
        store: Arc::clone(&store),
        cache: Arc::new(ember_recipe::RecipeCache::new(paths.recipes_dir())),
        supervisor: supervisor.clone(),
        tokens: Arc::new(TokenRegistry::new(Arc::clone(&store), clock.clone())),
        broadcaster,
        clock,
        paths: paths.clone(),
        os: "linux".to_string(),
        architecture: "x86_64".to_string(),
        settle: Duration::from_secs(30),
    };
    let (engine, engine_driver) = EngineDriver::new(ctx);
    tokio::spawn(engine_driver.run());

    Deployer { engine, store, supervisor, runner, paths, _dir: dir }
}

fn recipe(d: &Deployer, name: &str, version: &str, deps: &[(&str, &str)], defaults: &str) {
    let mut text = format!(
        "RecipeFormatVersion: \"2020-01-25\"\nComponentName: {name}\nComponentVersion: \"{version}\"\n"
    );
    if !defaults.is_empty() {
        text.push_str(&format!(
            "ComponentConfiguration:\n  DefaultConfiguration:\n{defaults}\n"
        ));
    }
    if !deps.is_empty() {
        text.push_str("ComponentDependencies:\n");
        for (dep, req) in deps {
            text.push_str(&format!(
                "  {dep}:\n    VersionRequirement: \"{req}\"\n    DependencyType: HARD\n"
            ));
        }
    }
    text.push_str("Manifests:\n  - Lifecycle:\n      run: ./serve\n");
    std::fs::write(
        d.paths.recipes_dir().join(format!("{name}-{version}.yaml")),
        text,
    )
    .expect("write recipe");
}

fn submit_doc(doc: serde_json::Value) -> DeploymentRecord {
    let doc: DeploymentDoc = serde_json::from_value(doc).expect("doc");
    DeploymentRecord::new(deployment_id(), DeploymentSource::Local, doc, 1)
}

async fn finished(d: &Deployer, id: &str) -> DeploymentRecord {
    for _ in 0..5_000 {
        let path = ConfigPath::parse("deployments").child(id).child("record");
        if let Some(ConfigValue::String(text)) = d.store.get_value(&path) {
            if let Ok(record) = serde_json::from_str::<DeploymentRecord>(&text) {
                if record.status.is_terminal() {
                    return record;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("deployment {id} never finished");
}

/// S5 — a store validator rejects the staged value: the deployment
/// fails, the old value stays, and no lifecycle script ran.
#[tokio::test(start_paused = true)]
async fn validation_rejection_spec_s5() {
    let d = deployer(Arc::new(NoopBroadcaster));
    recipe(&d, "v", "1.0.0", &[], "    port: 8080");
    recipe(&d, "other", "1.0.0", &[], "");

    // First deployment brings v up with defaults.
    let initial = submit_doc(serde_json::json!({
        "components": {"v": {"version": "1.0.0"}, "other": {"version": "1.0.0"}}
    }));
    let initial_id = initial.id.clone();
    d.engine.submit(initial).await.expect("submit");
    assert_eq!(finished(&d, &initial_id).await.status, DeploymentStatus::Succeeded);

    let port = service_config_path("v").child("port");
    d.store.add_validator(&port, |value| match value {
        ConfigValue::Int(port) if *port < 1024 => Err("privileged port".to_string()),
        other => Ok(other.clone()),
    });
    let runs_before = d.runner.invocations().len();

    let rejected = submit_doc(serde_json::json!({
        "components": {
            "v": {"version": "1.0.0", "configurationUpdate": {"MERGE": {"port": 80}}},
            "other": {"version": "1.0.0"}
        }
    }));
    let rejected_id = rejected.id.clone();
    d.engine.submit(rejected).await.expect("submit");

    let record = finished(&d, &rejected_id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error_kind, Some(ErrorKind::ValidationRejected));

    // Pre-deployment value intact, no new lifecycle invocations for v.
    assert_eq!(d.store.get_value(&port), Some(ConfigValue::Int(8080)));
    let new_runs: Vec<_> = d.runner.invocations()[runs_before..]
        .iter()
        .filter(|(service, phase)| service == "v" && *phase == ScriptPhase::Run)
        .cloned()
        .collect();
    assert!(new_runs.is_empty(), "v's run script was invoked: {new_runs:?}");
}

/// S6 — circular recipes are refused with both names listed; nothing
/// changes.
#[tokio::test(start_paused = true)]
async fn circular_dependency_spec_s6() {
    let d = deployer(Arc::new(NoopBroadcaster));
    recipe(&d, "a", "1.0.0", &[("b", "*")], "");
    recipe(&d, "b", "1.0.0", &[("a", "*")], "");

    let record = submit_doc(serde_json::json!({
        "components": {"a": {"version": "1.0.0"}}
    }));
    let id = record.id.clone();
    d.engine.submit(record).await.expect("submit");

    let record = finished(&d, &id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error_kind, Some(ErrorKind::CircularDependency));
    let message = record.error_message.expect("message");
    assert!(message.contains('a'));
    assert!(message.contains('b'));

    assert!(d.store.lookup(&services_root()).is_none());
    assert!(d.supervisor.list_views().is_empty());
    assert!(d.runner.invocations().is_empty());
}

struct StallValidation;

#[async_trait::async_trait]
impl ValidationBroadcaster for StallValidation {
    async fn validate(
        &self,
        _deployment_id: &str,
        _configs: &indexmap::IndexMap<String, serde_json::Value>,
        timeout: Duration,
    ) -> Vec<ember_daemon::Rejection> {
        tokio::time::sleep(timeout).await;
        Vec::new()
    }
}

/// Property 5 — cancel before activation leaves the live config
/// untouched.
#[tokio::test(start_paused = true)]
async fn cancel_before_activation_property_5() {
    let d = deployer(Arc::new(StallValidation));
    recipe(&d, "v", "1.0.0", &[], "    port: 8080");

    let record = submit_doc(serde_json::json!({
        "components": {"v": {
            "version": "1.0.0",
            "configurationUpdate": {"MERGE": {"port": 81}}
        }},
        "policies": {"validationTimeoutSeconds": 3600}
    }));
    let id = record.id.clone();
    d.engine.submit(record).await.expect("submit");
    tokio::time::sleep(Duration::from_secs(2)).await;

    d.engine.cancel(&id).await.expect("cancel");
    let record = finished(&d, &id).await;
    assert_eq!(record.status, DeploymentStatus::Canceled);
    assert!(d.store.lookup(&services_root()).is_none());
}

/// A full deployment brings the closure up in dependency order.
#[tokio::test(start_paused = true)]
async fn closure_deploys_in_order() {
    let d = deployer(Arc::new(NoopBroadcaster));
    recipe(&d, "app", "1.0.0", &[("db", ">=2.0.0")], "    greeting: hello");
    recipe(&d, "db", "2.4.0", &[], "");

    let record = submit_doc(serde_json::json!({
        "components": {"app": {"version": "1.0.0"}}
    }));
    let id = record.id.clone();
    d.engine.submit(record).await.expect("submit");
    assert_eq!(finished(&d, &id).await.status, DeploymentStatus::Succeeded);

    assert_eq!(d.supervisor.state_of("app"), Some(ServiceState::Running));
    assert_eq!(d.supervisor.state_of("db"), Some(ServiceState::Running));
    assert_eq!(
        d.store.get_value(&service_config_path("app").child("greeting")),
        Some(ConfigValue::from("hello")),
    );

    // db (the dependency) ran first.
    let invocations = d.runner.invocations();
    let db_run = invocations
        .iter()
        .position(|(s, p)| s == "db" && *p == ScriptPhase::Run)
        .expect("db ran");
    let app_run = invocations
        .iter()
        .position(|(s, p)| s == "app" && *p == ScriptPhase::Run)
        .expect("app ran");
    assert!(db_run < app_run);
}
