// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::scripts::{FakeBehavior, FakeScriptRunner, ScriptPhase, ScriptRunner};
use crate::supervisor::SupervisorConfig;
use ember_core::{DeploymentSource, ServiceState, SystemClock};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    engine: DeploymentEngine,
    store: Arc<ConfigStore>,
    cache: Arc<RecipeCache>,
    supervisor: Supervisor<SystemClock>,
    runner: Arc<FakeScriptRunner>,
    paths: EmberPaths,
}

fn harness(broadcaster: Arc<dyn ValidationBroadcaster>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let paths = EmberPaths::new(dir.path());
    std::fs::create_dir_all(paths.recipes_dir()).unwrap();

    let store = Arc::new(ConfigStore::new());
    let cache = Arc::new(RecipeCache::new(paths.recipes_dir()));
    let runner = Arc::new(FakeScriptRunner::new());
    let clock = SystemClock::default();

    let (supervisor, supervisor_driver) = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&runner) as Arc<dyn ScriptRunner>,
        clock.clone(),
        SupervisorConfig { work_root: dir.path().join("work"), ..SupervisorConfig::default() },
    );
    tokio::spawn(supervisor_driver.run());

    let tokens = Arc::new(TokenRegistry::new(Arc::clone(&store), clock.clone()));
    let ctx = EngineCtx {
        store: Arc::clone(&store),
        cache: Arc::clone(&cache),
        supervisor: supervisor.clone(),
        tokens,
        broadcaster,
        clock,
        paths: paths.clone(),
        os: "linux".to_string(),
        architecture: "x86_64".to_string(),
        settle: crate::fsm::DEPLOYMENT_SETTLE,
    };
    let (engine, driver) = EngineDriver::new(ctx);
    tokio::spawn(driver.run());

    Harness { dir, engine, store, cache, supervisor, runner, paths }
}

fn write_recipe(h: &Harness, name: &str, version: &str, deps: &[(&str, &str)], defaults: &str) {
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
        h.paths.recipes_dir().join(format!("{name}-{version}.yaml")),
        text,
    )
    .unwrap();
}

/// A startup-style recipe whose readiness is reported, never exited.
fn write_startup_recipe(h: &Harness, name: &str, version: &str) {
    let text = format!(
        "RecipeFormatVersion: \"2020-01-25\"\nComponentName: {name}\nComponentVersion: \"{version}\"\nComponentConfiguration:\n  DefaultConfiguration:\n    flag: true\nManifests:\n  - Lifecycle:\n      startup: ./start\n"
    );
    std::fs::write(
        h.paths.recipes_dir().join(format!("{name}-{version}.yaml")),
        text,
    )
    .unwrap();
}

fn doc(json: serde_json::Value) -> ember_core::DeploymentDoc {
    serde_json::from_value(json).unwrap()
}

fn record(doc_json: serde_json::Value) -> DeploymentRecord {
    DeploymentRecord::new(
        ember_core::deployment_id(),
        DeploymentSource::Local,
        doc(doc_json),
        1,
    )
}

async fn wait_terminal(h: &Harness, id: &str) -> DeploymentRecord {
    for _ in 0..5_000 {
        let path = crate::env::deployment_path(id).child("record");
        if let Some(ConfigValue::String(text)) = h.store.get_value(&path) {
            if let Ok(record) = serde_json::from_str::<DeploymentRecord>(&text) {
                if record.status.is_terminal() {
                    return record;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("deployment {id} never reached a terminal status");
}

fn config_path(service: &str, leaf: &str) -> ember_config::ConfigPath {
    crate::env::service_config_path(service).join(&ember_config::ConfigPath::parse(leaf))
}

#[tokio::test(start_paused = true)]
async fn deployment_installs_defaults_and_starts_services() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "web", "1.0.0", &[("db", ">=2.0.0")], "    port: 8080");
    write_recipe(&h, "db", "2.1.0", &[], "");

    let record = record(serde_json::json!({
        "components": {"web": {"version": "1.0.0"}}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Succeeded);

    assert_eq!(
        h.store.get_value(&config_path("web", "port")),
        Some(ConfigValue::Int(8080)),
    );
    assert_eq!(
        h.store.get_value(&crate::env::service_version_path("web")),
        Some(ConfigValue::from("1.0.0")),
    );
    assert_eq!(h.supervisor.state_of("web"), Some(ServiceState::Running));
    assert_eq!(h.supervisor.state_of("db"), Some(ServiceState::Running));
    // Per-service auth token issued at registration.
    assert!(h
        .store
        .get_value(&crate::env::service_runtime_path("web").child("token"))
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn merge_overlays_defaults_for_fresh_service() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "c", "1.0.0", &[], "    msg: hello\n    nested:\n      k: 1");

    let record = record(serde_json::json!({
        "components": {"c": {
            "version": "1.0.0",
            "configurationUpdate": {"MERGE": {"msg": "hi", "nested": {"k2": 2}}}
        }}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();
    assert_eq!(wait_terminal(&h, &id).await.status, DeploymentStatus::Succeeded);

    assert_eq!(
        h.store.subtree_json(&crate::env::service_config_path("c")),
        Some(serde_json::json!({"msg": "hi", "nested": {"k": 1, "k2": 2}})),
    );
}

#[tokio::test(start_paused = true)]
async fn circular_dependency_is_refused() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "a", "1.0.0", &[("b", "*")], "");
    write_recipe(&h, "b", "1.0.0", &[("a", "*")], "");

    let record = record(serde_json::json!({
        "components": {"a": {"version": "1.0.0"}}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Failed);
    assert_eq!(finished.error_kind, Some(ErrorKind::CircularDependency));
    let message = finished.error_message.unwrap();
    assert!(message.contains('a') && message.contains('b'));

    // Config store unchanged, no service moved out of NEW.
    assert!(h.store.lookup(&crate::env::services_root()).is_none());
    assert!(h.supervisor.list_views().is_empty());
    assert!(h.runner.invocations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsatisfiable_constraints_fail() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "a", "1.0.0", &[("db", ">=3.0.0")], "");
    write_recipe(&h, "db", "2.0.0", &[], "");

    let record = record(serde_json::json!({
        "components": {"a": {"version": "1.0.0"}}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Failed);
    assert_eq!(finished.error_kind, Some(ErrorKind::Unsatisfiable));
}

#[tokio::test(start_paused = true)]
async fn malformed_update_document_fails() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "a", "1.0.0", &[], "");

    let record = record(serde_json::json!({
        "components": {"a": {
            "version": "1.0.0",
            "configurationUpdate": {"RESET": ["no-leading-slash"]}
        }}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Failed);
    assert_eq!(finished.error_kind, Some(ErrorKind::MalformedConfig));
}

struct RejectAll;

#[async_trait]
impl ValidationBroadcaster for RejectAll {
    async fn validate(
        &self,
        _deployment_id: &str,
        configs: &IndexMap<String, serde_json::Value>,
        _timeout: Duration,
    ) -> Vec<Rejection> {
        configs
            .keys()
            .map(|service| Rejection {
                service: service.clone(),
                reason: "port below 1024".to_string(),
            })
            .collect()
    }
}

#[tokio::test(start_paused = true)]
async fn validation_rejection_fails_before_activation() {
    let h = harness(Arc::new(RejectAll));
    write_recipe(&h, "v", "1.0.0", &[], "    port: 8080");

    let record = record(serde_json::json!({
        "components": {"v": {
            "version": "1.0.0",
            "configurationUpdate": {"MERGE": {"port": 80}}
        }}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Failed);
    assert_eq!(finished.error_kind, Some(ErrorKind::ValidationRejected));

    // Live config untouched, lifecycle never invoked.
    assert!(h.store.lookup(&crate::env::service_config_path("v")).is_none());
    assert!(!h.runner.ran("v", ScriptPhase::Run));
}

#[tokio::test(start_paused = true)]
async fn store_validator_rejection_rolls_back_whole_batch() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "v", "1.0.0", &[], "    port: 8080");

    // First deployment succeeds and installs port 8080.
    let first = record(serde_json::json!({"components": {"v": {"version": "1.0.0"}}}));
    let first_id = first.id.clone();
    h.engine.submit(first).await.unwrap();
    assert_eq!(wait_terminal(&h, &first_id).await.status, DeploymentStatus::Succeeded);

    h.store.add_validator(&config_path("v", "port"), |value| match value {
        ConfigValue::Int(port) if *port < 1024 => Err("privileged port".to_string()),
        other => Ok(other.clone()),
    });

    let second = record(serde_json::json!({
        "components": {"v": {
            "version": "1.0.0",
            "configurationUpdate": {"MERGE": {"port": 80}}
        }}
    }));
    let second_id = second.id.clone();
    h.engine.submit(second).await.unwrap();

    let finished = wait_terminal(&h, &second_id).await;
    assert_eq!(finished.status, DeploymentStatus::Failed);
    assert_eq!(finished.error_kind, Some(ErrorKind::ValidationRejected));
    assert_eq!(
        h.store.get_value(&config_path("v", "port")),
        Some(ConfigValue::Int(8080)),
    );
}

#[tokio::test(start_paused = true)]
async fn broken_service_rolls_back_the_deployment() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "crashy", "1.0.0", &[], "    flag: true");
    for _ in 0..3 {
        h.runner.script(
            "crashy",
            ScriptPhase::Run,
            FakeBehavior::ExitAfter { delay: Duration::from_millis(10), code: 1 },
        );
    }

    let record = record(serde_json::json!({
        "components": {"crashy": {"version": "1.0.0"}},
        "policies": {"failureHandling": "ROLLBACK"}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::RolledBack);
    assert_eq!(finished.error_kind, Some(ErrorKind::BrokenExhausted));

    // The introduced service and its configuration are gone again.
    assert!(h.supervisor.service_view("crashy").is_none());
    assert!(h.store.lookup(&crate::env::service_config_path("crashy")).is_none());
}

#[tokio::test(start_paused = true)]
async fn do_nothing_policy_keeps_broken_deployment() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "crashy", "1.0.0", &[], "");
    for _ in 0..3 {
        h.runner.script(
            "crashy",
            ScriptPhase::Run,
            FakeBehavior::ExitAfter { delay: Duration::from_millis(10), code: 1 },
        );
    }

    let record = record(serde_json::json!({
        "components": {"crashy": {"version": "1.0.0"}},
        "policies": {"failureHandling": "DO_NOTHING"}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Succeeded);

    // The service is left to its fate.
    for _ in 0..1_000 {
        if h.supervisor.state_of("crashy") == Some(ServiceState::Broken) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("crashy never went BROKEN");
}

#[tokio::test(start_paused = true)]
async fn absent_services_are_removed_by_the_next_deployment() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "a", "1.0.0", &[], "");
    write_recipe(&h, "b", "1.0.0", &[], "");

    let both = record(serde_json::json!({
        "components": {"a": {"version": "1.0.0"}, "b": {"version": "1.0.0"}}
    }));
    let both_id = both.id.clone();
    h.engine.submit(both).await.unwrap();
    assert_eq!(wait_terminal(&h, &both_id).await.status, DeploymentStatus::Succeeded);
    assert_eq!(h.supervisor.state_of("b"), Some(ServiceState::Running));

    let only_a = record(serde_json::json!({
        "components": {"a": {"version": "1.0.0"}}
    }));
    let only_a_id = only_a.id.clone();
    h.engine.submit(only_a).await.unwrap();
    assert_eq!(wait_terminal(&h, &only_a_id).await.status, DeploymentStatus::Succeeded);

    assert!(h.supervisor.service_view("b").is_none());
    assert!(h.store.lookup(&crate::env::service_path("b")).is_none());
    assert_eq!(h.supervisor.state_of("a"), Some(ServiceState::Running));
}

struct NeverReplies;

#[async_trait]
impl ValidationBroadcaster for NeverReplies {
    async fn validate(
        &self,
        _deployment_id: &str,
        _configs: &IndexMap<String, serde_json::Value>,
        timeout: Duration,
    ) -> Vec<Rejection> {
        // Hold the deployment in the validate phase for its full
        // timeout, as a silent subscriber would.
        tokio::time::sleep(timeout).await;
        Vec::new()
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_before_activation_leaves_config_untouched() {
    let h = harness(Arc::new(NeverReplies));
    write_recipe(&h, "v", "1.0.0", &[], "    port: 8080");

    let record = record(serde_json::json!({
        "components": {"v": {
            "version": "1.0.0",
            "configurationUpdate": {"MERGE": {"port": 9999}},
        }},
        "policies": {"validationTimeoutSeconds": 3600}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    // Give the deployment a moment to reach the validate phase.
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.engine.cancel(&id).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Canceled);

    // The staged configuration only ever lived in the shadow view.
    assert!(h.store.lookup(&crate::env::service_config_path("v")).is_none());
    assert!(h.store.lookup(&crate::env::services_root()).is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_after_activation_rolls_back() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_startup_recipe(&h, "slow", "1.0.0");
    // The startup step never returns, so the deployment sits in its
    // settle phase after activation.
    h.runner.script("slow", ScriptPhase::Startup, FakeBehavior::Hang);

    let record = record(serde_json::json!({
        "components": {"slow": {"version": "1.0.0"}},
        "policies": {"failureHandling": "ROLLBACK"}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    // Let activation happen, then cancel the IN_PROGRESS deployment.
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.engine.cancel(&id).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Canceled);

    // The introduced service and its whole node are gone again.
    assert!(h.supervisor.service_view("slow").is_none());
    assert!(h.store.lookup(&crate::env::service_path("slow")).is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_after_activation_rolls_back_under_do_nothing() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_startup_recipe(&h, "slow", "1.0.0");
    h.runner.script("slow", ScriptPhase::Startup, FakeBehavior::Hang);

    // DO_NOTHING gates only the BROKEN-during-settle case; explicit
    // cancel while IN_PROGRESS must still roll back.
    let record = record(serde_json::json!({
        "components": {"slow": {"version": "1.0.0"}},
        "policies": {"failureHandling": "DO_NOTHING"}
    }));
    let id = record.id.clone();
    h.engine.submit(record).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.engine.cancel(&id).await.unwrap();

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Canceled);
    assert!(h.supervisor.service_view("slow").is_none());
    assert!(h.store.lookup(&crate::env::service_path("slow")).is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_queued_deployment_dequeues_it() {
    let h = harness(Arc::new(NeverReplies));
    write_recipe(&h, "v", "1.0.0", &[], "    port: 1");

    let first = record(serde_json::json!({
        "components": {"v": {
            "version": "1.0.0",
            "configurationUpdate": {"MERGE": {"port": 2}},
        }},
        "policies": {"validationTimeoutSeconds": 3600}
    }));
    let first_id = first.id.clone();
    let second = record(serde_json::json!({
        "components": {"v": {"version": "1.0.0"}}
    }));
    let second_id = second.id.clone();

    h.engine.submit(first).await.unwrap();
    h.engine.submit(second).await.unwrap();

    h.engine.cancel(&second_id).await.unwrap();
    let second_record = wait_terminal(&h, &second_id).await;
    assert_eq!(second_record.status, DeploymentStatus::Canceled);

    // Unknown ids are rejected.
    assert!(h.engine.cancel("dpl-does-not-exist").await.is_err());

    h.engine.cancel(&first_id).await.unwrap();
    assert_eq!(wait_terminal(&h, &first_id).await.status, DeploymentStatus::Canceled);
}

#[tokio::test(start_paused = true)]
async fn interrupted_early_deployment_is_resumed_from_scratch() {
    let h = harness(Arc::new(NoopBroadcaster));
    write_recipe(&h, "a", "1.0.0", &[], "");

    // Simulate a crash: an IN_PROGRESS record stuck at phase 2.
    let mut stuck = record(serde_json::json!({
        "components": {"a": {"version": "1.0.0"}}
    }));
    stuck.status = DeploymentStatus::InProgress;
    stuck.phase = 2;
    let id = stuck.id.clone();
    std::fs::create_dir_all(h.paths.deployments_dir()).unwrap();
    std::fs::write(
        h.paths.deployment_record_path(&id),
        serde_json::to_vec(&PersistedDeployment { record: stuck, inverse: vec![] }).unwrap(),
    )
    .unwrap();

    let clock = SystemClock::default();
    let tokens = Arc::new(TokenRegistry::new(Arc::clone(&h.store), clock.clone()));
    let ctx = EngineCtx {
        store: Arc::clone(&h.store),
        cache: Arc::clone(&h.cache),
        supervisor: h.supervisor.clone(),
        tokens,
        broadcaster: Arc::new(NoopBroadcaster),
        clock,
        paths: h.paths.clone(),
        os: "linux".to_string(),
        architecture: "x86_64".to_string(),
        settle: crate::fsm::DEPLOYMENT_SETTLE,
    };
    resume_pending(&ctx, &h.engine).await;

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn interrupted_late_deployment_is_rolled_back() {
    let h = harness(Arc::new(NoopBroadcaster));

    // Activation had already written a leaf; the inverse removes it.
    let path = config_path("ghost", "flag");
    h.store.set_leaf(&path, ConfigValue::Bool(true), 10).unwrap();

    let mut stuck = record(serde_json::json!({
        "components": {"ghost": {"version": "1.0.0"}}
    }));
    stuck.status = DeploymentStatus::InProgress;
    stuck.phase = 5;
    let id = stuck.id.clone();
    let inverse = vec![PlanOp { path: path.clone(), op: ember_config::WriteOp::Remove }];
    std::fs::create_dir_all(h.paths.deployments_dir()).unwrap();
    std::fs::write(
        h.paths.deployment_record_path(&id),
        serde_json::to_vec(&PersistedDeployment { record: stuck, inverse }).unwrap(),
    )
    .unwrap();

    let clock = SystemClock::default();
    let tokens = Arc::new(TokenRegistry::new(Arc::clone(&h.store), clock.clone()));
    let ctx = EngineCtx {
        store: Arc::clone(&h.store),
        cache: Arc::clone(&h.cache),
        supervisor: h.supervisor.clone(),
        tokens,
        broadcaster: Arc::new(NoopBroadcaster),
        clock,
        paths: h.paths.clone(),
        os: "linux".to_string(),
        architecture: "x86_64".to_string(),
        settle: crate::fsm::DEPLOYMENT_SETTLE,
    };
    resume_pending(&ctx, &h.engine).await;

    let finished = wait_terminal(&h, &id).await;
    assert_eq!(finished.status, DeploymentStatus::RolledBack);
    assert!(h.store.lookup(&path).is_none());
}
