// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for the workspace specs.

use ember_config::ConfigStore;
use ember_core::{ServiceState, StateChange, SystemClock};
use ember_daemon::{
    FakeScriptRunner, ScriptRunner, ServiceSpec, Supervisor, SupervisorConfig, SupervisorDriver,
};
use ember_recipe::{Lifecycle, Step};
use semver::Version;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct World {
    pub store: Arc<ConfigStore>,
    pub supervisor: Supervisor<SystemClock>,
    pub runner: Arc<FakeScriptRunner>,
    pub changes: Arc<Mutex<Vec<StateChange>>>,
    pub work: tempfile::TempDir,
}

/// Supervisor harness over the scripted fake runner.
pub fn world() -> World {
    let store = Arc::new(ConfigStore::new());
    let runner = Arc::new(FakeScriptRunner::new());
    let work = tempfile::tempdir().expect("tempdir");
    let (supervisor, driver): (_, SupervisorDriver<SystemClock>) = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&runner) as Arc<dyn ScriptRunner>,
        SystemClock::default(),
        SupervisorConfig {
            work_root: work.path().to_path_buf(),
            ..SupervisorConfig::default()
        },
    );
    tokio::spawn(driver.run());

    let changes: Arc<Mutex<Vec<StateChange>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    supervisor.on_state_change(move |change| {
        if let Ok(mut changes) = sink.lock() {
            changes.push(change.clone());
        }
    });

    World { store, supervisor, runner, changes, work }
}

/// A long-running service spec with the given HARD/SOFT edges.
pub fn service(name: &str, deps: &[(&str, ember_core::DependencyKind)]) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        version: Version::new(1, 0, 0),
        dependencies: deps.iter().map(|(d, k)| (d.to_string(), *k)).collect(),
        lifecycle: Lifecycle {
            run: Some(Step::Command(format!("./{name}"))),
            ..Lifecycle::default()
        },
    }
}

pub async fn wait_for_state(
    supervisor: &Supervisor<SystemClock>,
    name: &str,
    state: ServiceState,
) {
    for _ in 0..2_000 {
        if supervisor.state_of(name) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "{name} never reached {state}; currently {:?}",
        supervisor.state_of(name)
    );
}
