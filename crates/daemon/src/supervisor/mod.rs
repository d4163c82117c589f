// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The supervisor: drives every service FSM in dependency order.
//!
//! One reconciliation loop owns all service entries and consumes a
//! command channel; lifecycle scripts run on spawned tasks and report
//! completions back onto the same channel. Transitions for a single
//! service are therefore strictly serialized, and the loop never waits
//! on one service while holding another's state.
//!
//! Ordering contract: a service never leaves INSTALLED for STARTING
//! until every HARD dependency is RUNNING or FINISHED, and a dependency
//! is not stopped while a HARD dependent is still up (bounded wait,
//! then force).

use crate::fsm::{
    transition_allowed, RestartDecision, RestartPolicy, RestartStats, DEPENDENTS_STOP_WAIT,
    STABLE_WINDOW, STOP_TIMEOUT,
};
use crate::scripts::{spawn_script, ScriptOutcome, ScriptPhase, ScriptRunner, ScriptSpec};
use ember_config::{ConfigStore, ConfigValue};
use ember_core::{Clock, DependencyKind, ServiceState, StateChange, TransitionCause};
use ember_recipe::{Lifecycle, Recipe, Step};
use indexmap::IndexMap;
use parking_lot::Mutex;
use semver::Version;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A service as the supervisor runs it: recipe data resolved for this
/// platform.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub version: Version,
    pub dependencies: Vec<(String, DependencyKind)>,
    pub lifecycle: Lifecycle,
}

impl ServiceSpec {
    /// Build from a recipe, selecting the manifest for this platform.
    pub fn from_recipe(recipe: &Recipe, os: &str, architecture: &str) -> Self {
        let lifecycle = recipe
            .manifest_for(os, architecture)
            .map(|manifest| manifest.lifecycle.clone())
            .unwrap_or_default();
        Self {
            name: recipe.name.clone(),
            version: recipe.version.clone(),
            dependencies: recipe
                .dependencies
                .iter()
                .map(|(name, spec)| (name.clone(), spec.dependency_type))
                .collect(),
            lifecycle,
        }
    }
}

/// Query snapshot of one service.
#[derive(Debug, Clone)]
pub struct ServiceView {
    pub name: String,
    pub version: String,
    pub state: ServiceState,
    pub dependencies: Vec<(String, DependencyKind)>,
    pub last_error: Option<String>,
}

/// Sent to SOFT dependents when a dependency changes state.
#[derive(Debug, Clone)]
pub struct DependencyNotice {
    pub service: String,
    pub dependency: String,
    pub dependency_state: ServiceState,
}

/// Supervisor tunables.
#[derive(Clone)]
pub struct SupervisorConfig {
    pub work_root: PathBuf,
    /// Exported to services as `AWS_CONTAINER_CREDENTIALS_FULL_URI`.
    pub credentials_url: Option<String>,
    pub policy: RestartPolicy,
    pub stable_window: Duration,
    pub stop_timeout: Duration,
    pub dependents_wait: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("work"),
            credentials_url: None,
            policy: RestartPolicy::default(),
            stable_window: STABLE_WINDOW,
            stop_timeout: STOP_TIMEOUT,
            dependents_wait: DEPENDENTS_STOP_WAIT,
        }
    }
}

type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;
type NoticeListener = Arc<dyn Fn(&DependencyNotice) + Send + Sync>;

struct Shared<C: Clock> {
    store: Arc<ConfigStore>,
    clock: C,
    views: Mutex<IndexMap<String, ServiceView>>,
    listeners: Mutex<Vec<StateListener>>,
    notice_listeners: Mutex<Vec<NoticeListener>>,
}

/// Handle used by the rest of the daemon; cheap to clone.
pub struct Supervisor<C: Clock> {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared<C>>,
}

impl<C: Clock> Clone for Supervisor<C> {
    fn clone(&self) -> Self {
        Self { cmd_tx: self.cmd_tx.clone(), shared: Arc::clone(&self.shared) }
    }
}

enum Command {
    Upsert { spec: ServiceSpec },
    Remove { name: String },
    Submit { desired: IndexMap<String, bool> },
    Start { name: String, reply: oneshot::Sender<Result<(), String>> },
    Stop { name: String, reply: Option<oneshot::Sender<()>> },
    Reported { name: String, state: ServiceState },
    ScriptDone { name: String, phase: ScriptPhase, outcome: ScriptOutcome, epoch: u64 },
    RunExited { name: String, outcome: ScriptOutcome, epoch: u64 },
    RetryElapsed { name: String, epoch: u64 },
    StableElapsed { name: String, epoch: u64 },
    StopTimeout { name: String, epoch: u64 },
    DependentsWaitElapsed { name: String, epoch: u64 },
    Shutdown { reply: oneshot::Sender<()> },
}

struct StartWatch {
    services: BTreeSet<String>,
    reply: Option<oneshot::Sender<Result<(), String>>>,
}

struct StopWatch {
    service: String,
    reply: Option<oneshot::Sender<()>>,
}

struct Entry {
    spec: ServiceSpec,
    state: ServiceState,
    desired: bool,
    restart: RestartStats,
    last_error: Option<String>,
    /// Bumped whenever earlier timers/completions become stale.
    epoch: u64,
    /// Stop token of the active `run` script.
    run_stop: Option<CancellationToken>,
    /// Stop token of an in-flight blocking phase (install/startup/...).
    phase_stop: Option<CancellationToken>,
    phase_inflight: Option<ScriptPhase>,
    /// When the service entered RUNNING via a `run` script.
    started_at: Option<Instant>,
    /// RUNNING long enough to satisfy HARD dependents.
    stable: bool,
    /// A stop is waiting for HARD dependents to get out of the way.
    pending_stop: Option<PendingStop>,
    /// After STOPPING, go back to INSTALLED instead of FINISHED.
    requeue_after_stop: bool,
    stop_cause: Option<TransitionCause>,
    waiting_shutdown: bool,
}

#[derive(Clone)]
struct PendingStop {
    cause: TransitionCause,
    requeue: bool,
}

impl Entry {
    fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            state: ServiceState::New,
            desired: false,
            restart: RestartStats::default(),
            last_error: None,
            epoch: 0,
            run_stop: None,
            phase_stop: None,
            phase_inflight: None,
            started_at: None,
            stable: false,
            pending_stop: None,
            requeue_after_stop: false,
            stop_cause: None,
            waiting_shutdown: false,
        }
    }

    fn is_up(&self) -> bool {
        matches!(
            self.state,
            ServiceState::Starting | ServiceState::Running | ServiceState::Stopping
        )
    }

    /// Startup grace: RUNNING satisfies HARD dependents only once
    /// stable. FINISHED satisfies for one-shot completions, but not
    /// for a service that was explicitly stopped.
    fn satisfies(&self) -> bool {
        match self.state {
            ServiceState::Finished => self.desired,
            ServiceState::Running => self.stable,
            _ => false,
        }
    }
}

impl<C: Clock + 'static> Supervisor<C> {
    /// Build the handle and its driver; the caller spawns
    /// `driver.run()`.
    pub fn new(
        store: Arc<ConfigStore>,
        runner: Arc<dyn ScriptRunner>,
        clock: C,
        config: SupervisorConfig,
    ) -> (Self, SupervisorDriver<C>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            store,
            clock,
            views: Mutex::new(IndexMap::new()),
            listeners: Mutex::new(Vec::new()),
            notice_listeners: Mutex::new(Vec::new()),
        });
        let supervisor = Self { cmd_tx: cmd_tx.clone(), shared: Arc::clone(&shared) };
        let driver = SupervisorDriver {
            entries: IndexMap::new(),
            cmd_tx,
            cmd_rx,
            runner,
            shared,
            config,
            start_watches: Vec::new(),
            stop_watches: Vec::new(),
        };
        (supervisor, driver)
    }

    /// Register or update a service definition.
    pub fn upsert_service(&self, spec: ServiceSpec) {
        let _ = self.cmd_tx.send(Command::Upsert { spec });
    }

    pub fn remove_service(&self, name: &str) {
        let _ = self.cmd_tx.send(Command::Remove { name: name.to_string() });
    }

    /// Reconcile current state against a `name → present` mapping.
    pub fn submit(&self, desired: IndexMap<String, bool>) {
        let _ = self.cmd_tx.send(Command::Submit { desired });
    }

    /// Start a service and its HARD closure. The returned future
    /// completes when the closure is RUNNING/FINISHED or any member is
    /// BROKEN.
    pub fn start(&self, name: &str) -> oneshot::Receiver<Result<(), String>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Start { name: name.to_string(), reply });
        rx
    }

    /// Stop a service (and, transitively, HARD dependents that would
    /// become unsatisfied). Completes when the service has stopped.
    pub fn stop(&self, name: &str) -> oneshot::Receiver<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Stop { name: name.to_string(), reply: Some(reply) });
        rx
    }

    /// Stop everything and end the driver loop.
    pub fn shutdown(&self) -> oneshot::Receiver<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Shutdown { reply });
        rx
    }

    /// A service self-reports its lifecycle state over IPC. A RUNNING
    /// report from STARTING is the readiness signal for startup-style
    /// services; an ERRORED report is a failure signal. Other reports
    /// are informational.
    pub fn report_state(&self, name: &str, state: ServiceState) {
        let _ = self.cmd_tx.send(Command::Reported { name: name.to_string(), state });
    }

    /// Register a global state-change listener. Listeners run on the
    /// supervisor loop and must not block.
    pub fn on_state_change(&self, listener: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.shared.listeners.lock().push(Arc::new(listener));
    }

    /// Register a listener for SOFT-dependency notifications.
    pub fn on_dependency_notice(
        &self,
        listener: impl Fn(&DependencyNotice) + Send + Sync + 'static,
    ) {
        self.shared.notice_listeners.lock().push(Arc::new(listener));
    }

    pub fn service_view(&self, name: &str) -> Option<ServiceView> {
        self.shared.views.lock().get(name).cloned()
    }

    pub fn list_views(&self) -> Vec<ServiceView> {
        self.shared.views.lock().values().cloned().collect()
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.shared.views.lock().get(name).map(|view| view.state)
    }
}

/// Owns the entries and runs the reconciliation loop.
pub struct SupervisorDriver<C: Clock> {
    entries: IndexMap<String, Entry>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    runner: Arc<dyn ScriptRunner>,
    shared: Arc<Shared<C>>,
    config: SupervisorConfig,
    start_watches: Vec<StartWatch>,
    stop_watches: Vec<StopWatch>,
}

impl<C: Clock + 'static> SupervisorDriver<C> {
    pub async fn run(mut self) {
        while let Some(command) = self.cmd_rx.recv().await {
            if let Command::Shutdown { reply } = command {
                self.stop_all();
                self.drain_until_stopped().await;
                let _ = reply.send(());
                break;
            }
            self.handle(command);
        }
    }

    async fn drain_until_stopped(&mut self) {
        let deadline = tokio::time::Instant::now()
            + self.config.stop_timeout
            + crate::scripts::SOFT_STOP_GRACE;
        while self.entries.values().any(Entry::is_up) {
            let command = tokio::select! {
                cmd = self.cmd_rx.recv() => cmd,
                _ = tokio::time::sleep_until(deadline) => None,
            };
            match command {
                Some(cmd) => self.handle(cmd),
                None => break,
            }
        }
    }

    fn stop_all(&mut self) {
        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in names {
            if let Some(entry) = self.entries.get_mut(&name) {
                entry.desired = false;
            }
            self.request_stop(&name, false, TransitionCause::Requested);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Upsert { spec } => self.upsert(spec),
            Command::Remove { name } => self.remove(&name),
            Command::Submit { desired } => {
                for (name, present) in desired {
                    if let Some(entry) = self.entries.get_mut(&name) {
                        entry.desired = present;
                    }
                    if present {
                        self.try_advance(&name);
                    } else {
                        self.request_stop(&name, false, TransitionCause::Requested);
                    }
                }
            }
            Command::Start { name, reply } => self.start_closure(&name, reply),
            Command::Stop { name, reply } => {
                if self.entries.contains_key(&name) {
                    if let Some(entry) = self.entries.get_mut(&name) {
                        entry.desired = false;
                    }
                    self.stop_watches.push(StopWatch { service: name.clone(), reply });
                    self.request_stop(&name, false, TransitionCause::Requested);
                    self.check_stop_watches();
                } else if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Reported { name, state } => self.reported(&name, state),
            Command::ScriptDone { name, phase, outcome, epoch } => {
                self.script_done(&name, phase, outcome, epoch)
            }
            Command::RunExited { name, outcome, epoch } => self.run_exited(&name, outcome, epoch),
            Command::RetryElapsed { name, epoch } => self.retry_elapsed(&name, epoch),
            Command::StableElapsed { name, epoch } => self.stable_elapsed(&name, epoch),
            Command::StopTimeout { name, epoch } => self.stop_timeout(&name, epoch),
            Command::DependentsWaitElapsed { name, epoch } => {
                self.dependents_wait_elapsed(&name, epoch)
            }
            Command::Shutdown { .. } => {}
        }
    }

    // -- registration --

    fn upsert(&mut self, spec: ServiceSpec) {
        let name = spec.name.clone();
        let mut reset_state = None;
        match self.entries.get_mut(&name) {
            Some(entry) => {
                let version_changed = entry.spec.version != spec.version;
                entry.spec = spec;
                if version_changed {
                    entry.restart.reset();
                    entry.last_error = None;
                    // A BROKEN service is promoted by a new version: it
                    // restarts its life from NEW.
                    if entry.state == ServiceState::Broken {
                        entry.epoch += 1;
                        entry.state = ServiceState::New;
                        reset_state = Some(ServiceState::New);
                    }
                }
            }
            None => {
                self.entries.insert(name.clone(), Entry::new(spec));
                reset_state = Some(ServiceState::New);
            }
        }
        self.publish_view(&name);
        if let Some(state) = reset_state {
            self.write_state_leaf(&name, state);
        }
    }

    fn remove(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.desired = false;
        }
        self.request_stop(name, false, TransitionCause::Requested);
        let gone = self
            .entries
            .get(name)
            .map(|entry| !entry.is_up())
            .unwrap_or(true);
        if gone {
            self.entries.shift_remove(name);
            self.shared.views.lock().shift_remove(name);
        }
    }

    // -- start path --

    fn start_closure(&mut self, name: &str, reply: oneshot::Sender<Result<(), String>>) {
        if !self.entries.contains_key(name) {
            let _ = reply.send(Err(format!("unknown service {name}")));
            return;
        }

        // HARD closure.
        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            if !closure.insert(current.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get(&current) {
                for (dep, kind) in &entry.spec.dependencies {
                    if *kind == DependencyKind::Hard && self.entries.contains_key(dep) {
                        frontier.push(dep.clone());
                    }
                }
            }
        }

        for member in &closure {
            let was_finished = match self.entries.get_mut(member) {
                Some(entry) => {
                    entry.desired = true;
                    entry.state == ServiceState::Finished
                }
                None => false,
            };
            // An explicit (re)start pulls finished services back in.
            if was_finished {
                self.apply_transition(member, ServiceState::Installed, TransitionCause::Requested);
            }
        }

        self.start_watches.push(StartWatch { services: closure.clone(), reply: Some(reply) });
        for member in closure {
            self.try_advance(&member);
        }
        self.check_start_watches();
    }

    /// Push a service as far as its state and dependencies allow.
    fn try_advance(&mut self, name: &str) {
        let (state, install_step, blocked) = match self.entries.get(name) {
            Some(entry) => (
                entry.state,
                entry.spec.lifecycle.install.clone(),
                !entry.desired || entry.pending_stop.is_some() || entry.phase_inflight.is_some(),
            ),
            None => return,
        };
        if blocked {
            return;
        }

        match state {
            ServiceState::New => match install_step {
                Some(step) => self.launch_phase(name, ScriptPhase::Install, &step),
                None => {
                    self.apply_transition(name, ServiceState::Installed, TransitionCause::Requested);
                    self.try_advance(name);
                }
            },
            ServiceState::Installed => {
                if self.hard_deps_satisfied(name) {
                    self.begin_start(name, TransitionCause::Requested);
                }
            }
            _ => {}
        }
    }

    fn hard_deps_satisfied(&self, name: &str) -> bool {
        let Some(entry) = self.entries.get(name) else { return false };
        entry.spec.dependencies.iter().all(|(dep, kind)| {
            *kind != DependencyKind::Hard
                || self
                    .entries
                    .get(dep)
                    .map(Entry::satisfies)
                    .unwrap_or(false)
        })
    }

    /// INSTALLED/ERRORED → STARTING and launch the startup or run step.
    fn begin_start(&mut self, name: &str, cause: TransitionCause) {
        self.apply_transition(name, ServiceState::Starting, cause);

        let lifecycle = match self.entries.get(name) {
            Some(entry) => entry.spec.lifecycle.clone(),
            None => return,
        };

        if let Some(step) = &lifecycle.startup {
            self.launch_phase(name, ScriptPhase::Startup, step);
        } else if let Some(step) = &lifecycle.run {
            let spec = self.build_spec(name, ScriptPhase::Run, step);
            let running = spawn_script(&self.runner, spec);
            let stop = running.stop_token();
            let epoch = self.entries.get(name).map(|e| e.epoch).unwrap_or(0);
            let tx = self.cmd_tx.clone();
            let service = name.to_string();
            tokio::spawn(async move {
                let outcome = running.wait().await;
                let _ = tx.send(Command::RunExited { name: service, outcome, epoch });
            });
            let now = self.shared.clock.now();
            if let Some(entry) = self.entries.get_mut(name) {
                entry.run_stop = Some(stop);
                entry.started_at = Some(now);
                entry.stable = false;
            }
            self.apply_transition(name, ServiceState::Running, TransitionCause::Requested);
            // The startup grace timer promotes the service to stable.
            let tx = self.cmd_tx.clone();
            let service = name.to_string();
            let stable_after = self.config.stable_window;
            tokio::spawn(async move {
                tokio::time::sleep(stable_after).await;
                let _ = tx.send(Command::StableElapsed { name: service, epoch });
            });
        } else {
            // Nothing to execute: a library component is immediately
            // FINISHED and satisfies its dependents.
            self.apply_transition(
                name,
                ServiceState::Finished,
                TransitionCause::ScriptExit { code: 0 },
            );
        }
    }

    // -- script completions --

    fn script_done(&mut self, name: &str, phase: ScriptPhase, outcome: ScriptOutcome, epoch: u64) {
        let pending = match self.entries.get_mut(name) {
            Some(entry) => {
                if entry.epoch != epoch {
                    return;
                }
                entry.phase_inflight = None;
                entry.phase_stop = None;
                entry.pending_stop.is_some()
            }
            None => return,
        };

        match phase {
            ScriptPhase::Install => {
                if pending {
                    self.resolve_pending_stop(name);
                    return;
                }
                if outcome.success() {
                    self.apply_transition(
                        name,
                        ServiceState::Installed,
                        TransitionCause::ScriptExit { code: 0 },
                    );
                    self.try_advance(name);
                } else {
                    // NEW → BROKEN once the install retry budget is spent.
                    self.record_failure(name, outcome, FailureContext::Install);
                }
            }
            ScriptPhase::Startup => {
                if pending {
                    self.begin_stop(name);
                    return;
                }
                if outcome.success() {
                    if let Some(entry) = self.entries.get_mut(name) {
                        entry.restart.reset();
                        entry.started_at = None;
                        // Startup reported ready: stable right away.
                        entry.stable = true;
                    }
                    self.apply_transition(
                        name,
                        ServiceState::Running,
                        TransitionCause::ScriptExit { code: 0 },
                    );
                    self.on_dependency_available(name);
                    self.check_start_watches();
                } else {
                    self.record_failure(name, outcome, FailureContext::Startup);
                }
            }
            ScriptPhase::Shutdown => {
                if !outcome.success() {
                    warn!(service = name, ?outcome, "shutdown step failed; forcing stop");
                }
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.waiting_shutdown = false;
                }
                self.maybe_finish_stop(name);
            }
            ScriptPhase::Recover => {
                // Recovery output is advisory; the retry proceeds.
                if !outcome.success() {
                    debug!(service = name, ?outcome, "recover step failed");
                }
                let errored =
                    self.entries.get(name).map(|e| e.state) == Some(ServiceState::Errored);
                if errored && self.hard_deps_satisfied(name) {
                    let attempt = self
                        .entries
                        .get(name)
                        .map(|e| {
                            e.restart
                                .recent_failures(self.shared.clock.now(), &self.config.policy)
                        })
                        .unwrap_or(0);
                    self.begin_start(name, TransitionCause::Retry { attempt });
                }
            }
            ScriptPhase::Bootstrap | ScriptPhase::Run => {}
        }
    }

    fn run_exited(&mut self, name: &str, outcome: ScriptOutcome, epoch: u64) {
        let (state, stable) = match self.entries.get_mut(name) {
            Some(entry) => {
                if entry.epoch != epoch {
                    return;
                }
                entry.run_stop = None;
                let stable = entry.stable;
                entry.stable = false;
                (entry.state, stable)
            }
            None => return,
        };

        if state != ServiceState::Running {
            return;
        }

        match outcome {
            ScriptOutcome::Exited { code: 0 } => {
                // Clean exit is one-shot success regardless of uptime.
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.restart.reset();
                    entry.started_at = None;
                }
                self.apply_transition(
                    name,
                    ServiceState::Finished,
                    TransitionCause::ScriptExit { code: 0 },
                );
            }
            outcome if !stable => {
                // Premature exit inside the stable window counts as a
                // startup failure, not a runtime failure.
                self.record_failure(name, outcome, FailureContext::Startup)
            }
            outcome => self.record_failure(name, outcome, FailureContext::Runtime),
        }
    }

    /// Handle a service's self-reported state (LIFECYCLE route).
    fn reported(&mut self, name: &str, state: ServiceState) {
        let (current, stable, pending) = match self.entries.get(name) {
            Some(entry) => (entry.state, entry.stable, entry.pending_stop.is_some()),
            None => return,
        };
        if pending {
            return;
        }

        match (current, state) {
            (ServiceState::Starting, ServiceState::Running) => {
                // Readiness reported before the startup step returned:
                // the service is up and immediately stable. The report
                // supersedes the startup step, whose eventual exit no
                // longer matters.
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.restart.reset();
                    entry.stable = true;
                    entry.epoch += 1;
                    if let Some(token) = entry.phase_stop.take() {
                        token.cancel();
                    }
                    entry.phase_inflight = None;
                }
                self.apply_transition(name, ServiceState::Running, TransitionCause::Reported);
                self.on_dependency_available(name);
                self.check_start_watches();
            }
            (ServiceState::Running, ServiceState::Running) => {
                // Re-affirmation short-cuts the startup grace timer.
                if !stable {
                    if let Some(entry) = self.entries.get_mut(name) {
                        entry.stable = true;
                        entry.restart.reset();
                    }
                    self.on_dependency_available(name);
                    self.check_start_watches();
                }
            }
            (ServiceState::Starting | ServiceState::Running, ServiceState::Errored) => {
                // Self-reported failure: whatever is executing is torn
                // down and the restart policy takes over.
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.epoch += 1;
                    if let Some(token) = entry.run_stop.take() {
                        token.cancel();
                    }
                    if let Some(token) = entry.phase_stop.take() {
                        token.cancel();
                    }
                    entry.phase_inflight = None;
                }
                let context =
                    if stable { FailureContext::Runtime } else { FailureContext::Startup };
                self.record_failure(
                    name,
                    ScriptOutcome::FailedToStart {
                        message: "service reported ERRORED".to_string(),
                    },
                    context,
                );
            }
            _ => debug!(service = name, %current, reported = %state, "ignoring state report"),
        }
    }

    fn stable_elapsed(&mut self, name: &str, epoch: u64) {
        let promoted = match self.entries.get_mut(name) {
            Some(entry) => {
                if entry.epoch != epoch || entry.state != ServiceState::Running {
                    false
                } else {
                    entry.stable = true;
                    entry.restart.reset();
                    true
                }
            }
            None => false,
        };
        if promoted {
            debug!(service = name, "stable");
            self.on_dependency_available(name);
            self.check_start_watches();
        }
    }

    // -- failure & retry --

    fn record_failure(&mut self, name: &str, outcome: ScriptOutcome, context: FailureContext) {
        let now = self.shared.clock.now();
        let cause = match &outcome {
            ScriptOutcome::Exited { code } => TransitionCause::ScriptExit { code: *code },
            ScriptOutcome::Killed => TransitionCause::ScriptFailed { message: "killed".to_string() },
            ScriptOutcome::FailedToStart { message } => {
                TransitionCause::ScriptFailed { message: message.clone() }
            }
            ScriptOutcome::Skipped => TransitionCause::ScriptExit { code: 0 },
        };

        let decision = match self.entries.get_mut(name) {
            Some(entry) => {
                entry.last_error = Some(format!("SCRIPT_FAILURE during {context}"));
                entry.started_at = None;
                entry.restart.record_failure(now, &self.config.policy)
            }
            None => return,
        };

        if context != FailureContext::Install {
            self.apply_transition(name, ServiceState::Errored, cause);
        }

        match decision {
            RestartDecision::Backoff { delay, attempt } => {
                debug!(service = name, ?delay, attempt, "scheduling restart");
                let epoch = self.entries.get(name).map(|e| e.epoch).unwrap_or(0);
                let tx = self.cmd_tx.clone();
                let service = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Command::RetryElapsed { name: service, epoch });
                });
            }
            RestartDecision::Exhausted => {
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.last_error =
                        Some("BROKEN_EXHAUSTED: restart budget spent".to_string());
                }
                self.apply_transition(name, ServiceState::Broken, TransitionCause::Exhausted);
            }
        }
    }

    fn retry_elapsed(&mut self, name: &str, epoch: u64) {
        let (state, recover_step, attempt) = match self.entries.get(name) {
            Some(entry) => {
                if entry.epoch != epoch || !entry.desired || entry.pending_stop.is_some() {
                    return;
                }
                (
                    entry.state,
                    entry.spec.lifecycle.recover.clone(),
                    entry
                        .restart
                        .recent_failures(self.shared.clock.now(), &self.config.policy),
                )
            }
            None => return,
        };

        match state {
            ServiceState::Errored => {
                if !self.hard_deps_satisfied(name) {
                    // Wait in INSTALLED until the dependency returns.
                    self.apply_transition(
                        name,
                        ServiceState::Installed,
                        TransitionCause::Requested,
                    );
                    return;
                }
                if let Some(step) = recover_step {
                    self.launch_phase(name, ScriptPhase::Recover, &step);
                    return;
                }
                self.begin_start(name, TransitionCause::Retry { attempt });
            }
            // Install retry.
            ServiceState::New => self.try_advance(name),
            _ => {}
        }
    }

    // -- stop path --

    /// Request a stop; honors the dependents-first shutdown order.
    fn request_stop(&mut self, name: &str, requeue: bool, cause: TransitionCause) {
        let (state, inflight, already_pending) = match self.entries.get(name) {
            Some(entry) => (
                entry.state,
                entry.phase_inflight.is_some(),
                entry.pending_stop.is_some(),
            ),
            None => return,
        };
        // First stop request wins; re-requests would recurse through
        // the dependents again.
        if already_pending {
            return;
        }

        match state {
            ServiceState::Running | ServiceState::Starting => {
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.pending_stop = Some(PendingStop { cause, requeue });
                    if let Some(token) = &entry.phase_stop {
                        // A mid-flight startup script is cancelled.
                        token.cancel();
                    }
                }
                let dependents = self.active_hard_dependents(name);
                if dependents.is_empty() {
                    if !inflight {
                        self.resolve_pending_stop(name);
                    }
                    return;
                }
                let epoch = self.entries.get(name).map(|e| e.epoch).unwrap_or(0);
                let tx = self.cmd_tx.clone();
                let service = name.to_string();
                let wait = self.config.dependents_wait;
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = tx.send(Command::DependentsWaitElapsed { name: service, epoch });
                });
                for dependent in dependents {
                    let requeue_dependent =
                        self.entries.get(&dependent).map(|e| e.desired).unwrap_or(false);
                    self.request_stop(
                        &dependent,
                        requeue_dependent,
                        TransitionCause::DependencyChanged { dependency: name.to_string() },
                    );
                }
            }
            ServiceState::Errored => {
                // Nothing is executing; cancel the retry timer.
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.epoch += 1;
                }
                if requeue {
                    self.apply_transition(name, ServiceState::Installed, cause);
                } else {
                    self.apply_transition(name, ServiceState::Stopping, cause);
                    self.apply_transition(name, ServiceState::Finished, TransitionCause::Requested);
                    self.check_stop_watches();
                }
            }
            ServiceState::New if inflight => {
                // Cancel a mid-flight install; the service stays NEW.
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.pending_stop = Some(PendingStop { cause, requeue });
                    if let Some(token) = &entry.phase_stop {
                        token.cancel();
                    }
                }
            }
            _ => {}
        }
    }

    /// HARD dependents of `name` that are still up.
    fn active_hard_dependents(&self, name: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                entry.is_up()
                    && entry
                        .spec
                        .dependencies
                        .iter()
                        .any(|(dep, kind)| dep == name && *kind == DependencyKind::Hard)
            })
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    /// Begin the actual stop once dependents are out of the way.
    fn resolve_pending_stop(&mut self, name: &str) {
        let state = match self.entries.get(name) {
            Some(entry) if entry.pending_stop.is_some() => entry.state,
            _ => return,
        };
        match state {
            ServiceState::Running | ServiceState::Starting => self.begin_stop(name),
            _ => {
                // Install was cancelled or the service already wound
                // down; nothing to stop.
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.pending_stop = None;
                }
                self.check_stop_watches();
            }
        }
    }

    fn begin_stop(&mut self, name: &str) {
        let (cause, shutdown_step, epoch) = match self.entries.get_mut(name) {
            Some(entry) => {
                let pending = entry.pending_stop.take();
                let (cause, requeue) = pending
                    .map(|p| (p.cause, p.requeue))
                    .unwrap_or((TransitionCause::Requested, false));
                entry.requeue_after_stop = requeue;
                entry.stop_cause = Some(cause.clone());
                entry.epoch += 1;
                // Cancel the run script; the runner soft-stops then
                // hard-kills. Its exit message carries a stale epoch.
                if let Some(token) = entry.run_stop.take() {
                    token.cancel();
                }
                entry.started_at = None;
                entry.stable = false;
                (cause, entry.spec.lifecycle.shutdown.clone(), entry.epoch)
            }
            None => return,
        };

        debug!(service = name, "stopping");
        self.apply_transition(name, ServiceState::Stopping, cause);

        match shutdown_step {
            Some(step) => {
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.waiting_shutdown = true;
                }
                self.launch_phase(name, ScriptPhase::Shutdown, &step);
                let tx = self.cmd_tx.clone();
                let service = name.to_string();
                let timeout = self.config.stop_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx.send(Command::StopTimeout { name: service, epoch });
                });
            }
            None => self.maybe_finish_stop(name),
        }
    }

    fn maybe_finish_stop(&mut self, name: &str) {
        let ready = match self.entries.get(name) {
            Some(entry) => entry.state == ServiceState::Stopping && !entry.waiting_shutdown,
            None => false,
        };
        if ready {
            self.finish_stop(name, false);
        }
    }

    fn finish_stop(&mut self, name: &str, forced: bool) {
        let (requeue, cause) = match self.entries.get_mut(name) {
            Some(entry) => {
                let requeue = entry.requeue_after_stop;
                entry.requeue_after_stop = false;
                entry.waiting_shutdown = false;
                let cause = if forced {
                    TransitionCause::ForcedStop
                } else {
                    entry.stop_cause.take().unwrap_or(TransitionCause::Requested)
                };
                (requeue, cause)
            }
            None => return,
        };
        if requeue {
            self.apply_transition(name, ServiceState::Installed, cause);
            self.try_advance(name);
        } else {
            self.apply_transition(name, ServiceState::Finished, cause);
        }
        self.check_stop_watches();
    }

    fn stop_timeout(&mut self, name: &str, epoch: u64) {
        let still_stopping = match self.entries.get_mut(name) {
            Some(entry) => {
                if entry.epoch != epoch || entry.state != ServiceState::Stopping {
                    false
                } else {
                    if let Some(token) = entry.phase_stop.take() {
                        token.cancel();
                    }
                    entry.phase_inflight = None;
                    true
                }
            }
            None => false,
        };
        if still_stopping {
            warn!(service = name, "stop deadline elapsed; forcing");
            self.finish_stop(name, true);
        }
    }

    fn dependents_wait_elapsed(&mut self, name: &str, epoch: u64) {
        let pending = match self.entries.get(name) {
            Some(entry) => entry.epoch == epoch && entry.pending_stop.is_some(),
            None => false,
        };
        if !pending {
            return;
        }
        if !self.active_hard_dependents(name).is_empty() {
            warn!(service = name, "dependents still up after bounded wait; stopping anyway");
        }
        self.resolve_pending_stop(name);
    }

    // -- transitions --

    /// Apply a state change, emit events, and propagate to dependents.
    fn apply_transition(&mut self, name: &str, new: ServiceState, cause: TransitionCause) {
        let old = match self.entries.get_mut(name) {
            Some(entry) => {
                let old = entry.state;
                if old == new {
                    return;
                }
                if !transition_allowed(old, new) {
                    warn!(service = name, %old, %new, "illegal transition requested; ignoring");
                    return;
                }
                entry.state = new;
                old
            }
            None => return,
        };

        info!(service = name, %old, %new, "service state changed");
        let change = StateChange {
            service: name.to_string(),
            old,
            new,
            timestamp_ms: self.shared.clock.epoch_ms(),
            cause: Some(cause),
        };

        self.publish_view(name);
        self.write_state_leaf(name, new);
        for listener in self.shared.listeners.lock().iter() {
            listener(&change);
        }

        if old.satisfies_dependents() && !new.satisfies_dependents() {
            self.on_dependency_lost(name, new);
        } else if !old.satisfies_dependents() && new.satisfies_dependents() {
            self.on_dependency_available(name);
        }

        // A dependent going down may unblock a dependency's pending stop.
        if !matches!(
            new,
            ServiceState::Starting | ServiceState::Running | ServiceState::Stopping
        ) {
            let deps: Vec<String> = self
                .entries
                .get(name)
                .map(|entry| {
                    entry
                        .spec
                        .dependencies
                        .iter()
                        .filter(|(_, kind)| *kind == DependencyKind::Hard)
                        .map(|(dep, _)| dep.clone())
                        .collect()
                })
                .unwrap_or_default();
            for dep in deps {
                let pending = self
                    .entries
                    .get(&dep)
                    .map(|entry| entry.pending_stop.is_some())
                    .unwrap_or(false);
                if pending && self.active_hard_dependents(&dep).is_empty() {
                    self.resolve_pending_stop(&dep);
                }
            }
        }

        self.check_start_watches();
        self.check_stop_watches();
    }

    fn on_dependency_lost(&mut self, name: &str, new_state: ServiceState) {
        let mut hard: Vec<String> = Vec::new();
        let mut soft: Vec<String> = Vec::new();
        for (dependent, entry) in &self.entries {
            for (dep, kind) in &entry.spec.dependencies {
                if dep != name {
                    continue;
                }
                match kind {
                    DependencyKind::Hard
                        if matches!(
                            entry.state,
                            ServiceState::Starting | ServiceState::Running
                        ) =>
                    {
                        hard.push(dependent.clone())
                    }
                    DependencyKind::Soft => soft.push(dependent.clone()),
                    _ => {}
                }
            }
        }

        for dependent in hard {
            let requeue = self.entries.get(&dependent).map(|e| e.desired).unwrap_or(false);
            self.request_stop(
                &dependent,
                requeue,
                TransitionCause::DependencyChanged { dependency: name.to_string() },
            );
        }
        for dependent in soft {
            let notice = DependencyNotice {
                service: dependent,
                dependency: name.to_string(),
                dependency_state: new_state,
            };
            for listener in self.shared.notice_listeners.lock().iter() {
                listener(&notice);
            }
        }
    }

    fn on_dependency_available(&mut self, name: &str) {
        let waiting: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.desired
                    && entry.state == ServiceState::Installed
                    && entry
                        .spec
                        .dependencies
                        .iter()
                        .any(|(dep, kind)| dep == name && *kind == DependencyKind::Hard)
            })
            .map(|(dependent, _)| dependent.clone())
            .collect();
        for dependent in waiting {
            self.try_advance(&dependent);
        }
    }

    // -- plumbing --

    fn launch_phase(&mut self, name: &str, phase: ScriptPhase, step: &Step) {
        let spec = self.build_spec(name, phase, step);
        let token = CancellationToken::new();
        let epoch = match self.entries.get_mut(name) {
            Some(entry) => {
                entry.phase_stop = Some(token.clone());
                entry.phase_inflight = Some(phase);
                entry.epoch
            }
            None => return,
        };
        let runner = Arc::clone(&self.runner);
        let tx = self.cmd_tx.clone();
        let service = name.to_string();
        tokio::spawn(async move {
            let outcome = runner.run(&spec, token).await;
            let _ = tx.send(Command::ScriptDone { name: service, phase, outcome, epoch });
        });
    }

    fn build_spec(&self, name: &str, phase: ScriptPhase, step: &Step) -> ScriptSpec {
        let mut env: Vec<(String, String)> = Vec::new();

        // HOME is the running user's home, never the work directory.
        if let Some(home) = dirs::home_dir() {
            env.push(("HOME".to_string(), home.to_string_lossy().into_owned()));
        }
        if let Some(token) = self
            .shared
            .store
            .get_value(&crate::env::service_runtime_path(name).child("token"))
            .and_then(|v| v.as_str().map(str::to_string))
        {
            env.push(("SVCUID".to_string(), token));
        }
        if let Some(url) = &self.config.credentials_url {
            env.push(("AWS_CONTAINER_CREDENTIALS_FULL_URI".to_string(), url.clone()));
        }

        // setenv layering: recipe lifecycle, then step, then deployment
        // configuration; later layers win.
        if let Some(entry) = self.entries.get(name) {
            for (key, value) in &entry.spec.lifecycle.setenv {
                upsert_env(&mut env, key, value);
            }
        }
        if let Some(setenv) = step.setenv() {
            for (key, value) in setenv {
                upsert_env(&mut env, key, value);
            }
        }
        let config_setenv = crate::env::service_config_path(name).child("setenv");
        if let Some(info) = self.shared.store.lookup(&config_setenv) {
            for child in info.children {
                if let Some(ConfigValue::String(value)) =
                    self.shared.store.get_value(&config_setenv.child(&child))
                {
                    upsert_env(&mut env, &child, &value);
                }
            }
        }

        let default_timeout = match phase {
            ScriptPhase::Run => None,
            ScriptPhase::Shutdown => Some(self.config.stop_timeout),
            _ => Some(Duration::from_secs(120)),
        };

        ScriptSpec {
            service: name.to_string(),
            phase,
            command: step.script().to_string(),
            timeout: step.timeout_seconds().map(Duration::from_secs).or(default_timeout),
            env,
            cwd: self.config.work_root.join(name),
            skipif: step.skipif().cloned(),
        }
    }

    fn publish_view(&self, name: &str) {
        if let Some(entry) = self.entries.get(name) {
            self.shared.views.lock().insert(
                name.to_string(),
                ServiceView {
                    name: name.to_string(),
                    version: entry.spec.version.to_string(),
                    state: entry.state,
                    dependencies: entry.spec.dependencies.clone(),
                    last_error: entry.last_error.clone(),
                },
            );
        }
    }

    /// Mirror the state under the service's runtime subtree so config
    /// subscribers on the service node observe transitions.
    fn write_state_leaf(&self, name: &str, state: ServiceState) {
        let path = crate::env::service_runtime_path(name).child("state");
        let ts = self.shared.clock.epoch_ms();
        if let Err(e) = self.shared.store.set_leaf(&path, ConfigValue::from(state.to_string()), ts)
        {
            warn!(service = name, error = %e, "failed to mirror service state");
        }
    }

    fn check_start_watches(&mut self) {
        let entries = &self.entries;
        for watch in &mut self.start_watches {
            if watch.reply.is_none() {
                continue;
            }
            let broken = watch.services.iter().find(|name| {
                entries.get(name.as_str()).map(|e| e.state) == Some(ServiceState::Broken)
            });
            if let Some(name) = broken {
                if let Some(reply) = watch.reply.take() {
                    let _ = reply.send(Err(format!("{name} is BROKEN")));
                }
                continue;
            }
            let all_up = watch.services.iter().all(|name| {
                entries.get(name.as_str()).map(Entry::satisfies).unwrap_or(false)
            });
            if all_up {
                if let Some(reply) = watch.reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
        }
        self.start_watches.retain(|watch| watch.reply.is_some());
    }

    fn check_stop_watches(&mut self) {
        let entries = &self.entries;
        for watch in &mut self.stop_watches {
            if watch.reply.is_none() {
                continue;
            }
            let stopped = entries
                .get(&watch.service)
                .map(|entry| !entry.is_up() && entry.pending_stop.is_none())
                .unwrap_or(true);
            if stopped {
                if let Some(reply) = watch.reply.take() {
                    let _ = reply.send(());
                }
            }
        }
        self.stop_watches.retain(|watch| watch.reply.is_some());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureContext {
    Install,
    Startup,
    Runtime,
}

impl std::fmt::Display for FailureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailureContext::Install => "install",
            FailureContext::Startup => "startup",
            FailureContext::Runtime => "run",
        })
    }
}

fn upsert_env(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    match env.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value.to_string(),
        None => env.push((key.to_string(), value.to_string())),
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
