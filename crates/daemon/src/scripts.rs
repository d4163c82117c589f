// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle script execution.
//!
//! Scripts run on their own tasks so a blocking script can never starve
//! the supervisor loop. Cancellation is soft-stop first (SIGTERM to the
//! process group), hard-kill after a grace period.

use async_trait::async_trait;
use ember_recipe::Skipif;
#[cfg(any(test, feature = "test-support"))]
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace between soft stop and hard kill.
pub const SOFT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Which lifecycle step a script belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptPhase {
    Bootstrap,
    Install,
    Startup,
    Run,
    Shutdown,
    Recover,
}

ember_core::simple_display! {
    ScriptPhase {
        Bootstrap => "bootstrap",
        Install => "install",
        Startup => "startup",
        Run => "run",
        Shutdown => "shutdown",
        Recover => "recover",
    }
}

/// Everything needed to execute one lifecycle step.
#[derive(Debug, Clone)]
pub struct ScriptSpec {
    pub service: String,
    pub phase: ScriptPhase,
    pub command: String,
    /// Per-step timeout; `None` means no deadline.
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub skipif: Option<Skipif>,
}

/// How a script ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// Skipif condition held; the step never ran.
    Skipped,
    Exited { code: i32 },
    /// Stopped by deadline or cancellation and did not exit in grace.
    Killed,
    FailedToStart { message: String },
}

impl ScriptOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ScriptOutcome::Skipped | ScriptOutcome::Exited { code: 0 })
    }
}

/// Executes lifecycle scripts. One implementation talks to the host;
/// the fake is scripted by tests.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run to completion, honoring `spec.timeout` and `cancel`.
    async fn run(&self, spec: &ScriptSpec, cancel: CancellationToken) -> ScriptOutcome;
}

/// A long-running script with a stop control.
pub struct RunningScript {
    stop: CancellationToken,
    done: tokio::task::JoinHandle<ScriptOutcome>,
}

impl RunningScript {
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Request soft stop (hard kill after grace).
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub async fn wait(self) -> ScriptOutcome {
        self.done.await.unwrap_or(ScriptOutcome::Killed)
    }
}

/// Launch `spec` on its own task.
pub fn spawn_script(
    runner: &std::sync::Arc<dyn ScriptRunner>,
    spec: ScriptSpec,
) -> RunningScript {
    let stop = CancellationToken::new();
    let cancel = stop.clone();
    let runner = std::sync::Arc::clone(runner);
    let done = tokio::spawn(async move { runner.run(&spec, cancel).await });
    RunningScript { stop, done }
}

/// Runs scripts via `sh -c` on the host.
#[derive(Default)]
pub struct HostScriptRunner;

impl HostScriptRunner {
    pub fn new() -> Self {
        Self
    }

    fn should_skip(skipif: &Skipif) -> bool {
        match skipif {
            Skipif::OnPath(executable) => on_path(executable),
            Skipif::Exists(path) => path.exists(),
        }
    }

    fn launch(spec: &ScriptSpec) -> std::io::Result<Child> {
        std::fs::create_dir_all(&spec.cwd)?;
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);
        command.spawn()
    }
}

#[async_trait]
impl ScriptRunner for HostScriptRunner {
    async fn run(&self, spec: &ScriptSpec, cancel: CancellationToken) -> ScriptOutcome {
        if let Some(skipif) = &spec.skipif {
            if Self::should_skip(skipif) {
                debug!(service = %spec.service, phase = %spec.phase, "skipif held; skipping");
                return ScriptOutcome::Skipped;
            }
        }

        let mut child = match Self::launch(spec) {
            Ok(child) => child,
            Err(e) => {
                warn!(service = %spec.service, phase = %spec.phase, error = %e, "script failed to start");
                return ScriptOutcome::FailedToStart { message: e.to_string() };
            }
        };

        let deadline = async {
            match spec.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            status = child.wait() => outcome_of(status),
            _ = cancel.cancelled() => stop_child(&mut child).await,
            _ = deadline => {
                warn!(service = %spec.service, phase = %spec.phase, "script deadline elapsed");
                stop_child(&mut child).await
            }
        }
    }
}

fn outcome_of(status: std::io::Result<std::process::ExitStatus>) -> ScriptOutcome {
    match status {
        Ok(status) => ScriptOutcome::Exited { code: status.code().unwrap_or(-1) },
        Err(e) => ScriptOutcome::FailedToStart { message: e.to_string() },
    }
}

/// Soft-stop, then hard-kill after the grace period.
async fn stop_child(child: &mut Child) -> ScriptOutcome {
    soft_stop(child);
    match tokio::time::timeout(SOFT_STOP_GRACE, child.wait()).await {
        Ok(status) => {
            // Exited within grace; report the real exit.
            outcome_of(status)
        }
        Err(_) => {
            let _ = child.kill().await;
            ScriptOutcome::Killed
        }
    }
}

#[cfg(unix)]
fn soft_stop(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn soft_stop(_child: &Child) {}

/// Is `executable` findable on `$PATH`?
fn on_path(executable: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(executable).is_file())
}

// -- fake runner for tests --

/// Scripted behavior for one invocation of a phase.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Exit 0 immediately.
    Succeed,
    /// Exit with this code immediately.
    Fail(i32),
    /// Stay alive until stopped, then exit 0.
    RunUntilStopped,
    /// Exit with this code after a delay (crash simulation).
    ExitAfter { delay: Duration, code: i32 },
    /// Ignore soft stop; only a kill ends it.
    Hang,
}

/// Scripted `ScriptRunner` for supervisor and deployment tests.
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
pub struct FakeScriptRunner {
    behaviors: parking_lot::Mutex<HashMap<(String, ScriptPhase), std::collections::VecDeque<FakeBehavior>>>,
    invocations: parking_lot::Mutex<Vec<(String, ScriptPhase)>>,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a behavior for the next invocation of `(service, phase)`.
    /// Without queued behaviors, install/startup/shutdown/recover
    /// succeed immediately and `run` stays alive until stopped.
    pub fn script(&self, service: &str, phase: ScriptPhase, behavior: FakeBehavior) {
        self.behaviors
            .lock()
            .entry((service.to_string(), phase))
            .or_default()
            .push_back(behavior);
    }

    /// Every `(service, phase)` executed so far, in order.
    pub fn invocations(&self) -> Vec<(String, ScriptPhase)> {
        self.invocations.lock().clone()
    }

    pub fn ran(&self, service: &str, phase: ScriptPhase) -> bool {
        self.invocations
            .lock()
            .iter()
            .any(|(s, p)| s == service && *p == phase)
    }

    fn next_behavior(&self, service: &str, phase: ScriptPhase) -> FakeBehavior {
        let mut behaviors = self.behaviors.lock();
        if let Some(queue) = behaviors.get_mut(&(service.to_string(), phase)) {
            if let Some(behavior) = queue.pop_front() {
                return behavior;
            }
        }
        match phase {
            ScriptPhase::Run => FakeBehavior::RunUntilStopped,
            _ => FakeBehavior::Succeed,
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl ScriptRunner for FakeScriptRunner {
    async fn run(&self, spec: &ScriptSpec, cancel: CancellationToken) -> ScriptOutcome {
        self.invocations.lock().push((spec.service.clone(), spec.phase));
        match self.next_behavior(&spec.service, spec.phase) {
            FakeBehavior::Succeed => ScriptOutcome::Exited { code: 0 },
            FakeBehavior::Fail(code) => ScriptOutcome::Exited { code },
            FakeBehavior::RunUntilStopped => {
                cancel.cancelled().await;
                ScriptOutcome::Exited { code: 0 }
            }
            FakeBehavior::ExitAfter { delay, code } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => ScriptOutcome::Exited { code },
                    _ = cancel.cancelled() => ScriptOutcome::Exited { code: 0 },
                }
            }
            FakeBehavior::Hang => {
                cancel.cancelled().await;
                ScriptOutcome::Killed
            }
        }
    }
}

#[cfg(test)]
#[path = "scripts_tests.rs"]
mod tests;
