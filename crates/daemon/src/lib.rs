// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ember-daemon: the long-running edge runtime (`emberd`).
//!
//! Hosts the dependency context, the per-service state machines and
//! supervisor, the deployment engine, and the authenticated local IPC
//! router.

pub mod context;
pub mod credentials;
pub mod deployment;
pub mod env;
pub mod fsm;
pub mod ipc;
pub mod lifecycle;
pub mod scripts;
pub mod supervisor;

pub use context::{Context, ContextError};
pub use credentials::{CredentialError, CredentialSource, FileCredentialSource};
pub use deployment::{
    resume_pending, DeploymentEngine, EngineCtx, EngineDriver, NoopBroadcaster, Rejection,
    ValidationBroadcaster,
};
pub use env::EmberPaths;
pub use ipc::{
    AuthzPolicy, CliHandler, ConfigHandler, ConnHandle, CredentialsHandler, Handler, HandlerError,
    LifecycleHandler, Principal, Router, TokenRegistry,
};
pub use scripts::{
    spawn_script, HostScriptRunner, RunningScript, ScriptOutcome, ScriptPhase, ScriptRunner,
    ScriptSpec,
};
pub use supervisor::{
    DependencyNotice, ServiceSpec, ServiceView, Supervisor, SupervisorConfig, SupervisorDriver,
};

#[cfg(any(test, feature = "test-support"))]
pub use credentials::StaticCredentialSource;
#[cfg(any(test, feature = "test-support"))]
pub use scripts::{FakeBehavior, FakeScriptRunner};
