// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The deployment engine.
//!
//! Applies desired-state documents one at a time (FIFO). A deployment
//! walks: document validation → dependency closure → staging (forward
//! and inverse batches) → validation announce over IPC → atomic
//! activation → settle watch → persisted record. Rollback replays the
//! inverse batch captured at stage time, never an undo via the log.
//!
//! A deployment cancelled before activation leaves the live config
//! untouched; the staged state only ever lived in a shadow view.

use crate::env::EmberPaths;
use crate::ipc::TokenRegistry;
use crate::supervisor::{ServiceSpec, Supervisor};
use async_trait::async_trait;
use ember_config::{
    plan_component_update, stamp, subtree_ops, ConfigStore, ConfigValue, PlanOp, ShadowView,
    UpdatePlan,
};
use ember_core::{
    Clock, ComponentUpdateAction, ConfigUpdate, DeploymentRecord, DeploymentStatus, ErrorKind,
    FailureHandling,
};
use ember_recipe::{resolve, RecipeCache, Resolution};
use indexmap::IndexMap;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A service's rejection of a proposed configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub service: String,
    pub reason: String,
}

/// Announces pending configuration to affected services and collects
/// their verdicts. Implemented by the IPC router; tests use a fake.
#[async_trait]
pub trait ValidationBroadcaster: Send + Sync {
    async fn validate(
        &self,
        deployment_id: &str,
        configs: &IndexMap<String, serde_json::Value>,
        timeout: Duration,
    ) -> Vec<Rejection>;
}

/// A broadcaster with nobody listening (validation always passes).
pub struct NoopBroadcaster;

#[async_trait]
impl ValidationBroadcaster for NoopBroadcaster {
    async fn validate(
        &self,
        _deployment_id: &str,
        _configs: &IndexMap<String, serde_json::Value>,
        _timeout: Duration,
    ) -> Vec<Rejection> {
        Vec::new()
    }
}

/// Everything a running deployment needs.
pub struct EngineCtx<C: Clock> {
    pub store: Arc<ConfigStore>,
    pub cache: Arc<RecipeCache>,
    pub supervisor: Supervisor<C>,
    pub tokens: Arc<TokenRegistry<C>>,
    pub broadcaster: Arc<dyn ValidationBroadcaster>,
    pub clock: C,
    pub paths: EmberPaths,
    pub os: String,
    pub architecture: String,
    pub settle: Duration,
}

enum EngineCmd {
    Submit { record: DeploymentRecord, ack: oneshot::Sender<()> },
    Cancel { id: String, reply: oneshot::Sender<Result<(), String>> },
    Finished { id: String },
}

/// Handle for submitting and cancelling deployments.
#[derive(Clone)]
pub struct DeploymentEngine {
    tx: mpsc::UnboundedSender<EngineCmd>,
}

impl DeploymentEngine {
    /// Queue a deployment; resolves once the QUEUED record is
    /// persisted.
    pub async fn submit(&self, record: DeploymentRecord) -> Result<(), String> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(EngineCmd::Submit { record, ack })
            .map_err(|_| "deployment engine stopped".to_string())?;
        rx.await.map_err(|_| "deployment engine stopped".to_string())
    }

    /// Cancel a queued deployment (dequeue) or the active one
    /// (rollback per the phase reached).
    pub async fn cancel(&self, id: &str) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCmd::Cancel { id: id.to_string(), reply })
            .map_err(|_| "deployment engine stopped".to_string())?;
        rx.await.map_err(|_| "deployment engine stopped".to_string())?
    }
}

/// Owns the FIFO queue; at most one deployment executes at a time.
pub struct EngineDriver<C: Clock> {
    ctx: Arc<EngineCtx<C>>,
    tx: mpsc::UnboundedSender<EngineCmd>,
    rx: mpsc::UnboundedReceiver<EngineCmd>,
    queue: VecDeque<DeploymentRecord>,
    active: Option<(String, CancellationToken)>,
}

impl<C: Clock + 'static> EngineDriver<C> {
    pub fn new(ctx: EngineCtx<C>) -> (DeploymentEngine, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = DeploymentEngine { tx: tx.clone() };
        let driver =
            Self { ctx: Arc::new(ctx), tx, rx, queue: VecDeque::new(), active: None };
        (engine, driver)
    }

    /// Shared context, e.g. for crash recovery before `run`.
    pub fn context(&self) -> Arc<EngineCtx<C>> {
        Arc::clone(&self.ctx)
    }

    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                EngineCmd::Submit { record, ack } => {
                    persist(&self.ctx, &record, &[]);
                    info!(deployment = %record.id, "deployment queued");
                    self.queue.push_back(record);
                    let _ = ack.send(());
                    self.maybe_start();
                }
                EngineCmd::Cancel { id, reply } => {
                    let result = self.cancel(&id);
                    let _ = reply.send(result);
                }
                EngineCmd::Finished { id } => {
                    if self.active.as_ref().map(|(active, _)| active == &id).unwrap_or(false) {
                        self.active = None;
                    }
                    self.maybe_start();
                }
            }
        }
    }

    fn cancel(&mut self, id: &str) -> Result<(), String> {
        if let Some((active, token)) = &self.active {
            if active == id {
                token.cancel();
                return Ok(());
            }
        }
        if let Some(index) = self.queue.iter().position(|record| record.id == id) {
            if let Some(mut record) = self.queue.remove(index) {
                record.status = DeploymentStatus::Canceled;
                record.completed_at_ms = Some(self.ctx.clock.epoch_ms());
                persist(&self.ctx, &record, &[]);
            }
            return Ok(());
        }
        Err(format!("deployment {id} is not queued or active"))
    }

    fn maybe_start(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(record) = self.queue.pop_front() else { return };
        let token = CancellationToken::new();
        self.active = Some((record.id.clone(), token.clone()));
        let ctx = Arc::clone(&self.ctx);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let id = record.id.clone();
            run_deployment(ctx, record, token).await;
            let _ = tx.send(EngineCmd::Finished { id });
        });
    }
}

/// Staged state captured before activation.
struct Staged {
    forward: Vec<PlanOp>,
    inverse: Vec<PlanOp>,
    specs: Vec<ServiceSpec>,
    /// Services introduced by this deployment.
    added: Vec<String>,
    /// Services dropped by this deployment.
    removed: Vec<String>,
    /// Services whose configuration changed (validation targets).
    affected: Vec<String>,
    /// Pre-deployment specs, for rollback.
    prior_specs: Vec<ServiceSpec>,
    /// Services that were up pre-deployment.
    prior_running: Vec<String>,
    roots: Vec<String>,
}

enum Outcome {
    Succeeded,
    Failed { kind: ErrorKind, message: String },
    RolledBack { kind: ErrorKind, message: String },
    Canceled,
}

async fn run_deployment<C: Clock + 'static>(
    ctx: Arc<EngineCtx<C>>,
    mut record: DeploymentRecord,
    cancel: CancellationToken,
) {
    record.status = DeploymentStatus::InProgress;
    record.phase = 1;
    persist(&ctx, &record, &[]);
    info!(deployment = %record.id, "deployment started");

    let outcome = execute_inner(&ctx, &mut record, &cancel).await;

    let (status, kind, message) = match outcome {
        Outcome::Succeeded => (DeploymentStatus::Succeeded, None, None),
        Outcome::Failed { kind, message } => {
            (DeploymentStatus::Failed, Some(kind), Some(message))
        }
        Outcome::RolledBack { kind, message } => {
            (DeploymentStatus::RolledBack, Some(kind), Some(message))
        }
        Outcome::Canceled => (DeploymentStatus::Canceled, None, None),
    };
    record.status = status;
    record.error_kind = kind;
    record.error_message = message.clone();
    record.completed_at_ms = Some(ctx.clock.epoch_ms());
    persist(&ctx, &record, &[]);
    match &message {
        Some(message) => warn!(deployment = %record.id, %status, message, "deployment ended"),
        None => info!(deployment = %record.id, %status, "deployment ended"),
    }
}

async fn execute_inner<C: Clock + 'static>(
    ctx: &Arc<EngineCtx<C>>,
    record: &mut DeploymentRecord,
    cancel: &CancellationToken,
) -> Outcome {
    // Phase 1: document validation.
    let targets = match validate_document(record) {
        Ok(targets) => targets,
        Err(message) => {
            return Outcome::Failed { kind: ErrorKind::MalformedConfig, message }
        }
    };
    if cancel.is_cancelled() {
        return Outcome::Canceled;
    }

    // Phase 2: dependency closure.
    record.phase = 2;
    persist(ctx, record, &[]);
    let resolution = match resolve(&targets, &ctx.cache) {
        Ok(resolution) => resolution,
        Err(e) => return Outcome::Failed { kind: e.kind(), message: e.to_string() },
    };
    if cancel.is_cancelled() {
        return Outcome::Canceled;
    }

    // Phase 3: stage config changes and capture the inverse.
    record.phase = 3;
    let staged = match stage(ctx, record, &resolution) {
        Ok(staged) => staged,
        Err(message) => {
            return Outcome::Failed { kind: ErrorKind::MalformedConfig, message }
        }
    };
    persist(ctx, record, &staged.inverse);
    if cancel.is_cancelled() {
        return Outcome::Canceled;
    }

    // Phase 4: announce the shadow configuration for validation.
    if record.doc.policies.component_update == ComponentUpdateAction::NotifyComponents
        && !staged.affected.is_empty()
    {
        record.phase = 4;
        persist(ctx, record, &staged.inverse);

        let shadow = ShadowView::new(&ctx.store, &stamp(&staged.forward, ctx.clock.epoch_ms()));
        let mut configs = IndexMap::new();
        for name in &staged.affected {
            let config = shadow
                .subtree_json(&crate::env::service_config_path(name))
                .unwrap_or_else(|| serde_json::json!({}));
            configs.insert(name.clone(), config);
        }
        let timeout = Duration::from_secs(record.doc.policies.validation_timeout_seconds);

        let rejections = tokio::select! {
            rejections = ctx.broadcaster.validate(&record.id, &configs, timeout) => rejections,
            _ = cancel.cancelled() => return Outcome::Canceled,
        };
        if !rejections.is_empty() {
            let message = rejections
                .iter()
                .map(|r| format!("{}: {}", r.service, r.reason))
                .collect::<Vec<_>>()
                .join("; ");
            // Nothing was activated, so there is nothing to roll back.
            return Outcome::Failed { kind: ErrorKind::ValidationRejected, message };
        }
    }
    if cancel.is_cancelled() {
        return Outcome::Canceled;
    }

    // Phase 5: activate under the store's write lock as one batch.
    record.phase = 5;
    persist(ctx, record, &staged.inverse);
    let ts = ctx.clock.epoch_ms();
    if let Err(e) = ctx.store.batch(stamp(&staged.forward, ts)) {
        // The batch is all-or-nothing: a store-validator rejection
        // leaves the tree untouched.
        return Outcome::Failed { kind: e.kind(), message: e.to_string() };
    }

    for name in &staged.removed {
        let _ = ctx.supervisor.stop(name).await;
        ctx.supervisor.remove_service(name);
    }
    for spec in &staged.specs {
        if let Err(e) = ctx.tokens.issue_service_token(&spec.name) {
            warn!(service = %spec.name, error = %e, "token issue failed");
        }
        ctx.supervisor.upsert_service(spec.clone());
    }
    let mut desired = IndexMap::new();
    for spec in &staged.specs {
        desired.insert(spec.name.clone(), true);
    }
    ctx.supervisor.submit(desired);

    // Phase 6: watch the settle window for BROKEN services.
    record.phase = 6;
    persist(ctx, record, &staged.inverse);
    let mut starts = Vec::new();
    for root in &staged.roots {
        starts.push(ctx.supervisor.start(root));
    }
    let settle = async {
        for start in starts {
            match start.await {
                Ok(Ok(())) => {}
                Ok(Err(message)) => return Err(message),
                Err(_) => return Err("supervisor stopped".to_string()),
            }
        }
        Ok(())
    };

    let failure = if record.doc.policies.failure_handling == FailureHandling::Rollback {
        tokio::select! {
            result = settle => match result {
                Ok(()) => None,
                Err(message) => Some((ErrorKind::BrokenExhausted, message)),
            },
            _ = tokio::time::sleep(ctx.settle) => None,
            _ = cancel.cancelled() => Some((ErrorKind::Timeout, "cancelled".to_string())),
        }
    } else {
        // DO_NOTHING ignores service failures: the settle watch is
        // detached. An explicit cancel while the deployment is still
        // IN_PROGRESS rolls back regardless of policy.
        tokio::spawn(async move {
            let _ = settle.await;
        });
        tokio::select! {
            _ = tokio::time::sleep(ctx.settle) => None,
            _ = cancel.cancelled() => Some((ErrorKind::Timeout, "cancelled".to_string())),
        }
    };

    match failure {
        None => {
            record.phase = 7;
            Outcome::Succeeded
        }
        Some((kind, message)) => {
            rollback(ctx, &staged).await;
            if cancel.is_cancelled() {
                Outcome::Canceled
            } else {
                Outcome::RolledBack { kind, message }
            }
        }
    }
}

/// Parse top-level targets; reject malformed configuration updates.
fn validate_document(record: &DeploymentRecord) -> Result<Vec<(String, VersionReq)>, String> {
    let mut targets = Vec::new();
    for (name, target) in &record.doc.components {
        if name.is_empty() {
            return Err("component name must not be empty".to_string());
        }
        let requirement = parse_requirement(&target.version)
            .ok_or_else(|| format!("invalid version requirement for {name}: {}", target.version))?;
        if let Some(update) = &target.configuration_update {
            validate_update(name, update)?;
        }
        targets.push((name.clone(), requirement));
    }
    Ok(targets)
}

/// An exact version means exactly that version; anything else is a
/// semver range.
fn parse_requirement(text: &str) -> Option<VersionReq> {
    if let Ok(version) = Version::parse(text) {
        return VersionReq::parse(&format!("={version}")).ok();
    }
    VersionReq::parse(text).ok()
}

fn validate_update(name: &str, update: &ConfigUpdate) -> Result<(), String> {
    if let Some(merge) = &update.merge {
        if !merge.is_object() {
            return Err(format!("{name}: MERGE must be an object"));
        }
    }
    if let Some(resets) = &update.reset {
        for pointer in resets {
            if !pointer.is_empty() {
                ember_config::ConfigPath::from_pointer(pointer)
                    .map_err(|e| format!("{name}: {e}"))?;
            }
        }
    }
    Ok(())
}

/// Compute forward/inverse batches and the supervisor plan.
fn stage<C: Clock + 'static>(
    ctx: &EngineCtx<C>,
    record: &DeploymentRecord,
    resolution: &Resolution,
) -> Result<Staged, String> {
    let mut staged = Staged {
        forward: Vec::new(),
        inverse: Vec::new(),
        specs: Vec::new(),
        added: Vec::new(),
        removed: Vec::new(),
        affected: Vec::new(),
        prior_specs: Vec::new(),
        prior_running: Vec::new(),
        roots: record.doc.components.keys().cloned().collect(),
    };

    for (name, version) in &resolution.picks {
        let recipe = ctx
            .cache
            .load(name, version)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("recipe {name}-{version} disappeared"))?;
        let defaults = recipe.default_configuration();
        let base = crate::env::service_config_path(name);
        let live = ctx.store.subtree_json(&base);
        let update = record
            .doc
            .components
            .get(name)
            .and_then(|target| target.configuration_update.clone());

        let is_new = live.is_none();
        let plan: UpdatePlan = if is_new {
            // Fresh service: defaults first, then the document overlay.
            let mut effective = update.clone().unwrap_or_default();
            effective.reset = Some(vec![String::new()]);
            plan_component_update(&base, None, &defaults, &effective)
                .map_err(|e| e.to_string())?
        } else if let Some(update) = &update {
            plan_component_update(&base, live.as_ref(), &defaults, update)
                .map_err(|e| e.to_string())?
        } else {
            UpdatePlan::default()
        };

        if is_new {
            staged.added.push(name.clone());
        }
        if is_new || update.is_some() {
            staged.affected.push(name.clone());
        }
        staged.forward.extend(plan.forward);
        if is_new {
            // No part of this service's node existed before (runtime
            // included); rollback removes it outright.
            staged.inverse.push(PlanOp {
                path: crate::env::service_path(name),
                op: ember_config::WriteOp::Remove,
            });
        } else {
            staged.inverse.extend(plan.inverse);
        }

        // Version pick leaf.
        let version_path = crate::env::service_version_path(name);
        let old_version = ctx.store.get_value(&version_path);
        let new_version = ConfigValue::from(version.to_string());
        if old_version.as_ref() != Some(&new_version) {
            staged.forward.push(PlanOp {
                path: version_path.clone(),
                op: ember_config::WriteOp::SetLeaf(new_version),
            });
            if !is_new {
                staged.inverse.push(match old_version {
                    Some(previous) => PlanOp {
                        path: version_path,
                        op: ember_config::WriteOp::SetLeaf(previous),
                    },
                    None => PlanOp { path: version_path, op: ember_config::WriteOp::Remove },
                });
            }
        }

        staged.specs.push(ServiceSpec::from_recipe(&recipe, &ctx.os, &ctx.architecture));
    }

    // Services present now but absent from the new closure are removed.
    for view in ctx.supervisor.list_views() {
        if resolution.picks.contains_key(&view.name) {
            // Remember the pre-deployment pick for rollback.
            if let Ok(Some(recipe)) = ctx
                .cache
                .load(&view.name, &Version::parse(&view.version).unwrap_or(Version::new(0, 0, 0)))
            {
                staged
                    .prior_specs
                    .push(ServiceSpec::from_recipe(&recipe, &ctx.os, &ctx.architecture));
            }
            if view.state.satisfies_dependents() {
                staged.prior_running.push(view.name.clone());
            }
            continue;
        }

        staged.removed.push(view.name.clone());
        let base = crate::env::service_path(&view.name);
        if let Some(live) = ctx.store.subtree_json(&base) {
            staged.forward.push(PlanOp { path: base.clone(), op: ember_config::WriteOp::Remove });
            // The runtime child is owned by the runtime and excluded
            // from rollback.
            let mut restore = match live {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            restore.remove("runtime");
            staged.inverse.extend(
                subtree_ops(&base, &serde_json::Value::Object(restore))
                    .map_err(|e| e.to_string())?,
            );
        }
        if let Ok(Some(recipe)) = ctx
            .cache
            .load(&view.name, &Version::parse(&view.version).unwrap_or(Version::new(0, 0, 0)))
        {
            staged
                .prior_specs
                .push(ServiceSpec::from_recipe(&recipe, &ctx.os, &ctx.architecture));
            if view.state.satisfies_dependents() {
                staged.prior_running.push(view.name.clone());
            }
        }
    }

    Ok(staged)
}

/// Replay the inverse batch and restore pre-deployment services.
async fn rollback<C: Clock + 'static>(ctx: &EngineCtx<C>, staged: &Staged) {
    warn!("rolling back deployment");

    // Services this deployment introduced go away first, so their
    // final state mirror is written before the inverse batch removes
    // their node.
    for name in &staged.added {
        let _ = ctx.supervisor.stop(name).await;
        ctx.supervisor.remove_service(name);
    }

    let ts = ctx.clock.epoch_ms();
    if let Err(e) = ctx.store.batch(stamp(&staged.inverse, ts)) {
        warn!(error = %e, "inverse batch failed");
    }

    // Everything else returns to its pre-deployment pick.
    for spec in &staged.prior_specs {
        ctx.supervisor.upsert_service(spec.clone());
    }
    let mut desired = IndexMap::new();
    for name in &staged.prior_running {
        desired.insert(name.clone(), true);
    }
    ctx.supervisor.submit(desired);
    for name in &staged.prior_running {
        let start = ctx.supervisor.start(name);
        let _ = tokio::time::timeout(ctx.settle, start).await;
    }
}

/// Record + inverse batch as persisted on disk for crash recovery.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedDeployment {
    record: DeploymentRecord,
    #[serde(default)]
    inverse: Vec<PlanOp>,
}

/// Persist the record under the dedicated config subtree (the source
/// of truth for `list-local-deployments`) and mirror it to disk with
/// the inverse batch for crash rollback.
fn persist<C: Clock>(ctx: &EngineCtx<C>, record: &DeploymentRecord, inverse: &[PlanOp]) {
    let ts = ctx.clock.epoch_ms();
    match serde_json::to_string(record) {
        Ok(text) => {
            let path = crate::env::deployment_path(&record.id).child("record");
            if let Err(e) = ctx.store.set_leaf(&path, ConfigValue::from(text), ts) {
                warn!(deployment = %record.id, error = %e, "record write failed");
            }
            let status_path = crate::env::deployment_path(&record.id).child("status");
            let _ = ctx.store.set_leaf(
                &status_path,
                ConfigValue::from(record.status.to_string()),
                ts,
            );
        }
        Err(e) => warn!(deployment = %record.id, error = %e, "record serialize failed"),
    }

    let persisted = PersistedDeployment {
        record: record.clone(),
        inverse: inverse.to_vec(),
    };
    let path = ctx.paths.deployment_record_path(&record.id);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match serde_json::to_vec_pretty(&persisted) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(&path, bytes) {
                warn!(deployment = %record.id, error = %e, "record file write failed");
            }
        }
        Err(e) => warn!(deployment = %record.id, error = %e, "record file serialize failed"),
    }
}

/// Crash recovery: resume deployments left IN_PROGRESS.
///
/// Phase ≤ 3 restarts from scratch (nothing was announced or
/// activated); phase ≥ 4 rolls back using the persisted inverse batch.
pub async fn resume_pending<C: Clock + 'static>(
    ctx: &EngineCtx<C>,
    engine: &DeploymentEngine,
) {
    let Ok(entries) = std::fs::read_dir(ctx.paths.deployments_dir()) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(bytes) = std::fs::read(entry.path()) else { continue };
        let Ok(mut persisted) = serde_json::from_slice::<PersistedDeployment>(&bytes) else {
            continue;
        };
        if persisted.record.status != DeploymentStatus::InProgress {
            continue;
        }
        if persisted.record.phase <= 3 {
            info!(deployment = %persisted.record.id, "resuming interrupted deployment from scratch");
            persisted.record.status = DeploymentStatus::Queued;
            persisted.record.phase = 0;
            let _ = engine.submit(persisted.record).await;
        } else {
            info!(deployment = %persisted.record.id, "rolling back interrupted deployment");
            let ts = ctx.clock.epoch_ms();
            if let Err(e) = ctx.store.batch(stamp(&persisted.inverse, ts)) {
                warn!(deployment = %persisted.record.id, error = %e, "crash rollback failed");
            }
            persisted.record.status = DeploymentStatus::RolledBack;
            persisted.record.error_kind = Some(ErrorKind::Internal);
            persisted.record.error_message =
                Some("interrupted by restart; rolled back".to_string());
            persisted.record.completed_at_ms = Some(ts);
            persist(ctx, &persisted.record, &persisted.inverse);
        }
    }
}

#[cfg(test)]
#[path = "deployment_tests.rs"]
mod tests;
