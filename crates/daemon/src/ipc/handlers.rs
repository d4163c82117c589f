// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Destination handlers registered with the router at startup.

use super::{ConnHandle, Handler, HandlerError, Principal, Router};
use crate::deployment::DeploymentEngine;
use crate::env::EmberPaths;
use ember_config::{ConfigPath, ConfigStore, ConfigValue};
use ember_core::{Clock, DeploymentRecord, ErrorKind};
use ember_recipe::RecipeCache;
use ember_wire::{
    decode_payload, encode_payload, CliRequest, CliResponse, ComponentInfo, ConfigEvent,
    ConfigRequest, ConfigResponse, CredentialsRequest, Destination, LifecycleRequest,
    LifecycleResponse,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// LIFECYCLE route: service self-reports and event subscriptions.
pub struct LifecycleHandler<C: Clock> {
    supervisor: crate::supervisor::Supervisor<C>,
}

impl<C: Clock + 'static> LifecycleHandler<C> {
    pub fn new(supervisor: crate::supervisor::Supervisor<C>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl<C: Clock + 'static> Handler for LifecycleHandler<C> {
    async fn handle(
        &self,
        principal: &Principal,
        payload: &[u8],
        conn: &ConnHandle,
    ) -> Result<Vec<u8>, HandlerError> {
        let request: LifecycleRequest = decode_payload(payload)?;
        match request {
            LifecycleRequest::ReportState { state } => {
                debug!(service = %principal, reported = %state, "service reported state");
                self.supervisor.report_state(principal.name(), state);
                Ok(encode_payload(&LifecycleResponse::Ok)?)
            }
            LifecycleRequest::SubscribeComponentUpdates => {
                conn.subscribe_component_updates();
                Ok(encode_payload(&LifecycleResponse::Ok)?)
            }
        }
    }
}

/// CONFIG_STORE route: a service reads, writes, and watches its own
/// configuration subtree, and answers validation prompts.
pub struct ConfigHandler<C: Clock> {
    store: Arc<ConfigStore>,
    clock: C,
    router: Arc<Router>,
}

impl<C: Clock + 'static> ConfigHandler<C> {
    pub fn new(store: Arc<ConfigStore>, clock: C, router: Arc<Router>) -> Self {
        Self { store, clock, router }
    }

    fn own_path(principal: &Principal, relative: &str) -> Result<ConfigPath, HandlerError> {
        let Principal::Service(service) = principal else {
            return Err(HandlerError::new(ErrorKind::AuthzDenied, "services only"));
        };
        Ok(crate::env::service_config_path(service).join(&ConfigPath::parse(relative)))
    }
}

#[async_trait]
impl<C: Clock + 'static> Handler for ConfigHandler<C> {
    async fn handle(
        &self,
        principal: &Principal,
        payload: &[u8],
        conn: &ConnHandle,
    ) -> Result<Vec<u8>, HandlerError> {
        let request: ConfigRequest = decode_payload(payload)?;
        match request {
            ConfigRequest::Get { path } => {
                let full = Self::own_path(principal, &path)?;
                let info = self.store.lookup(&full);
                let response = ConfigResponse::Value {
                    path,
                    value: self.store.subtree_json(&full),
                    timestamp: info.map(|i| i.timestamp),
                };
                Ok(encode_payload(&response)?)
            }
            ConfigRequest::Update { path, value } => {
                let full = Self::own_path(principal, &path)?;
                let leaf = ConfigValue::from_json(&value).ok_or_else(|| {
                    HandlerError::new(ErrorKind::MalformedConfig, "value must be a scalar or list")
                })?;
                self.store
                    .set_leaf(&full, leaf, self.clock.epoch_ms())
                    .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;
                Ok(encode_payload(&ConfigResponse::Ok)?)
            }
            ConfigRequest::SubscribeUpdates { path } => {
                let full = Self::own_path(principal, &path)?;
                let forward = conn.clone();
                let requested = path.clone();
                let handle = self.store.subscribe(
                    &full,
                    ember_config::WatchKind::ValueChanged,
                    move |event| {
                        if let ember_config::WatchEvent::ValueChanged { value, .. } = event {
                            let update = ConfigEvent::Updated {
                                path: requested.clone(),
                                value: value.as_ref().map(ConfigValue::to_json),
                            };
                            if let Ok(payload) = encode_payload(&update) {
                                // Non-blocking: a stalled client misses
                                // updates rather than stalling the store.
                                let _ = forward.push_event(Destination::ConfigStore, payload);
                            }
                        }
                    },
                );
                let store = Arc::clone(&self.store);
                conn.on_disconnect(move || store.unsubscribe(handle));
                Ok(encode_payload(&ConfigResponse::Ok)?)
            }
            ConfigRequest::ValidityReport { deployment_id, status, reason } => {
                let routed =
                    self.router.report_validity(&deployment_id, principal, status, reason);
                if !routed {
                    warn!(deployment = %deployment_id, "validity report with no pending validation");
                }
                Ok(encode_payload(&ConfigResponse::Ok)?)
            }
        }
    }
}

/// CREDENTIALS route: hand out credential material to services.
pub struct CredentialsHandler {
    source: Arc<dyn crate::credentials::CredentialSource>,
}

impl CredentialsHandler {
    pub fn new(source: Arc<dyn crate::credentials::CredentialSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Handler for CredentialsHandler {
    async fn handle(
        &self,
        principal: &Principal,
        payload: &[u8],
        _conn: &ConnHandle,
    ) -> Result<Vec<u8>, HandlerError> {
        let request: CredentialsRequest = decode_payload(payload)?;
        match request {
            CredentialsRequest::Get => {
                debug!(service = %principal, "credential request");
                let doc = self
                    .source
                    .credentials()
                    .await
                    .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;
                Ok(encode_payload(&doc)?)
            }
        }
    }
}

/// CLI route: component queries, lifecycle commands, deployments, and
/// package imports.
pub struct CliHandler<C: Clock> {
    supervisor: crate::supervisor::Supervisor<C>,
    engine: DeploymentEngine,
    store: Arc<ConfigStore>,
    cache: Arc<RecipeCache>,
    paths: EmberPaths,
    clock: C,
}

impl<C: Clock + 'static> CliHandler<C> {
    pub fn new(
        supervisor: crate::supervisor::Supervisor<C>,
        engine: DeploymentEngine,
        store: Arc<ConfigStore>,
        cache: Arc<RecipeCache>,
        paths: EmberPaths,
        clock: C,
    ) -> Self {
        Self { supervisor, engine, store, cache, paths, clock }
    }

    fn component_info(view: &crate::supervisor::ServiceView) -> ComponentInfo {
        ComponentInfo {
            name: view.name.clone(),
            version: Some(view.version.clone()),
            state: view.state,
            dependencies: view.dependencies.clone(),
            last_error: view.last_error.clone(),
        }
    }

    fn load_record(&self, id: &str) -> Option<DeploymentRecord> {
        let path = crate::env::deployment_path(id).child("record");
        let text = self.store.get_value(&path)?;
        serde_json::from_str(text.as_str()?).ok()
    }
}

#[async_trait]
impl<C: Clock + 'static> Handler for CliHandler<C> {
    async fn handle(
        &self,
        _principal: &Principal,
        payload: &[u8],
        _conn: &ConnHandle,
    ) -> Result<Vec<u8>, HandlerError> {
        let request: CliRequest = decode_payload(payload)?;
        let response = match request {
            CliRequest::ListComponents => {
                let infos: Vec<ComponentInfo> =
                    self.supervisor.list_views().iter().map(Self::component_info).collect();
                CliResponse::Components(infos)
            }
            CliRequest::GetComponent { name } => match self.supervisor.service_view(&name) {
                Some(view) => CliResponse::Component(Self::component_info(&view)),
                None => {
                    return Err(HandlerError::new(
                        ErrorKind::NotFound,
                        format!("component {name} not found"),
                    ))
                }
            },
            CliRequest::RestartComponent { name } => {
                if self.supervisor.service_view(&name).is_none() {
                    return Err(HandlerError::new(
                        ErrorKind::NotFound,
                        format!("component {name} not found"),
                    ));
                }
                let _ = self.supervisor.stop(&name).await;
                match self.supervisor.start(&name).await {
                    Ok(Ok(())) => CliResponse::Ok,
                    Ok(Err(message)) => {
                        return Err(HandlerError::new(ErrorKind::BrokenExhausted, message))
                    }
                    Err(_) => {
                        return Err(HandlerError::new(ErrorKind::Internal, "supervisor gone"))
                    }
                }
            }
            CliRequest::StopComponent { name } => {
                if self.supervisor.service_view(&name).is_none() {
                    return Err(HandlerError::new(
                        ErrorKind::NotFound,
                        format!("component {name} not found"),
                    ));
                }
                let _ = self.supervisor.stop(&name).await;
                CliResponse::Ok
            }
            CliRequest::CreateLocalDeployment { doc } => {
                let record = DeploymentRecord::new(
                    ember_core::deployment_id(),
                    ember_core::DeploymentSource::Local,
                    doc,
                    self.clock.epoch_ms(),
                );
                let id = record.id.clone();
                self.engine
                    .submit(record)
                    .await
                    .map_err(|message| HandlerError::new(ErrorKind::Internal, message))?;
                CliResponse::DeploymentQueued { id }
            }
            CliRequest::GetDeploymentStatus { id } => match self.load_record(&id) {
                Some(record) => CliResponse::Deployment(record),
                None => {
                    return Err(HandlerError::new(
                        ErrorKind::NotFound,
                        format!("deployment {id} not found"),
                    ))
                }
            },
            CliRequest::ListLocalDeployments => {
                let mut records = Vec::new();
                if let Some(info) = self.store.lookup(&crate::env::deployments_root()) {
                    for id in info.children {
                        if let Some(record) = self.load_record(&id) {
                            records.push(record);
                        }
                    }
                }
                records.sort_by_key(|r| r.requested_at_ms);
                CliResponse::Deployments(records)
            }
            CliRequest::UpdateRecipesAndArtifacts { recipes_dir, artifacts_dir } => {
                let imported = self
                    .cache
                    .import_dir(&recipes_dir)
                    .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;
                if let Some(artifacts) = artifacts_dir {
                    copy_tree(&artifacts, &self.paths.artifacts_root())
                        .map_err(|e| HandlerError::new(ErrorKind::IoError, e.to_string()))?;
                }
                CliResponse::Imported {
                    recipes: imported
                        .into_iter()
                        .map(|(name, version)| format!("{name}-{version}"))
                        .collect(),
                }
            }
        };
        Ok(encode_payload(&response)?)
    }
}

/// Recursively copy `src` into `dst`.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "handlers_tests.rs"]
mod tests;
