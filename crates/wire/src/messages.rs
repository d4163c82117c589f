// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CBOR application messages carried in frame payloads.
//!
//! The router treats payloads as opaque bytes; these types are the
//! contract between the daemon's handlers and its clients (services
//! and the CLI).

use ember_core::{DependencyKind, DeploymentDoc, DeploymentRecord, ErrorKind, ServiceState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Payload (de)serialization failure.
#[derive(Debug, Error)]
#[error("payload: {0}")]
pub struct PayloadError(#[from] serde_cbor::Error);

pub fn encode_payload<T: Serialize>(message: &T) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_cbor::to_vec(message)?)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    Ok(serde_cbor::from_slice(bytes)?)
}

/// First frame on every connection: bearer token for the AUTH route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// Successful auth reply: the principal the connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAck {
    pub principal: String,
}

/// Error payload used across all routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// LIFECYCLE route requests (sent by services).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleRequest {
    /// Self-report a lifecycle state. A RUNNING report moves a
    /// STARTING service to RUNNING (and makes it stable); an ERRORED
    /// report triggers the restart policy. Other states are
    /// informational.
    ReportState { state: ServiceState },
    /// Receive component-update and validation events on this connection.
    SubscribeComponentUpdates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleResponse {
    Ok,
}

/// Verdict in a configuration validation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidityStatus {
    Accept,
    Reject,
}

/// CONFIG_STORE route requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigRequest {
    /// Read a subtree of the caller's own configuration.
    Get { path: String },
    /// Write a leaf in the caller's own configuration.
    Update { path: String, value: serde_json::Value },
    /// Subscribe to updates under a path of the caller's configuration.
    SubscribeUpdates { path: String },
    /// Reply to a validation prompt for a pending deployment.
    ValidityReport {
        deployment_id: String,
        status: ValidityStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigResponse {
    Ok,
    Value {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// EVENT payloads pushed on the CONFIG_STORE route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigEvent {
    /// A watched path changed; `value` is `None` for removals.
    Updated {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    /// Validate a pending deployment's effective configuration.
    ValidateRequest {
        deployment_id: String,
        configuration: serde_json::Value,
        timeout_ms: u64,
    },
}

/// CLI route requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliRequest {
    ListComponents,
    GetComponent { name: String },
    RestartComponent { name: String },
    StopComponent { name: String },
    CreateLocalDeployment { doc: DeploymentDoc },
    GetDeploymentStatus { id: String },
    ListLocalDeployments,
    UpdateRecipesAndArtifacts {
        recipes_dir: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifacts_dir: Option<PathBuf>,
    },
}

/// Component state as reported to the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<(String, DependencyKind)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliResponse {
    Ok,
    Component(ComponentInfo),
    Components(Vec<ComponentInfo>),
    DeploymentQueued { id: String },
    Deployment(DeploymentRecord),
    Deployments(Vec<DeploymentRecord>),
    Imported { recipes: Vec<String> },
    Error(ErrorBody),
}

/// CREDENTIALS route request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialsRequest {
    Get,
}

/// Credential material document, field names per the credential-proxy
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDoc {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "Expiration")]
    pub expiration: String,
}

#[cfg(test)]
#[path = "messages_tests.rs"]
mod tests;
