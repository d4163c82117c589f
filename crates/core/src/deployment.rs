// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deployment documents and persisted deployment records.
//!
//! The document is the external JSON contract (`components` +
//! `policies`); the record is what the engine persists for
//! `list-local-deployments`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Where a deployment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentSource {
    Cloud,
    Local,
}

crate::simple_display! {
    DeploymentSource {
        Cloud => "cloud",
        Local => "local",
    }
}

/// Whether affected services are asked to validate the new configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentUpdateAction {
    NotifyComponents,
    SkipNotifyComponents,
}

impl Default for ComponentUpdateAction {
    fn default() -> Self {
        ComponentUpdateAction::NotifyComponents
    }
}

/// What happens when a deployment fails after activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureHandling {
    DoNothing,
    Rollback,
}

impl Default for FailureHandling {
    fn default() -> Self {
        FailureHandling::Rollback
    }
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    RolledBack,
    Canceled,
}

crate::simple_display! {
    DeploymentStatus {
        Queued => "QUEUED",
        InProgress => "IN_PROGRESS",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        RolledBack => "ROLLED_BACK",
        Canceled => "CANCELED",
    }
}

impl DeploymentStatus {
    /// True once the deployment can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeploymentStatus::Queued | DeploymentStatus::InProgress)
    }
}

/// Configuration update for one component: RESET pointers applied
/// first, MERGE overlay second. No other operation may appear.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    #[serde(rename = "MERGE", default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<serde_json::Value>,
    #[serde(rename = "RESET", default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<Vec<String>>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.merge.is_none() && self.reset.as_ref().is_none_or(|r| r.is_empty())
    }
}

/// One component entry in a deployment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentTarget {
    /// Semver requirement string, resolved against the recipe cache.
    pub version: String,
    #[serde(
        rename = "configurationUpdate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub configuration_update: Option<ConfigUpdate>,
}

/// Deployment policies block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPolicies {
    #[serde(rename = "componentUpdate", default)]
    pub component_update: ComponentUpdateAction,
    #[serde(rename = "failureHandling", default)]
    pub failure_handling: FailureHandling,
    #[serde(rename = "validationTimeoutSeconds", default = "default_validation_timeout")]
    pub validation_timeout_seconds: u64,
}

fn default_validation_timeout() -> u64 {
    120
}

impl Default for DeploymentPolicies {
    fn default() -> Self {
        Self {
            component_update: ComponentUpdateAction::default(),
            failure_handling: FailureHandling::default(),
            validation_timeout_seconds: default_validation_timeout(),
        }
    }
}

/// The desired-state document a deployment applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDoc {
    pub components: IndexMap<String, ComponentTarget>,
    #[serde(default)]
    pub policies: DeploymentPolicies,
}

/// Persisted record of a deployment, immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub source: DeploymentSource,
    pub doc: DeploymentDoc,
    pub status: DeploymentStatus,
    /// Last phase reached (1..=7), used for crash resume.
    pub phase: u8,
    pub requested_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    /// Stable error code when status is FAILED or ROLLED_BACK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<crate::ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeploymentRecord {
    pub fn new(id: String, source: DeploymentSource, doc: DeploymentDoc, now_ms: u64) -> Self {
        Self {
            id,
            source,
            doc,
            status: DeploymentStatus::Queued,
            phase: 0,
            requested_at_ms: now_ms,
            completed_at_ms: None,
            error_kind: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
#[path = "deployment_tests.rs"]
mod tests;
