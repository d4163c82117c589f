// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Recipe schema and parsing.

use ember_core::DependencyKind;
use indexmap::IndexMap;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Recipe errors.
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("invalid recipe: {0}")]
    Parse(String),

    #[error("recipe for {name} declares both 'startup' and 'run'")]
    ConflictingLifecycle { name: String },

    #[error("recipe file {file} declares {declared}, expected {expected}")]
    FilenameMismatch { file: String, declared: String, expected: String },

    #[error("recipe I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl RecipeError {
    pub fn kind(&self) -> ember_core::ErrorKind {
        match self {
            RecipeError::Io(_) => ember_core::ErrorKind::IoError,
            _ => ember_core::ErrorKind::MalformedConfig,
        }
    }
}

/// The static declaration of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(rename = "RecipeFormatVersion")]
    pub format_version: String,

    #[serde(rename = "ComponentName")]
    pub name: String,

    #[serde(rename = "ComponentVersion")]
    pub version: Version,

    #[serde(rename = "ComponentDescription", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "ComponentPublisher", default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    #[serde(rename = "ComponentConfiguration", default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ComponentConfiguration>,

    #[serde(rename = "ComponentDependencies", default, skip_serializing_if = "IndexMap::is_empty")]
    pub dependencies: IndexMap<String, DependencySpec>,

    #[serde(rename = "Manifests", default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<Manifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfiguration {
    #[serde(rename = "DefaultConfiguration", default)]
    pub default_configuration: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    #[serde(rename = "VersionRequirement")]
    pub version_requirement: VersionReq,

    #[serde(rename = "DependencyType", default)]
    pub dependency_type: DependencyKind,
}

/// One per-platform manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "Platform", default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    #[serde(rename = "Lifecycle", default)]
    pub lifecycle: Lifecycle,

    #[serde(rename = "Artifacts", default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

impl Platform {
    /// `None` and `"all"` match anything.
    pub fn matches(&self, os: &str, architecture: &str) -> bool {
        let os_ok = self.os.as_deref().is_none_or(|v| v == "all" || v == os);
        let arch_ok = self
            .architecture
            .as_deref()
            .is_none_or(|v| v == "all" || v == architecture);
        os_ok && arch_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "Uri")]
    pub uri: String,

    #[serde(rename = "Unarchive", default, skip_serializing_if = "Option::is_none")]
    pub unarchive: Option<String>,
}

/// Lifecycle block: each step is a bare command string or a detailed
/// table. `startup` and `run` are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recover: Option<Step>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub setenv: IndexMap<String, String>,
}

/// A lifecycle step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Command(String),
    Detailed(StepDetail),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetail {
    #[serde(rename = "Script")]
    pub script: String,

    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(rename = "Setenv", default, skip_serializing_if = "IndexMap::is_empty")]
    pub setenv: IndexMap<String, String>,

    #[serde(rename = "Skipif", default, skip_serializing_if = "Option::is_none")]
    pub skipif: Option<Skipif>,
}

impl Step {
    pub fn script(&self) -> &str {
        match self {
            Step::Command(command) => command,
            Step::Detailed(detail) => &detail.script,
        }
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        match self {
            Step::Command(_) => None,
            Step::Detailed(detail) => detail.timeout_seconds,
        }
    }

    pub fn setenv(&self) -> Option<&IndexMap<String, String>> {
        match self {
            Step::Command(_) => None,
            Step::Detailed(detail) => Some(&detail.setenv),
        }
    }

    pub fn skipif(&self) -> Option<&Skipif> {
        match self {
            Step::Command(_) => None,
            Step::Detailed(detail) => detail.skipif.as_ref(),
        }
    }
}

/// Skip condition: `onpath <executable>` or `exists <path>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Skipif {
    OnPath(String),
    Exists(PathBuf),
}

impl TryFrom<String> for Skipif {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        let trimmed = text.trim();
        if let Some(exe) = trimmed.strip_prefix("onpath ") {
            let exe = exe.trim();
            if exe.is_empty() {
                return Err("onpath requires an executable name".to_string());
            }
            return Ok(Skipif::OnPath(exe.to_string()));
        }
        if let Some(path) = trimmed.strip_prefix("exists ") {
            let path = path.trim();
            if path.is_empty() {
                return Err("exists requires a path".to_string());
            }
            return Ok(Skipif::Exists(PathBuf::from(path)));
        }
        Err(format!("unknown Skipif form: '{trimmed}'"))
    }
}

impl From<Skipif> for String {
    fn from(skipif: Skipif) -> String {
        match skipif {
            Skipif::OnPath(exe) => format!("onpath {exe}"),
            Skipif::Exists(path) => format!("exists {}", path.display()),
        }
    }
}

impl Recipe {
    /// First manifest matching the given platform.
    pub fn manifest_for(&self, os: &str, architecture: &str) -> Option<&Manifest> {
        self.manifests
            .iter()
            .find(|m| m.platform.as_ref().is_none_or(|p| p.matches(os, architecture)))
    }

    /// Default configuration subtree, `null` when undeclared.
    pub fn default_configuration(&self) -> serde_json::Value {
        self.configuration
            .as_ref()
            .map(|c| c.default_configuration.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    fn validate(&self) -> Result<(), RecipeError> {
        if self.name.is_empty() {
            return Err(RecipeError::Parse("ComponentName must not be empty".to_string()));
        }
        if self.format_version.is_empty() {
            return Err(RecipeError::Parse("RecipeFormatVersion must not be empty".to_string()));
        }
        for manifest in &self.manifests {
            if manifest.lifecycle.startup.is_some() && manifest.lifecycle.run.is_some() {
                return Err(RecipeError::ConflictingLifecycle { name: self.name.clone() });
            }
        }
        Ok(())
    }
}

/// Parse and validate a recipe from YAML text.
pub fn parse_recipe(text: &str) -> Result<Recipe, RecipeError> {
    let recipe: Recipe =
        serde_yaml::from_str(text).map_err(|e| RecipeError::Parse(e.to_string()))?;
    recipe.validate()?;
    Ok(recipe)
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod tests;
