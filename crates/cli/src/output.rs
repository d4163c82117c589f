// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plain-text rendering for CLI responses.

use crate::exit_error::ExitError;
use ember_core::DeploymentRecord;
use ember_wire::ComponentInfo;

/// One line per component: name, version, state, optional error.
pub fn component_line(info: &ComponentInfo) -> String {
    let mut line = format!(
        "{:<24} {:<12} {}",
        info.name,
        info.version.as_deref().unwrap_or("-"),
        info.state,
    );
    if !info.dependencies.is_empty() {
        let deps: Vec<String> = info
            .dependencies
            .iter()
            .map(|(name, kind)| format!("{name}({kind})"))
            .collect();
        line.push_str(&format!("  deps: {}", deps.join(", ")));
    }
    if let Some(error) = &info.last_error {
        line.push_str(&format!("  [{error}]"));
    }
    line
}

/// One line per deployment: id, status, error kind when present.
pub fn deployment_line(record: &DeploymentRecord) -> String {
    let mut line = format!("{:<20} {:<12} {}", record.id, record.status, record.source);
    if let Some(kind) = record.error_kind {
        line.push_str(&format!("  {kind}"));
    }
    line
}

/// Full record as pretty JSON for `get-deployment-status`.
pub fn deployment_json(record: &DeploymentRecord) -> Result<String, ExitError> {
    serde_json::to_string_pretty(record).map_err(|e| ExitError::internal(e.to_string()))
}

#[cfg(test)]
#[path = "output_tests.rs"]
mod tests;
