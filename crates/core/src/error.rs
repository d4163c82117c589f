// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stable error-kind codes shared across the runtime.
//!
//! Every user-visible error carries one of these codes next to its
//! human-readable message. The codes are part of the IPC and CLI
//! contract and never change meaning. Messages never include tokens or
//! key material.

use serde::{Deserialize, Serialize};

/// Stable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Invalid YAML/JSON or schema violation; no state change.
    MalformedConfig,
    /// Cycle in recipe dependencies; deployment fails.
    CircularDependency,
    /// Version constraints conflict; deployment fails.
    Unsatisfiable,
    /// A service rejected proposed configuration; deployment rolls back.
    ValidationRejected,
    /// Lifecycle script exited non-zero; service goes ERRORED.
    ScriptFailure,
    /// Restart budget spent; service goes BROKEN.
    BrokenExhausted,
    /// Bad IPC token; connection closed.
    AuthFailed,
    /// Principal not allowed; connection stays open.
    AuthzDenied,
    /// Construction cycle in the dependency context.
    DependencyCycle,
    /// A context key was bound after first resolution.
    AlreadyBound,
    /// Requested component or deployment does not exist.
    NotFound,
    /// Transient disk/network failure.
    IoError,
    /// Deadline exceeded.
    Timeout,
    /// Anything the other kinds do not cover.
    Internal,
}

crate::simple_display! {
    ErrorKind {
        MalformedConfig => "MALFORMED_CONFIG",
        CircularDependency => "CIRCULAR_DEPENDENCY",
        Unsatisfiable => "UNSATISFIABLE",
        ValidationRejected => "VALIDATION_REJECTED",
        ScriptFailure => "SCRIPT_FAILURE",
        BrokenExhausted => "BROKEN_EXHAUSTED",
        AuthFailed => "AUTH_FAILED",
        AuthzDenied => "AUTHZ_DENIED",
        DependencyCycle => "DEPENDENCY_CYCLE",
        AlreadyBound => "ALREADY_BOUND",
        NotFound => "NOT_FOUND",
        IoError => "IO_ERROR",
        Timeout => "TIMEOUT",
        Internal => "INTERNAL",
    }
}

impl ErrorKind {
    /// Parse the stable code back into a kind (for wire round-trips).
    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "MALFORMED_CONFIG" => Self::MalformedConfig,
            "CIRCULAR_DEPENDENCY" => Self::CircularDependency,
            "UNSATISFIABLE" => Self::Unsatisfiable,
            "VALIDATION_REJECTED" => Self::ValidationRejected,
            "SCRIPT_FAILURE" => Self::ScriptFailure,
            "BROKEN_EXHAUSTED" => Self::BrokenExhausted,
            "AUTH_FAILED" => Self::AuthFailed,
            "AUTHZ_DENIED" => Self::AuthzDenied,
            "DEPENDENCY_CYCLE" => Self::DependencyCycle,
            "ALREADY_BOUND" => Self::AlreadyBound,
            "NOT_FOUND" => Self::NotFound,
            "IO_ERROR" => Self::IoError,
            "TIMEOUT" => Self::Timeout,
            "INTERNAL" => Self::Internal,
            _ => return None,
        })
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
