// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Custom error type that carries a process exit code.
//!
//! Commands return `ExitError` instead of calling `std::process::exit()`
//! directly, allowing `main()` to handle process termination.
//!
//! Exit codes: 0 success, 1 usage error, 2 not found, 3 authorization
//! error, 4 deployment failed, 5 internal error.

use ember_core::ErrorKind;
use ember_wire::ErrorBody;
use std::fmt;

pub const EXIT_USAGE: i32 = 1;
pub const EXIT_NOT_FOUND: i32 = 2;
pub const EXIT_AUTH: i32 = 3;
pub const EXIT_DEPLOYMENT: i32 = 4;
pub const EXIT_INTERNAL: i32 = 5;

#[derive(Debug)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

impl ExitError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(EXIT_USAGE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(EXIT_INTERNAL, message)
    }
}

/// Map a daemon error body onto the documented exit codes.
pub fn exit_code_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::NotFound => EXIT_NOT_FOUND,
        ErrorKind::AuthFailed | ErrorKind::AuthzDenied => EXIT_AUTH,
        ErrorKind::CircularDependency
        | ErrorKind::Unsatisfiable
        | ErrorKind::ValidationRejected
        | ErrorKind::ScriptFailure
        | ErrorKind::BrokenExhausted => EXIT_DEPLOYMENT,
        ErrorKind::MalformedConfig => EXIT_USAGE,
        ErrorKind::DependencyCycle
        | ErrorKind::AlreadyBound
        | ErrorKind::IoError
        | ErrorKind::Timeout
        | ErrorKind::Internal => EXIT_INTERNAL,
    }
}

impl From<ErrorBody> for ExitError {
    fn from(body: ErrorBody) -> Self {
        ExitError::new(exit_code_for(body.kind), format!("{}: {}", body.kind, body.message))
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExitError {}

#[cfg(test)]
#[path = "exit_error_tests.rs"]
mod tests;
