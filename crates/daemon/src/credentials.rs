// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential material for the CREDENTIALS route.
//!
//! The loopback HTTP credential proxy is an external collaborator; the
//! daemon only owns the source it would serve from. The file-backed
//! source reads a credential document provisioned by an external tool.

use async_trait::async_trait;
use ember_core::ErrorKind;
use ember_wire::CredentialDoc;
use std::path::PathBuf;
use thiserror::Error;

/// Credential lookup failure.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials provisioned")]
    NotProvisioned,

    #[error("credential document is invalid: {0}")]
    Invalid(String),

    #[error("credential I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl CredentialError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CredentialError::NotProvisioned => ErrorKind::NotFound,
            CredentialError::Invalid(_) => ErrorKind::MalformedConfig,
            CredentialError::Io(_) => ErrorKind::IoError,
        }
    }
}

/// Where credential documents come from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> Result<CredentialDoc, CredentialError>;
}

/// Reads a JSON credential document from disk on every request, so an
/// external refresher can rotate it in place.
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for FileCredentialSource {
    async fn credentials(&self) -> Result<CredentialDoc, CredentialError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::NotProvisioned)
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| CredentialError::Invalid(e.to_string()))
    }
}

/// Fixed document, for tests.
#[cfg(any(test, feature = "test-support"))]
pub struct StaticCredentialSource(pub CredentialDoc);

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn credentials(&self) -> Result<CredentialDoc, CredentialError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;
