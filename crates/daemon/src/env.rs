// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk layout and runtime tunables.
//!
//! All paths hang off a root directory chosen at startup (`--root`,
//! `$EMBER_ROOT`, or `~/.ember`).

use ember_config::ConfigPath;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root-relative path layout.
#[derive(Debug, Clone)]
pub struct EmberPaths {
    root: PathBuf,
}

impl EmberPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root from `$EMBER_ROOT` or fall back to `~/.ember`.
    pub fn resolve(explicit: Option<PathBuf>) -> Option<Self> {
        let root = explicit
            .or_else(|| std::env::var_os("EMBER_ROOT").map(PathBuf::from))
            .or_else(|| dirs::home_dir().map(|home| home.join(".ember")))?;
        Some(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Current tree snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.config_dir().join("config.json")
    }

    /// Append-only transaction log.
    pub fn tlog_path(&self) -> PathBuf {
        self.config_dir().join("config.tlog")
    }

    pub fn recipes_dir(&self) -> PathBuf {
        self.root.join("packages").join("recipes")
    }

    pub fn artifacts_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join("packages").join("artifacts").join(name).join(version)
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.root.join("packages").join("artifacts")
    }

    /// Persisted deployment records.
    pub fn deployments_dir(&self) -> PathBuf {
        self.root.join("deployments")
    }

    pub fn deployment_record_path(&self, id: &str) -> PathBuf {
        self.deployments_dir().join(format!("{id}.json"))
    }

    /// Per-service working directory.
    pub fn work_dir(&self, service: &str) -> PathBuf {
        self.root.join("work").join(service)
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.root.join("ipc")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.ipc_dir().join("emberd.sock")
    }

    /// Bootstrap token for CLI clients.
    pub fn cli_token_path(&self) -> PathBuf {
        self.ipc_dir().join("cli.token")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("emberd.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Config-tree locations.
pub fn service_path(name: &str) -> ConfigPath {
    ConfigPath::parse("services").child(name)
}

/// A service's deployable configuration subtree.
pub fn service_config_path(name: &str) -> ConfigPath {
    service_path(name).child("configuration")
}

/// Runtime-owned subtree, excluded from deployment rollback.
pub fn service_runtime_path(name: &str) -> ConfigPath {
    service_path(name).child("runtime")
}

pub fn service_version_path(name: &str) -> ConfigPath {
    service_path(name).child("version")
}

pub fn deployment_path(id: &str) -> ConfigPath {
    ConfigPath::parse("deployments").child(id)
}

pub fn deployments_root() -> ConfigPath {
    ConfigPath::parse("deployments")
}

pub fn services_root() -> ConfigPath {
    ConfigPath::parse("services")
}

/// Per-request IPC read/write deadline.
pub fn ipc_timeout() -> Duration {
    std::env::var("EMBER_IPC_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(10))
}

/// Deadline for the AUTH frame on a fresh connection.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outstanding frames per connection before reads pause.
pub const CONNECTION_FRAME_BOUND: usize = 32;

/// Transaction-log tail buffer before a slow sink is disconnected.
pub const TAIL_BUFFER_RECORDS: usize = 1024;
