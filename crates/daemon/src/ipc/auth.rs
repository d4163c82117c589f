// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC authentication and authorization.
//!
//! Tokens are opaque strings. Per-service tokens are issued at service
//! registration and stored under the service's runtime subtree; the
//! bootstrap token is written to a local file for CLI clients and
//! rotated on every daemon start.

use ember_config::{ConfigStore, ConfigValue};
use ember_core::Clock;
use ember_wire::Destination;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// The identity bound to an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    Cli,
    Service(String),
}

impl Principal {
    pub fn name(&self) -> &str {
        match self {
            Principal::Cli => "cli",
            Principal::Service(name) => name,
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const TOKEN_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

fn new_token() -> String {
    nanoid::nanoid!(32, &TOKEN_ALPHABET)
}

/// Maps bearer tokens to principals.
pub struct TokenRegistry<C: Clock> {
    store: Arc<ConfigStore>,
    clock: C,
    bootstrap: Mutex<Option<String>>,
}

impl<C: Clock> TokenRegistry<C> {
    pub fn new(store: Arc<ConfigStore>, clock: C) -> Self {
        Self { store, clock, bootstrap: Mutex::new(None) }
    }

    /// Ensure a token exists for `service` and return it. The token
    /// lives at the well-known path `services/<name>/runtime/token` and
    /// is exported to the service process as `SVCUID`.
    pub fn issue_service_token(&self, service: &str) -> Result<String, ember_config::ConfigError> {
        let path = crate::env::service_runtime_path(service).child("token");
        let value = self.store.find_or_create(
            &path,
            ConfigValue::from(new_token()),
            self.clock.epoch_ms(),
        )?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Write a fresh bootstrap token for CLI clients (mode 0600).
    pub fn write_bootstrap_token(&self, path: &Path) -> std::io::Result<String> {
        let token = new_token();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &token)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        *self.bootstrap.lock() = Some(token.clone());
        Ok(token)
    }

    /// Resolve a presented token to its principal.
    pub fn authenticate(&self, token: &str) -> Option<Principal> {
        if token.is_empty() {
            return None;
        }
        if self.bootstrap.lock().as_deref() == Some(token) {
            return Some(Principal::Cli);
        }
        // Service tokens live in the config tree.
        let services = self.store.lookup(&crate::env::services_root())?;
        for service in services.children {
            let path = crate::env::service_runtime_path(&service).child("token");
            if let Some(ConfigValue::String(stored)) = self.store.get_value(&path) {
                if stored == token {
                    return Some(Principal::Service(service));
                }
            }
        }
        None
    }
}

/// Static per-principal route policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthzPolicy;

impl AuthzPolicy {
    /// May `principal` invoke `destination`? The resource argument is
    /// the request's target (service name, path) where routes carry
    /// one; the built-in policy only distinguishes routes.
    pub fn allowed(&self, principal: &Principal, destination: Destination, _resource: &str) -> bool {
        match (principal, destination) {
            (_, Destination::Auth) => true,
            (Principal::Cli, Destination::Cli) => true,
            (Principal::Service(_), Destination::Lifecycle)
            | (Principal::Service(_), Destination::ConfigStore)
            | (Principal::Service(_), Destination::Credentials) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
