// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The process-wide dependency context.
//!
//! A registry mapping a capability key to exactly one live instance.
//! Instances are constructed lazily on first `get`, with their own
//! dependencies resolved through the same registry. Construction
//! cycles are an error, not a feature; teardown hooks run in reverse
//! order of first construction.
//!
//! The context is the only component that creates singleton lifetimes;
//! per-request and per-service objects are created by their owners.

use ember_core::ErrorKind;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Context) -> Instance + Send + Sync>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// Context errors.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("dependency cycle: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("'{key}' is already bound")]
    AlreadyBound { key: String },

    #[error("no factory registered for '{key}'")]
    NotRegistered { key: String },

    #[error("'{key}' resolved to a different type")]
    WrongType { key: String },
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            ContextError::AlreadyBound { .. } => ErrorKind::AlreadyBound,
            ContextError::NotRegistered { .. } | ContextError::WrongType { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    factories: HashMap<String, Factory>,
    instances: HashMap<String, Instance>,
    /// Keys in first-construction order.
    order: Vec<String>,
    /// Keys currently being constructed (cycle detection).
    resolving: Vec<String>,
    close_hooks: Vec<(String, CloseHook)>,
}

/// Capability-keyed singleton registry.
#[derive(Default)]
pub struct Context {
    inner: Mutex<Inner>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `key`. Fails with `ALREADY_BOUND` once the
    /// key has been resolved or bound.
    pub fn register<T, F>(&self, key: &str, factory: F) -> Result<(), ContextError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Context) -> Arc<T> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.instances.contains_key(key) {
            return Err(ContextError::AlreadyBound { key: key.to_string() });
        }
        inner
            .factories
            .insert(key.to_string(), Arc::new(move |ctx| factory(ctx) as Instance));
        Ok(())
    }

    /// Bind an existing instance. Allowed only before any consumer has
    /// resolved the key.
    pub fn put<T>(&self, key: &str, instance: Arc<T>) -> Result<(), ContextError>
    where
        T: Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.instances.contains_key(key) {
            return Err(ContextError::AlreadyBound { key: key.to_string() });
        }
        inner.instances.insert(key.to_string(), instance as Instance);
        let key = key.to_string();
        inner.order.push(key);
        Ok(())
    }

    /// Resolve `key`, constructing it (and anything it asks for) on
    /// first use.
    pub fn get<T>(&self, key: &str) -> Result<Arc<T>, ContextError>
    where
        T: Send + Sync + 'static,
    {
        let factory = {
            let mut inner = self.inner.lock();
            if let Some(instance) = inner.instances.get(key) {
                return downcast::<T>(key, Arc::clone(instance));
            }
            if inner.resolving.iter().any(|k| k == key) {
                let mut chain = inner.resolving.clone();
                chain.push(key.to_string());
                return Err(ContextError::DependencyCycle { chain });
            }
            let Some(factory) = inner.factories.get(key) else {
                return Err(ContextError::NotRegistered { key: key.to_string() });
            };
            let factory = Arc::clone(factory);
            inner.resolving.push(key.to_string());
            factory
        };

        // The lock is released while the factory runs so it can resolve
        // its own dependencies through `get`.
        let instance = factory(self);

        let mut inner = self.inner.lock();
        inner.resolving.retain(|k| k != key);
        let stored = match inner.instances.get(key) {
            // A concurrent resolver won the race; keep its instance.
            Some(existing) => Arc::clone(existing),
            None => {
                inner.instances.insert(key.to_string(), Arc::clone(&instance));
                inner.order.push(key.to_string());
                instance
            }
        };
        downcast::<T>(key, stored)
    }

    /// Register a hook to run at shutdown. Hooks run in reverse order of
    /// their owner's first construction.
    pub fn on_close(&self, key: &str, hook: impl FnOnce() + Send + 'static) {
        self.inner.lock().close_hooks.push((key.to_string(), Box::new(hook)));
    }

    /// Keys in first-construction order (diagnostics and tests).
    pub fn construction_order(&self) -> Vec<String> {
        self.inner.lock().order.clone()
    }

    /// Run close hooks in reverse construction order and drop all
    /// instances.
    pub fn shutdown(&self) {
        let (order, hooks) = {
            let mut inner = self.inner.lock();
            let order = std::mem::take(&mut inner.order);
            let hooks = std::mem::take(&mut inner.close_hooks);
            inner.instances.clear();
            inner.factories.clear();
            (order, hooks)
        };
        let mut hooks: HashMap<String, Vec<CloseHook>> =
            hooks.into_iter().fold(HashMap::new(), |mut map, (key, hook)| {
                map.entry(key).or_default().push(hook);
                map
            });
        for key in order.iter().rev() {
            if let Some(list) = hooks.remove(key) {
                for hook in list {
                    hook();
                }
            }
        }
        // Hooks for keys that never constructed still run, last.
        for (_, list) in hooks {
            for hook in list {
                hook();
            }
        }
    }
}

fn downcast<T: Send + Sync + 'static>(
    key: &str,
    instance: Instance,
) -> Result<Arc<T>, ContextError> {
    instance
        .downcast::<T>()
        .map_err(|_| ContextError::WrongType { key: key.to_string() })
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
