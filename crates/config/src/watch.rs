// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriptions on config tree paths.
//!
//! Subscribers attach to a path, not a node: they survive leaf↔container
//! transitions and removal/re-creation at the same location. Callbacks
//! run on a dedicated notifier thread after the owning write commits;
//! a callback that panics is logged and dropped without disturbing the
//! other subscribers for the same event.

use crate::path::ConfigPath;
use crate::value::ConfigValue;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::warn;

/// Kind of change a subscriber is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    ValueChanged,
    ChildAdded,
    ChildRemoved,
    /// Fired once, synchronously, when the subscription is attached.
    Initialized,
}

/// A change delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The value at `path` changed; `None` means the leaf was removed
    /// or replaced by a container.
    ValueChanged {
        path: ConfigPath,
        value: Option<ConfigValue>,
    },
    /// `child` appeared under the container at `path`.
    ChildAdded { path: ConfigPath, child: String },
    /// `child` was removed from the container at `path`.
    ChildRemoved { path: ConfigPath, child: String },
    /// Current value at attach time (`None` for containers and absent
    /// nodes).
    Initialized {
        path: ConfigPath,
        value: Option<ConfigValue>,
    },
}

impl WatchEvent {
    pub fn path(&self) -> &ConfigPath {
        match self {
            WatchEvent::ValueChanged { path, .. }
            | WatchEvent::ChildAdded { path, .. }
            | WatchEvent::ChildRemoved { path, .. }
            | WatchEvent::Initialized { path, .. } => path,
        }
    }

    pub fn kind(&self) -> WatchKind {
        match self {
            WatchEvent::ValueChanged { .. } => WatchKind::ValueChanged,
            WatchEvent::ChildAdded { .. } => WatchKind::ChildAdded,
            WatchEvent::ChildRemoved { .. } => WatchKind::ChildRemoved,
            WatchEvent::Initialized { .. } => WatchKind::Initialized,
        }
    }
}

pub(crate) type WatchHandler = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) kind: WatchKind,
}

pub(crate) struct Subscriber {
    pub id: u64,
    pub kind: WatchKind,
    pub handler: WatchHandler,
}

/// Path-keyed subscriber registry.
#[derive(Default)]
pub(crate) struct Subscriptions {
    next_id: u64,
    by_path: HashMap<ConfigPath, Vec<Subscriber>>,
}

impl Subscriptions {
    pub fn add(&mut self, path: ConfigPath, kind: WatchKind, handler: WatchHandler) -> SubscriptionHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.by_path
            .entry(path)
            .or_default()
            .push(Subscriber { id, kind, handler });
        SubscriptionHandle { id, kind }
    }

    pub fn remove(&mut self, handle: SubscriptionHandle) {
        self.by_path.retain(|_, subs| {
            subs.retain(|s| s.id != handle.id);
            !subs.is_empty()
        });
    }

    /// Handlers at `path` matching the event's kind.
    pub fn matching(&self, path: &ConfigPath, kind: WatchKind) -> Vec<WatchHandler> {
        self.by_path
            .get(path)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.kind == kind)
                    .map(|s| Arc::clone(&s.handler))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Dedicated notification executor.
///
/// Callbacks must not block store writers, so events are posted to this
/// thread and invoked there.
pub(crate) struct Notifier {
    tx: Option<mpsc::Sender<(WatchHandler, WatchEvent)>>,
    worker: Option<JoinHandle<()>>,
}

impl Notifier {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<(WatchHandler, WatchEvent)>();
        let worker = std::thread::Builder::new()
            .name("config-notify".to_string())
            .spawn(move || {
                while let Ok((handler, event)) = rx.recv() {
                    let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
                    if result.is_err() {
                        warn!(path = %event.path(), kind = ?event.kind(), "config subscriber panicked; dropped");
                    }
                }
            })
            .ok();
        Self { tx: Some(tx), worker }
    }

    pub fn post(&self, handler: WatchHandler, event: WatchEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send((handler, event));
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // Close the channel so the worker drains and exits.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
#[path = "watch_tests.rs"]
mod tests;
