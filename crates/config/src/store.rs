// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The hierarchical, timestamped configuration store.
//!
//! A single readers/writer lock guards the tree root. Every mutation —
//! single writes and batches alike — goes through one commit path:
//! stage on a copy, validate, swap, append to the transaction log,
//! then dispatch subscriber events on the notifier thread. Subscribers
//! never observe partial batch state.
//!
//! Writes are last-writer-wins by caller-supplied wall-clock timestamp,
//! not by arrival order, so replicated mirrors converge.

use crate::path::ConfigPath;
use crate::tlog::{Tlog, TlogOp, TlogRecord};
use crate::value::ConfigValue;
use crate::watch::{Notifier, SubscriptionHandle, Subscriptions, WatchEvent, WatchHandler, WatchKind};
use ember_core::ErrorKind;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A node is either a scalar leaf or an insertion-ordered container,
/// never both. Switching type destroys the old node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeBody {
    Leaf(ConfigValue),
    Container(IndexMap<String, Node>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
    /// Milliseconds since epoch; non-decreasing along the node's history.
    pub timestamp: u64,
    pub body: NodeBody,
}

impl Node {
    pub fn container(timestamp: u64) -> Self {
        Node { timestamp, body: NodeBody::Container(IndexMap::new()) }
    }

    pub fn leaf(value: ConfigValue, timestamp: u64) -> Self {
        Node { timestamp, body: NodeBody::Leaf(value) }
    }

    pub fn get(&self, segments: &[String]) -> Option<&Node> {
        let mut node = self;
        for segment in segments {
            match &node.body {
                NodeBody::Container(children) => node = children.get(segment)?,
                NodeBody::Leaf(_) => return None,
            }
        }
        Some(node)
    }

    /// Render the subtree as plain JSON (no timestamps).
    pub fn to_json(&self) -> serde_json::Value {
        match &self.body {
            NodeBody::Leaf(value) => value.to_json(),
            NodeBody::Container(children) => {
                let mut map = serde_json::Map::new();
                for (name, child) in children {
                    map.insert(name.clone(), child.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

/// One mutation in a batch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum WriteOp {
    SetLeaf(ConfigValue),
    SetContainer,
    Remove,
}

/// A staged `(path, op, timestamp)` batch entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub path: ConfigPath,
    pub op: WriteOp,
    pub timestamp: u64,
}

/// Snapshot of a single node for queries.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub timestamp: u64,
    /// `Some` for leaves (including explicit null), `None` for containers.
    pub value: Option<ConfigValue>,
    /// Child names, empty for leaves.
    pub children: Vec<String>,
}

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("validator rejected {path}: {reason}")]
    ValidationRejected { path: ConfigPath, reason: String },

    #[error("malformed config: {0}")]
    Malformed(String),

    #[error("transaction log: {0}")]
    Tlog(#[from] crate::tlog::TlogError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::ValidationRejected { .. } => ErrorKind::ValidationRejected,
            ConfigError::Malformed(_) => ErrorKind::MalformedConfig,
            ConfigError::Tlog(_) => ErrorKind::IoError,
        }
    }
}

type Validator = Box<dyn Fn(&ConfigValue) -> Result<ConfigValue, String> + Send + Sync>;

/// The configuration store.
pub struct ConfigStore {
    root: RwLock<Node>,
    subs: Mutex<Subscriptions>,
    validators: Mutex<HashMap<ConfigPath, Validator>>,
    notifier: Notifier,
    log: Mutex<Option<Tlog>>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::container(0)),
            subs: Mutex::new(Subscriptions::default()),
            validators: Mutex::new(HashMap::new()),
            notifier: Notifier::spawn(),
            log: Mutex::new(None),
        }
    }

    /// Attach the transaction log; every committed record is appended
    /// from now on.
    pub fn attach_log(&self, log: Tlog) {
        *self.log.lock() = Some(log);
    }

    /// Register a live tail on the attached log. Records are buffered up
    /// to `capacity`; a sink that falls behind is disconnected rather
    /// than blocking writers.
    pub fn tail(&self, capacity: usize) -> Option<crate::tlog::TailReceiver> {
        self.log.lock().as_mut().map(|log| log.tail(capacity))
    }

    /// Flush the attached log to disk.
    pub fn flush_log(&self) -> Result<(), ConfigError> {
        if let Some(log) = self.log.lock().as_mut() {
            log.flush()?;
        }
        Ok(())
    }

    // -- reads --

    pub fn lookup(&self, path: &ConfigPath) -> Option<NodeInfo> {
        let root = self.root.read();
        let node = root.get(path.segments())?;
        Some(match &node.body {
            NodeBody::Leaf(value) => NodeInfo {
                timestamp: node.timestamp,
                value: Some(value.clone()),
                children: Vec::new(),
            },
            NodeBody::Container(children) => NodeInfo {
                timestamp: node.timestamp,
                value: None,
                children: children.keys().cloned().collect(),
            },
        })
    }

    /// Leaf value at `path`, if present.
    pub fn get_value(&self, path: &ConfigPath) -> Option<ConfigValue> {
        self.lookup(path).and_then(|info| info.value)
    }

    /// Subtree rendered as plain JSON.
    pub fn subtree_json(&self, path: &ConfigPath) -> Option<serde_json::Value> {
        let root = self.root.read();
        root.get(path.segments()).map(Node::to_json)
    }

    pub(crate) fn root_clone(&self) -> Node {
        self.root.read().clone()
    }

    pub(crate) fn install_root(&self, node: Node) {
        *self.root.write() = node;
    }

    // -- writes --

    /// Create any missing intermediates; initialize an absent leaf to
    /// `default`. Returns the (existing or created) leaf value.
    pub fn find_or_create(
        &self,
        path: &ConfigPath,
        default: ConfigValue,
        timestamp: u64,
    ) -> Result<ConfigValue, ConfigError> {
        if let Some(info) = self.lookup(path) {
            return match info.value {
                Some(value) => Ok(value),
                None => Err(ConfigError::Malformed(format!(
                    "{path} is a container, expected a leaf"
                ))),
            };
        }
        self.set_leaf(path, default.clone(), timestamp)?;
        // A newer concurrent write may have won; read back.
        Ok(self.get_value(path).unwrap_or(default))
    }

    /// Write a leaf, last-writer-wins by timestamp.
    pub fn set_leaf(
        &self,
        path: &ConfigPath,
        value: ConfigValue,
        timestamp: u64,
    ) -> Result<(), ConfigError> {
        self.batch(vec![BatchEntry { path: path.clone(), op: WriteOp::SetLeaf(value), timestamp }])
    }

    /// Ensure a container exists at `path`.
    pub fn set_container(&self, path: &ConfigPath, timestamp: u64) -> Result<(), ConfigError> {
        self.batch(vec![BatchEntry { path: path.clone(), op: WriteOp::SetContainer, timestamp }])
    }

    /// Remove the node at `path`, last-writer-wins by timestamp.
    pub fn remove(&self, path: &ConfigPath, timestamp: u64) -> Result<(), ConfigError> {
        self.batch(vec![BatchEntry { path: path.clone(), op: WriteOp::Remove, timestamp }])
    }

    /// Apply a set of entries all-or-nothing.
    ///
    /// On validator rejection nothing is applied. Subscriber callbacks
    /// fire after the batch commits, depth-first over the affected
    /// paths; per-path order matches application order.
    pub fn batch(&self, entries: Vec<BatchEntry>) -> Result<(), ConfigError> {
        let validators = self.validators.lock();
        let mut root = self.root.write();

        let mut staged = root.clone();
        let mut events: Vec<WatchEvent> = Vec::new();
        let mut records: Vec<(ConfigPath, TlogOp, Option<ConfigValue>, u64)> = Vec::new();

        for entry in &entries {
            apply_entry(&mut staged, entry, &validators, &mut events, &mut records)?;
        }
        drop(validators);

        *root = staged;

        if let Some(log) = self.log.lock().as_mut() {
            for (path, op, value, timestamp) in &records {
                log.append(*timestamp, path.clone(), *op, value.clone())?;
            }
            log.flush()?;
        }
        drop(root);

        // Depth-first deterministic delivery; stable sort keeps per-path
        // application order.
        events.sort_by(|a, b| a.path().cmp(b.path()));
        let subs = self.subs.lock();
        for event in events {
            for handler in subs.matching(event.path(), event.kind()) {
                self.notifier.post(handler, event.clone());
            }
        }
        Ok(())
    }

    /// Reconstruct state from transaction log records (startup).
    ///
    /// Validators, subscribers, and the attached log are all bypassed;
    /// replaying the full log from an empty tree reproduces the exact
    /// tree, timestamps included.
    pub fn replay<I: IntoIterator<Item = TlogRecord>>(&self, records: I) {
        let mut root = self.root.write();
        let no_validators: HashMap<ConfigPath, Validator> = HashMap::new();
        for record in records {
            let entry = BatchEntry {
                path: record.path,
                op: match record.op {
                    TlogOp::SetLeaf => WriteOp::SetLeaf(record.value.unwrap_or(ConfigValue::Null)),
                    TlogOp::SetContainer => WriteOp::SetContainer,
                    TlogOp::Remove => WriteOp::Remove,
                },
                timestamp: record.timestamp,
            };
            let mut events = Vec::new();
            let mut records_out = Vec::new();
            // Replayed records already passed validation when first
            // committed; an error here means a corrupt log record.
            if apply_entry(&mut root, &entry, &no_validators, &mut events, &mut records_out)
                .is_err()
            {
                tracing::warn!(path = %entry.path, "skipping unreplayable log record");
            }
        }
    }

    // -- subscriptions & validators --

    /// Attach a subscriber at `path`. `Initialized` fires synchronously
    /// before this returns.
    pub fn subscribe(
        &self,
        path: &ConfigPath,
        kind: WatchKind,
        handler: impl Fn(&WatchEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let handler: WatchHandler = Arc::new(handler);
        let handle = self.subs.lock().add(path.clone(), kind, Arc::clone(&handler));
        if kind == WatchKind::Initialized {
            let value = self.get_value(path);
            handler(&WatchEvent::Initialized { path: path.clone(), value });
        }
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subs.lock().remove(handle);
    }

    /// Attach a validator to a leaf path, replacing any previous one.
    pub fn add_validator(
        &self,
        path: &ConfigPath,
        validator: impl Fn(&ConfigValue) -> Result<ConfigValue, String> + Send + Sync + 'static,
    ) {
        self.validators.lock().insert(path.clone(), Box::new(validator));
    }
}

/// Stage one entry onto `root`, collecting events and log records.
fn apply_entry(
    root: &mut Node,
    entry: &BatchEntry,
    validators: &HashMap<ConfigPath, Validator>,
    events: &mut Vec<WatchEvent>,
    records: &mut Vec<(ConfigPath, TlogOp, Option<ConfigValue>, u64)>,
) -> Result<(), ConfigError> {
    let segments = entry.path.segments();
    if segments.is_empty() {
        return match entry.op {
            // The root is always a container; creating it is a no-op.
            WriteOp::SetContainer => Ok(()),
            _ => Err(ConfigError::Malformed("cannot write a leaf at the root".to_string())),
        };
    }

    let ts = entry.timestamp;
    // Last-writer-wins by timestamp, not arrival order: a write that is
    // not newer than the existing node is a no-op (no events, no log
    // record, no intermediate creation).
    if let Some(existing) = root.get(segments) {
        if ts <= existing.timestamp {
            return Ok(());
        }
    } else if matches!(entry.op, WriteOp::Remove) {
        return Ok(());
    }

    let prefix = entry.path.parent().unwrap_or_else(ConfigPath::root);
    let parent = descend(
        root,
        &segments[..segments.len() - 1],
        &ConfigPath::root(),
        ts,
        events,
    );
    let name = &segments[segments.len() - 1];
    let NodeBody::Container(children) = &mut parent.body else {
        return Err(ConfigError::Malformed(format!("{prefix} is not a container")));
    };

    match &entry.op {
        WriteOp::SetLeaf(value) => {
            let coerced = match validators.get(&entry.path) {
                Some(validate) => validate(value).map_err(|reason| {
                    ConfigError::ValidationRejected { path: entry.path.clone(), reason }
                })?,
                None => value.clone(),
            };
            match children.get_mut(name) {
                Some(node) => {
                    let changed = match &node.body {
                        NodeBody::Leaf(old) => *old != coerced,
                        NodeBody::Container(old_children) => {
                            // Container→leaf switch destroys the old node.
                            clear_container(&entry.path, old_children, events);
                            true
                        }
                    };
                    *node = Node::leaf(coerced.clone(), ts);
                    if changed {
                        events.push(WatchEvent::ValueChanged {
                            path: entry.path.clone(),
                            value: Some(coerced.clone()),
                        });
                    }
                }
                None => {
                    children.insert(name.clone(), Node::leaf(coerced.clone(), ts));
                    events.push(WatchEvent::ChildAdded { path: prefix, child: name.clone() });
                    events.push(WatchEvent::ValueChanged {
                        path: entry.path.clone(),
                        value: Some(coerced.clone()),
                    });
                }
            }
            records.push((entry.path.clone(), TlogOp::SetLeaf, Some(coerced), ts));
        }

        WriteOp::SetContainer => {
            match children.get_mut(name) {
                Some(node) => {
                    if let NodeBody::Leaf(_) = node.body {
                        // Leaf→container switch destroys the old node.
                        events.push(WatchEvent::ValueChanged {
                            path: entry.path.clone(),
                            value: None,
                        });
                        node.body = NodeBody::Container(IndexMap::new());
                    }
                    node.timestamp = ts;
                }
                None => {
                    children.insert(name.clone(), Node::container(ts));
                    events.push(WatchEvent::ChildAdded { path: prefix, child: name.clone() });
                }
            }
            records.push((entry.path.clone(), TlogOp::SetContainer, None, ts));
        }

        WriteOp::Remove => {
            if let Some(node) = children.shift_remove(name) {
                events.push(WatchEvent::ChildRemoved { path: prefix, child: name.clone() });
                match &node.body {
                    NodeBody::Leaf(_) => events.push(WatchEvent::ValueChanged {
                        path: entry.path.clone(),
                        value: None,
                    }),
                    NodeBody::Container(grandchildren) => {
                        clear_container(&entry.path, grandchildren, events)
                    }
                }
                records.push((entry.path.clone(), TlogOp::Remove, None, ts));
            }
        }
    }
    Ok(())
}

/// Walk to the parent of the target, creating missing containers,
/// destroying leaves on the way, and bumping ancestor timestamps.
fn descend<'a>(
    node: &'a mut Node,
    segments: &[String],
    prefix: &ConfigPath,
    ts: u64,
    events: &mut Vec<WatchEvent>,
) -> &'a mut Node {
    node.timestamp = node.timestamp.max(ts);
    // A leaf on the write path is destroyed by the write passing
    // through it.
    if matches!(node.body, NodeBody::Leaf(_)) {
        events.push(WatchEvent::ValueChanged { path: prefix.clone(), value: None });
        node.body = NodeBody::Container(IndexMap::new());
    }
    let Some((segment, rest)) = segments.split_first() else {
        return node;
    };
    let NodeBody::Container(children) = &mut node.body else {
        unreachable!()
    };
    if !children.contains_key(segment) {
        children.insert(segment.clone(), Node::container(ts));
        events.push(WatchEvent::ChildAdded { path: prefix.clone(), child: segment.clone() });
    }
    let child_path = prefix.child(segment.clone());
    match children.get_mut(segment) {
        Some(child) => descend(child, rest, &child_path, ts, events),
        None => unreachable!(),
    }
}

/// Emit removal events for every node under a destroyed container.
fn clear_container(
    path: &ConfigPath,
    children: &IndexMap<String, Node>,
    events: &mut Vec<WatchEvent>,
) {
    for (name, child) in children {
        events.push(WatchEvent::ChildRemoved { path: path.clone(), child: name.clone() });
        let child_path = path.child(name.clone());
        match &child.body {
            NodeBody::Leaf(_) => {
                events.push(WatchEvent::ValueChanged { path: child_path, value: None })
            }
            NodeBody::Container(grandchildren) => {
                clear_container(&child_path, grandchildren, events)
            }
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
