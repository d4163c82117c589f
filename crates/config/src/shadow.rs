// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shadow view: live tree plus staged-but-uncommitted mutations.
//!
//! Deployments stage their config changes here so affected services can
//! be shown the effective configuration before anything touches the
//! live store. Dropping the view discards the staged state, which is
//! why a deployment cancelled before activation leaves the live config
//! bit-identical.

use crate::path::ConfigPath;
use crate::store::{BatchEntry, ConfigStore, Node, NodeBody, WriteOp};
use crate::value::ConfigValue;
use indexmap::IndexMap;

/// Read-only overlay of staged entries on a snapshot of the live tree.
pub struct ShadowView {
    root: Node,
}

impl ShadowView {
    /// Capture the live tree and overlay `entries`.
    pub fn new(store: &ConfigStore, entries: &[BatchEntry]) -> Self {
        let mut root = store.root_clone();
        for entry in entries {
            apply_silent(&mut root, entry);
        }
        Self { root }
    }

    /// Effective leaf value at `path`.
    pub fn get_value(&self, path: &ConfigPath) -> Option<ConfigValue> {
        match &self.root.get(path.segments())?.body {
            NodeBody::Leaf(value) => Some(value.clone()),
            NodeBody::Container(_) => None,
        }
    }

    /// Effective subtree rendered as plain JSON.
    pub fn subtree_json(&self, path: &ConfigPath) -> Option<serde_json::Value> {
        self.root.get(path.segments()).map(Node::to_json)
    }
}

/// Apply one entry without timestamps, validators, events, or logging —
/// the shadow only answers "what would the tree look like".
fn apply_silent(root: &mut Node, entry: &BatchEntry) {
    let segments = entry.path.segments();
    if segments.is_empty() {
        return;
    }
    let parent = silent_descend(root, &segments[..segments.len() - 1], entry.timestamp);
    let NodeBody::Container(children) = &mut parent.body else {
        unreachable!()
    };
    let name = &segments[segments.len() - 1];
    match &entry.op {
        WriteOp::SetLeaf(value) => {
            children.insert(name.clone(), Node::leaf(value.clone(), entry.timestamp));
        }
        WriteOp::SetContainer => {
            match children.get_mut(name) {
                Some(node) if matches!(node.body, NodeBody::Container(_)) => {}
                _ => {
                    children.insert(name.clone(), Node::container(entry.timestamp));
                }
            };
        }
        WriteOp::Remove => {
            children.shift_remove(name);
        }
    }
}

/// Walk to the parent, forcing containers into existence on the way.
fn silent_descend<'a>(node: &'a mut Node, segments: &[String], ts: u64) -> &'a mut Node {
    if !matches!(node.body, NodeBody::Container(_)) {
        node.body = NodeBody::Container(IndexMap::new());
    }
    let Some((segment, rest)) = segments.split_first() else {
        return node;
    };
    let NodeBody::Container(children) = &mut node.body else {
        unreachable!()
    };
    children
        .entry(segment.clone())
        .or_insert_with(|| Node::container(ts));
    match children.get_mut(segment) {
        Some(child) => silent_descend(child, rest, ts),
        None => unreachable!(),
    }
}

#[cfg(test)]
#[path = "shadow_tests.rs"]
mod tests;
