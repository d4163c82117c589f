// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Whole-tree snapshots in JSON or YAML.
//!
//! The wire form keeps values and per-node timestamps side by side:
//!
//! ```json
//! { "version": 1,
//!   "config": { "svc": { "port": 8080 } },
//!   "meta":   { "t": 20, "c": { "svc": { "t": 20, "c": { "port": 20 } } } } }
//! ```
//!
//! Loading a malformed snapshot fails with `MALFORMED_CONFIG` and
//! leaves the existing tree untouched.

use crate::store::{ConfigError, ConfigStore, Node, NodeBody};
use crate::value::ConfigValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

pub const CURRENT_SNAPSHOT_VERSION: u32 = 1;

/// Snapshot serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// Detect from a file extension (`.json`, `.yaml`, `.yml`).
    pub fn from_path(path: &Path) -> Option<Format> {
        match path.extension()?.to_str()? {
            "json" => Some(Format::Json),
            "yaml" | "yml" => Some(Format::Yaml),
            _ => None,
        }
    }
}

/// Snapshot errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("snapshot I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotError {
    pub fn kind(&self) -> ember_core::ErrorKind {
        match self {
            SnapshotError::Malformed(_) => ember_core::ErrorKind::MalformedConfig,
            SnapshotError::Io(_) => ember_core::ErrorKind::IoError,
        }
    }
}

/// Per-node timestamps mirroring the config tree's shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum MetaNode {
    Leaf(u64),
    Container {
        t: u64,
        #[serde(default)]
        c: IndexMap<String, MetaNode>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    version: u32,
    config: serde_json::Value,
    meta: MetaNode,
}

impl ConfigStore {
    /// Serialize the whole tree, timestamps included.
    pub fn dump(&self, writer: impl Write, format: Format) -> Result<(), SnapshotError> {
        let root = self.root_clone();
        let doc = SnapshotDoc {
            version: CURRENT_SNAPSHOT_VERSION,
            config: root.to_json(),
            meta: meta_of(&root),
        };
        match format {
            Format::Json => serde_json::to_writer_pretty(writer, &doc)
                .map_err(|e| SnapshotError::Malformed(e.to_string())),
            Format::Yaml => serde_yaml::to_writer(writer, &doc)
                .map_err(|e| SnapshotError::Malformed(e.to_string())),
        }
    }

    /// Replace the tree from a snapshot.
    ///
    /// The replacement is staged fully before it is installed, so a
    /// parse or shape error leaves the current tree as it was.
    pub fn load(&self, reader: impl Read, format: Format) -> Result<(), SnapshotError> {
        let doc: SnapshotDoc = match format {
            Format::Json => serde_json::from_reader(reader)
                .map_err(|e| SnapshotError::Malformed(e.to_string()))?,
            Format::Yaml => serde_yaml::from_reader(reader)
                .map_err(|e| SnapshotError::Malformed(e.to_string()))?,
        };
        if doc.version != CURRENT_SNAPSHOT_VERSION {
            return Err(SnapshotError::Malformed(format!(
                "unsupported snapshot version {}",
                doc.version
            )));
        }
        let root = node_of(&doc.config, Some(&doc.meta))?;
        if matches!(root.body, NodeBody::Leaf(_)) {
            return Err(SnapshotError::Malformed("root must be a container".to_string()));
        }
        self.install_root(root);
        Ok(())
    }
}

/// Load a snapshot file if it exists, detecting the format from the
/// extension.
pub fn load_file(store: &ConfigStore, path: &Path) -> Result<bool, SnapshotError> {
    if !path.exists() {
        return Ok(false);
    }
    let format = Format::from_path(path)
        .ok_or_else(|| SnapshotError::Malformed(format!("unknown extension: {}", path.display())))?;
    let file = std::fs::File::open(path)?;
    store.load(std::io::BufReader::new(file), format)?;
    Ok(true)
}

/// Write a snapshot atomically (temp file + rename).
pub fn dump_file(store: &ConfigStore, path: &Path) -> Result<(), SnapshotError> {
    let format = Format::from_path(path)
        .ok_or_else(|| SnapshotError::Malformed(format!("unknown extension: {}", path.display())))?;
    let tmp = path.with_extension("tmp");
    {
        let file = std::fs::File::create(&tmp)?;
        store.dump(std::io::BufWriter::new(file), format)?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn meta_of(node: &Node) -> MetaNode {
    match &node.body {
        NodeBody::Leaf(_) => MetaNode::Leaf(node.timestamp),
        NodeBody::Container(children) => MetaNode::Container {
            t: node.timestamp,
            c: children.iter().map(|(name, child)| (name.clone(), meta_of(child))).collect(),
        },
    }
}

fn node_of(value: &serde_json::Value, meta: Option<&MetaNode>) -> Result<Node, SnapshotError> {
    match value {
        serde_json::Value::Object(map) => {
            let (timestamp, children_meta) = match meta {
                Some(MetaNode::Container { t, c }) => (*t, Some(c)),
                Some(MetaNode::Leaf(_)) => {
                    return Err(SnapshotError::Malformed(
                        "timestamp metadata does not match tree shape".to_string(),
                    ))
                }
                None => (0, None),
            };
            let mut children = IndexMap::new();
            for (name, child) in map {
                if name.is_empty() {
                    return Err(SnapshotError::Malformed("empty node name".to_string()));
                }
                let child_meta = children_meta.and_then(|c| c.get(name));
                children.insert(name.clone(), node_of(child, child_meta)?);
            }
            Ok(Node { timestamp, body: NodeBody::Container(children) })
        }
        other => {
            let timestamp = match meta {
                Some(MetaNode::Leaf(t)) => *t,
                Some(MetaNode::Container { .. }) => {
                    return Err(SnapshotError::Malformed(
                        "timestamp metadata does not match tree shape".to_string(),
                    ))
                }
                None => 0,
            };
            let value = ConfigValue::from_json(other).ok_or_else(|| {
                SnapshotError::Malformed("unrepresentable leaf value".to_string())
            })?;
            Ok(Node { timestamp, body: NodeBody::Leaf(value) })
        }
    }
}

// `ConfigError` is the store-facing wrapper for snapshot failures.
impl From<SnapshotError> for ConfigError {
    fn from(e: SnapshotError) -> Self {
        ConfigError::Malformed(e.to_string())
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
