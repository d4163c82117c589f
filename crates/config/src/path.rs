// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config tree paths and RFC 6901 JSON Pointer parsing.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Path of a node in the config tree: an ordered sequence of non-empty
/// name segments from the root. The empty sequence is the root itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigPath(Vec<String>);

/// Errors from JSON Pointer parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PointerError {
    #[error("pointer must start with '/': '{0}'")]
    MissingSlash(String),
    #[error("pointer '{0}' contains an empty reference token")]
    EmptySegment(String),
}

impl ConfigPath {
    pub fn root() -> Self {
        ConfigPath(Vec::new())
    }

    /// Parse a slash-separated path like `services/web/port`.
    ///
    /// Leading and trailing slashes are tolerated; empty segments are not.
    pub fn parse(text: &str) -> Self {
        ConfigPath(
            text.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Parse an RFC 6901 JSON Pointer (`""`, `/a/b`, `~0`/`~1` escapes).
    pub fn from_pointer(pointer: &str) -> Result<Self, PointerError> {
        if pointer.is_empty() {
            return Ok(ConfigPath::root());
        }
        let Some(rest) = pointer.strip_prefix('/') else {
            return Err(PointerError::MissingSlash(pointer.to_string()));
        };
        let mut segments = Vec::new();
        for token in rest.split('/') {
            if token.is_empty() {
                return Err(PointerError::EmptySegment(pointer.to_string()));
            }
            segments.push(token.replace("~1", "/").replace("~0", "~"));
        }
        Ok(ConfigPath(segments))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Final segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Path without its final segment, or `None` for the root.
    pub fn parent(&self) -> Option<ConfigPath> {
        if self.0.is_empty() {
            return None;
        }
        Some(ConfigPath(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn child(&self, name: impl Into<String>) -> ConfigPath {
        let mut segments = self.0.clone();
        segments.push(name.into());
        ConfigPath(segments)
    }

    pub fn join(&self, other: &ConfigPath) -> ConfigPath {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        ConfigPath(segments)
    }

    pub fn starts_with(&self, prefix: &ConfigPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Strip `prefix`, returning the relative remainder.
    pub fn relative_to(&self, prefix: &ConfigPath) -> Option<ConfigPath> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(ConfigPath(self.0[prefix.0.len()..].to_vec()))
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl From<&str> for ConfigPath {
    fn from(text: &str) -> Self {
        ConfigPath::parse(text)
    }
}

impl FromIterator<String> for ConfigPath {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        ConfigPath(iter.into_iter().filter(|s| !s.is_empty()).collect())
    }
}

impl Serialize for ConfigPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.split('/').any(str::is_empty) && !text.is_empty() {
            return Err(D::Error::custom(format!("empty segment in path '{text}'")));
        }
        Ok(ConfigPath::parse(&text))
    }
}

#[cfg(test)]
#[path = "path_tests.rs"]
mod tests;
