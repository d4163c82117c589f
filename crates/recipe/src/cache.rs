// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local recipe store: `packages/recipes/<name>-<version>.yaml`.

use crate::types::{parse_recipe, Recipe, RecipeError};
use semver::Version;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Canonical file name for a recipe.
pub fn recipe_file_name(name: &str, version: &Version) -> String {
    format!("{name}-{version}.yaml")
}

/// Split `<name>-<version>` by trying semver on each `-` suffix from
/// the right (component names may contain dashes).
fn split_file_stem(stem: &str) -> Option<(String, Version)> {
    let mut index = stem.len();
    while let Some(pos) = stem[..index].rfind('-') {
        if let Ok(version) = Version::parse(&stem[pos + 1..]) {
            return Some((stem[..pos].to_string(), version));
        }
        index = pos;
    }
    None
}

/// Directory of recipe files.
pub struct RecipeCache {
    dir: PathBuf,
}

impl RecipeCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load one recipe, `None` when the file is absent.
    pub fn load(&self, name: &str, version: &Version) -> Result<Option<Recipe>, RecipeError> {
        let path = self.dir.join(recipe_file_name(name, version));
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(Some(parse_recipe(&text)?))
    }

    /// All cached versions of a component, highest first, semver ties
    /// broken by lexicographic version string.
    pub fn versions(&self, name: &str) -> Vec<Version> {
        let mut versions: Vec<Version> = self
            .scan()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect();
        versions.sort_by(|a, b| b.cmp(a).then_with(|| b.to_string().cmp(&a.to_string())));
        versions
    }

    /// All `(name, version)` pairs found in the cache directory.
    pub fn scan(&self) -> Vec<(String, Version)> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match split_file_stem(stem) {
                Some(pair) => found.push(pair),
                None => warn!(file = %path.display(), "recipe file name is not <name>-<version>.yaml"),
            }
        }
        found.sort();
        found
    }

    /// Write a recipe under its canonical file name.
    pub fn store(&self, recipe: &Recipe) -> Result<PathBuf, RecipeError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(recipe_file_name(&recipe.name, &recipe.version));
        let text =
            serde_yaml::to_string(recipe).map_err(|e| RecipeError::Parse(e.to_string()))?;
        std::fs::write(&path, text)?;
        Ok(path)
    }

    /// Import every recipe from `src`, validating that each file's
    /// declared name/version matches its file name.
    pub fn import_dir(&self, src: &Path) -> Result<Vec<(String, Version)>, RecipeError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut imported = Vec::new();
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            let recipe = parse_recipe(&text)?;
            let expected = recipe_file_name(&recipe.name, &recipe.version);
            let actual = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or_default()
                .to_string();
            if actual != expected {
                return Err(RecipeError::FilenameMismatch {
                    file: actual,
                    declared: format!("{}-{}", recipe.name, recipe.version),
                    expected,
                });
            }
            std::fs::copy(&path, self.dir.join(&expected))?;
            imported.push((recipe.name, recipe.version));
        }
        imported.sort();
        Ok(imported)
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
