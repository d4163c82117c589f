// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dependency closure resolution.
//!
//! Given top-level `(name, requirement)` pairs and the recipe cache,
//! compute deterministic concrete picks (highest version satisfying
//! all active constraints) and a topological start order. Cycles are
//! detected over HARD and SOFT edges alike.

use crate::cache::RecipeCache;
use crate::types::{Recipe, RecipeError};
use ember_core::DependencyKind;
use indexmap::IndexMap;
use semver::{Version, VersionReq};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("circular dependency: {}", cycle.join(" -> "))]
    Circular { cycle: Vec<String> },

    #[error("no version of {name} satisfies {}", constraints.join(", "))]
    Unsatisfiable { name: String, constraints: Vec<String> },

    #[error("missing recipes: {}", names.join(", "))]
    MissingRecipes { names: Vec<String> },

    #[error("resolution did not converge")]
    Diverged,

    #[error(transparent)]
    Recipe(#[from] RecipeError),
}

impl ResolveError {
    pub fn kind(&self) -> ember_core::ErrorKind {
        match self {
            ResolveError::Circular { .. } => ember_core::ErrorKind::CircularDependency,
            ResolveError::Unsatisfiable { .. } | ResolveError::Diverged => {
                ember_core::ErrorKind::Unsatisfiable
            }
            ResolveError::MissingRecipes { .. } => ember_core::ErrorKind::NotFound,
            ResolveError::Recipe(e) => e.kind(),
        }
    }
}

/// A resolved dependency closure.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Concrete picks for every component in the closure.
    pub picks: IndexMap<String, Version>,
    /// Topological start order: dependencies before dependents.
    pub order: Vec<String>,
    /// Edges of the closure: component → `(dependency, kind)`.
    pub dependencies: IndexMap<String, Vec<(String, DependencyKind)>>,
}

impl Resolution {
    pub fn recipe_of<'a>(
        &self,
        cache: &'a RecipeCache,
        name: &str,
    ) -> Result<Option<Recipe>, RecipeError> {
        match self.picks.get(name) {
            Some(version) => cache.load(name, version),
            None => Ok(None),
        }
    }
}

const MAX_ROUNDS: usize = 64;

/// Resolve a closure for `targets` against the local cache.
pub fn resolve(
    targets: &[(String, VersionReq)],
    cache: &RecipeCache,
) -> Result<Resolution, ResolveError> {
    // name → (requirer, requirement); BTreeMap for deterministic walks.
    let mut constraints: BTreeMap<String, Vec<(String, VersionReq)>> = BTreeMap::new();
    for (name, requirement) in targets {
        constraints
            .entry(name.clone())
            .or_default()
            .push(("<deployment>".to_string(), requirement.clone()));
    }

    let mut picks: BTreeMap<String, Version> = BTreeMap::new();
    let mut recipes: BTreeMap<String, Recipe> = BTreeMap::new();

    for _round in 0..MAX_ROUNDS {
        // Pick the highest cached version satisfying every constraint.
        let mut next_picks: BTreeMap<String, Version> = BTreeMap::new();
        let mut missing: Vec<String> = Vec::new();
        for (name, reqs) in &constraints {
            let versions = cache.versions(name);
            if versions.is_empty() {
                missing.push(name.clone());
                continue;
            }
            match versions.iter().find(|v| reqs.iter().all(|(_, r)| r.matches(v))) {
                Some(version) => {
                    next_picks.insert(name.clone(), version.clone());
                }
                None => {
                    return Err(ResolveError::Unsatisfiable {
                        name: name.clone(),
                        constraints: reqs
                            .iter()
                            .map(|(requirer, r)| format!("{requirer} requires {r}"))
                            .collect(),
                    })
                }
            }
        }
        if !missing.is_empty() {
            return Err(ResolveError::MissingRecipes { names: missing });
        }

        // Load picked recipes and re-derive the constraint set.
        recipes.clear();
        let mut next_constraints: BTreeMap<String, Vec<(String, VersionReq)>> = BTreeMap::new();
        for (name, requirement) in targets {
            next_constraints
                .entry(name.clone())
                .or_default()
                .push(("<deployment>".to_string(), requirement.clone()));
        }
        for (name, version) in &next_picks {
            let recipe = cache.load(name, version)?.ok_or_else(|| {
                ResolveError::MissingRecipes { names: vec![name.clone()] }
            })?;
            for (dep, spec) in &recipe.dependencies {
                next_constraints
                    .entry(dep.clone())
                    .or_default()
                    .push((name.clone(), spec.version_requirement.clone()));
            }
            recipes.insert(name.clone(), recipe);
        }

        let stable = next_picks == picks && next_constraints == constraints;
        picks = next_picks;
        constraints = next_constraints;
        if stable {
            return finish(picks, &recipes);
        }
    }
    Err(ResolveError::Diverged)
}

/// Detect cycles and compute the start order from the stable picks.
fn finish(
    picks: BTreeMap<String, Version>,
    recipes: &BTreeMap<String, Recipe>,
) -> Result<Resolution, ResolveError> {
    let mut dependencies: IndexMap<String, Vec<(String, DependencyKind)>> = IndexMap::new();
    for name in picks.keys() {
        let edges = recipes
            .get(name)
            .map(|recipe| {
                recipe
                    .dependencies
                    .iter()
                    .map(|(dep, spec)| (dep.clone(), spec.dependency_type))
                    .collect()
            })
            .unwrap_or_default();
        dependencies.insert(name.clone(), edges);
    }

    if let Some(cycle) = find_cycle(&dependencies) {
        return Err(ResolveError::Circular { cycle });
    }

    // Kahn's algorithm, deterministic by name: dependencies first.
    let mut order = Vec::with_capacity(dependencies.len());
    let mut emitted: BTreeSet<String> = BTreeSet::new();
    while order.len() < dependencies.len() {
        let mut advanced = false;
        for (name, edges) in &dependencies {
            if emitted.contains(name) {
                continue;
            }
            if edges.iter().all(|(dep, _)| emitted.contains(dep)) {
                order.push(name.clone());
                emitted.insert(name.clone());
                advanced = true;
            }
        }
        if !advanced {
            // Unreachable after cycle detection; guard anyway.
            return Err(ResolveError::Diverged);
        }
    }

    let mut ordered_picks = IndexMap::new();
    for name in &order {
        if let Some(version) = picks.get(name) {
            ordered_picks.insert(name.clone(), version.clone());
        }
    }
    Ok(Resolution { picks: ordered_picks, order, dependencies })
}

/// Depth-first cycle search; returns the offending cycle path.
fn find_cycle(
    dependencies: &IndexMap<String, Vec<(String, DependencyKind)>>,
) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        name: &'a str,
        dependencies: &'a IndexMap<String, Vec<(String, DependencyKind)>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(edges) = dependencies.get(name) {
            for (dep, _) in edges {
                if dependencies.contains_key(dep.as_str()) {
                    if let Some(cycle) = visit(dep, dependencies, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }

    for name in dependencies.keys() {
        if let Some(cycle) = visit(name, dependencies, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
