// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ember-recipe: component recipes and dependency resolution.
//!
//! Recipes are the static YAML declarations of components — name,
//! version, dependencies, lifecycle, default configuration. The
//! resolver turns a set of top-level `(name, requirement)` pairs plus
//! the local recipe cache into a concrete dependency closure and a
//! topological start order.

mod cache;
mod resolver;
mod types;

pub use cache::{recipe_file_name, RecipeCache};
pub use resolver::{resolve, Resolution, ResolveError};
pub use types::{
    parse_recipe, Artifact, ComponentConfiguration, DependencySpec, Lifecycle, Manifest, Platform,
    Recipe, RecipeError, Skipif, Step, StepDetail,
};
