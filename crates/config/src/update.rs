// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! MERGE/RESET interpreter for deployment configuration updates.
//!
//! RESET entries apply first, in list order; the empty pointer resets
//! the whole subtree to the component defaults and short-circuits.
//! MERGE applies second as a recursive overlay: containers merge,
//! everything else (scalars, nulls, lists) replaces wholesale.
//!
//! The output is a forward batch plus the inverse batch needed to roll
//! the live tree back to its pre-deployment state. Both are computed
//! against the same before/after trees, so rollback restores exactly
//! what the forward batch displaced.

use crate::path::ConfigPath;
use crate::store::{BatchEntry, ConfigError, WriteOp};
use crate::value::ConfigValue;
use ember_core::ConfigUpdate;
use serde_json::{Map, Value};

/// A batch entry without a timestamp; stamped at activation time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlanOp {
    pub path: ConfigPath,
    pub op: WriteOp,
}

/// Forward and inverse batches for one component update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePlan {
    pub forward: Vec<PlanOp>,
    pub inverse: Vec<PlanOp>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// Stamp plan ops into batch entries.
pub fn stamp(ops: &[PlanOp], timestamp: u64) -> Vec<BatchEntry> {
    ops.iter()
        .map(|op| BatchEntry { path: op.path.clone(), op: op.op.clone(), timestamp })
        .collect()
}

/// Compute the batch for one component's configuration update.
///
/// `live` is the component's current configuration subtree (JSON,
/// `None` when absent), `defaults` the recipe's default configuration,
/// and `base` the subtree's location in the store.
pub fn plan_component_update(
    base: &ConfigPath,
    live: Option<&Value>,
    defaults: &Value,
    update: &ConfigUpdate,
) -> Result<UpdatePlan, ConfigError> {
    let current = as_object(live);
    let mut target = current.clone();

    if let Some(resets) = &update.reset {
        for pointer in resets {
            if pointer.is_empty() {
                // Reset everything to defaults; later entries are ignored.
                target = as_object(Some(defaults));
                break;
            }
            let path = ConfigPath::from_pointer(pointer)
                .map_err(|e| ConfigError::Malformed(e.to_string()))?;
            match defaults.pointer(pointer) {
                Some(default_subtree) => {
                    set_at(&mut target, path.segments(), default_subtree.clone())?
                }
                None => remove_at(&mut target, path.segments())?,
            }
        }
    }

    if let Some(merge) = &update.merge {
        let Value::Object(overlay) = merge else {
            return Err(ConfigError::Malformed("MERGE must be an object".to_string()));
        };
        merge_into(&mut target, overlay);
    }

    let before = Value::Object(current);
    let after = Value::Object(target);
    let mut plan = UpdatePlan::default();
    diff(base, Some(&before), Some(&after), &mut plan.forward)?;
    diff(base, Some(&after), Some(&before), &mut plan.inverse)?;
    Ok(plan)
}

/// Ops that write `value` as the subtree at `base` (used to install
/// defaults for a fresh component or restore a removed one).
pub fn subtree_ops(base: &ConfigPath, value: &Value) -> Result<Vec<PlanOp>, ConfigError> {
    let mut ops = Vec::new();
    diff(base, None, Some(value), &mut ops)?;
    Ok(ops)
}

fn as_object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Recursive overlay: container ∧ container recurses, everything else
/// replaces. Null is a value, not a deletion.
fn merge_into(target: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, incoming) in overlay {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_into(existing, nested)
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Emit the ops that turn `from` into `to` at `path`.
fn diff(
    path: &ConfigPath,
    from: Option<&Value>,
    to: Option<&Value>,
    out: &mut Vec<PlanOp>,
) -> Result<(), ConfigError> {
    match to {
        None => {
            if from.is_some() {
                out.push(PlanOp { path: path.clone(), op: WriteOp::Remove });
            }
        }
        Some(Value::Object(to_map)) => {
            let from_map = match from {
                Some(Value::Object(map)) => Some(map),
                _ => None,
            };
            if from_map.is_none() {
                out.push(PlanOp { path: path.clone(), op: WriteOp::SetContainer });
            }
            for (key, to_value) in to_map {
                let from_value = from_map.and_then(|m| m.get(key));
                diff(&path.child(key.clone()), from_value, Some(to_value), out)?;
            }
            if let Some(from_map) = from_map {
                for key in from_map.keys() {
                    if !to_map.contains_key(key) {
                        out.push(PlanOp { path: path.child(key.clone()), op: WriteOp::Remove });
                    }
                }
            }
        }
        Some(leaf) => {
            if from != Some(leaf) {
                let value = ConfigValue::from_json(leaf).ok_or_else(|| {
                    ConfigError::Malformed(format!("unrepresentable value at {path}"))
                })?;
                out.push(PlanOp { path: path.clone(), op: WriteOp::SetLeaf(value) });
            }
        }
    }
    Ok(())
}

/// Set `value` at `segments` inside a JSON object tree, creating
/// intermediate objects. RESET cannot address list elements.
fn set_at(
    target: &mut Map<String, Value>,
    segments: &[String],
    value: Value,
) -> Result<(), ConfigError> {
    let (first, rest) = match segments {
        [first, rest @ ..] => (first, rest),
        [] => return Err(ConfigError::Malformed("empty RESET pointer segment".to_string())),
    };
    if rest.is_empty() {
        target.insert(first.clone(), value);
        return Ok(());
    }
    let slot = target.entry(first.clone()).or_insert_with(|| Value::Object(Map::new()));
    match slot {
        Value::Object(child) => set_at(child, rest, value),
        Value::Array(_) => Err(ConfigError::Malformed(
            "RESET pointer addresses a list element".to_string(),
        )),
        other => {
            *other = Value::Object(Map::new());
            match other {
                Value::Object(child) => set_at(child, rest, value),
                _ => Ok(()),
            }
        }
    }
}

/// Remove the node at `segments`; absent locations are a no-op.
fn remove_at(target: &mut Map<String, Value>, segments: &[String]) -> Result<(), ConfigError> {
    let (first, rest) = match segments {
        [first, rest @ ..] => (first, rest),
        [] => return Ok(()),
    };
    if rest.is_empty() {
        target.remove(first);
        return Ok(());
    }
    match target.get_mut(first) {
        Some(Value::Object(child)) => remove_at(child, rest),
        Some(Value::Array(_)) => Err(ConfigError::Malformed(
            "RESET pointer addresses a list element".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "update_tests.rs"]
mod tests;
