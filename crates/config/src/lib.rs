// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ember-config: the device's live operational configuration model.
//!
//! A hierarchical key/value tree with per-node timestamps, subscribers,
//! validators, transactional batch updates, an append-only transaction
//! log (replay + live tail), JSON/YAML snapshots, and the MERGE/RESET
//! mutation operator used by deployments.

mod path;
mod shadow;
mod snapshot;
mod store;
mod tlog;
mod update;
mod value;
mod watch;

pub use path::{ConfigPath, PointerError};
pub use shadow::ShadowView;
pub use snapshot::{dump_file, load_file, Format, SnapshotError};
pub use store::{BatchEntry, ConfigError, ConfigStore, NodeInfo, WriteOp};
pub use tlog::{Tlog, TlogError, TlogOp, TlogRecord, TailReceiver};
pub use update::{plan_component_update, stamp, subtree_ops, PlanOp, UpdatePlan};
pub use value::ConfigValue;
pub use watch::{SubscriptionHandle, WatchEvent, WatchKind};
