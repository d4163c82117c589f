// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config store and mutation-operator specs.

use ember_config::{
    plan_component_update, stamp, ConfigPath, ConfigStore, ConfigValue, Tlog, WatchEvent,
    WatchKind,
};
use ember_core::ConfigUpdate;
use serde_json::json;
use std::sync::mpsc;
use std::time::Duration;

fn path(text: &str) -> ConfigPath {
    ConfigPath::parse(text)
}

fn seed(store: &ConfigStore, base: &ConfigPath, value: &serde_json::Value) {
    let ops = ember_config::subtree_ops(base, value).expect("seed plan");
    store.batch(stamp(&ops, 1)).expect("seed batch");
}

/// S3 — MERGE overlays while untouched siblings stay silent.
#[test]
fn merge_spec_s3() {
    let store = ConfigStore::new();
    let base = path("services/c/configuration");
    seed(&store, &base, &json!({"msg": "hello", "nested": {"k": 1}}));

    let (tx, rx) = mpsc::channel();
    store.subscribe(&base.child("nested"), WatchKind::ChildAdded, move |event| {
        let _ = tx.send(event.clone());
    });

    let update = ConfigUpdate {
        merge: Some(json!({"msg": "hi", "nested": {"k2": 2}})),
        reset: None,
    };
    let plan = plan_component_update(
        &base,
        store.subtree_json(&base).as_ref(),
        &json!({}),
        &update,
    )
    .expect("plan");
    store.batch(stamp(&plan.forward, 10)).expect("apply");

    assert_eq!(
        store.subtree_json(&base),
        Some(json!({"msg": "hi", "nested": {"k": 1, "k2": 2}})),
    );

    // Exactly one child-added for k2, nothing for k.
    let event = rx.recv_timeout(Duration::from_secs(2)).expect("child added event");
    match event {
        WatchEvent::ChildAdded { child, .. } => assert_eq!(child, "k2"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
}

/// S4 — leaf/container swap fires value-removed then container events,
/// and path subscriptions survive the swap.
#[test]
fn leaf_container_swap_spec_s4() {
    let store = ConfigStore::new();
    let base = path("services/c/configuration");
    seed(&store, &base, &json!({"x": "v"}));

    let (tx, rx) = mpsc::channel();
    let tx_value = tx.clone();
    let watched = base.child("x");
    store.subscribe(&watched, WatchKind::ValueChanged, move |event| {
        let _ = tx_value.send(event.clone());
    });
    store.subscribe(&watched, WatchKind::ChildAdded, move |event| {
        let _ = tx.send(event.clone());
    });

    let update = ConfigUpdate { merge: Some(json!({"x": {"y": 1}})), reset: None };
    let plan = plan_component_update(
        &base,
        store.subtree_json(&base).as_ref(),
        &json!({}),
        &update,
    )
    .expect("plan");
    store.batch(stamp(&plan.forward, 10)).expect("apply");

    assert_eq!(store.subtree_json(&base), Some(json!({"x": {"y": 1}})));

    // Value removed first, then the container's child appears.
    match rx.recv_timeout(Duration::from_secs(2)).expect("value removed") {
        WatchEvent::ValueChanged { value, .. } => assert_eq!(value, None),
        other => panic!("unexpected event {other:?}"),
    }
    match rx.recv_timeout(Duration::from_secs(2)).expect("container event") {
        WatchEvent::ChildAdded { child, .. } => assert_eq!(child, "y"),
        other => panic!("unexpected event {other:?}"),
    }

    // Still attached by path: later container changes arrive.
    store
        .set_leaf(&watched.child("z"), ConfigValue::Int(2), 20)
        .expect("write");
    match rx.recv_timeout(Duration::from_secs(2)).expect("later event") {
        WatchEvent::ChildAdded { child, .. } => assert_eq!(child, "z"),
        other => panic!("unexpected event {other:?}"),
    }
}

/// Property 1 — the last operation per path in a batch wins.
#[test]
fn batch_last_writer_per_path() {
    let store = ConfigStore::new();
    let ops = vec![
        ember_config::BatchEntry {
            path: path("k"),
            op: ember_config::WriteOp::SetLeaf(ConfigValue::Int(1)),
            timestamp: 10,
        },
        ember_config::BatchEntry {
            path: path("k"),
            op: ember_config::WriteOp::SetLeaf(ConfigValue::Int(2)),
            timestamp: 11,
        },
    ];
    store.batch(ops).expect("batch");
    assert_eq!(store.get_value(&path("k")), Some(ConfigValue::Int(2)));
}

/// Property 4 — replaying the log reproduces the exact tree.
#[test]
fn replay_equals_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("config.tlog");

    let store = ConfigStore::new();
    store.attach_log(Tlog::open(&log_path).expect("open log"));
    seed_logged(&store);

    let replayed = ConfigStore::new();
    replayed.replay(Tlog::read_all(&log_path).expect("read log"));

    assert_eq!(
        replayed.subtree_json(&ConfigPath::root()),
        store.subtree_json(&ConfigPath::root()),
    );
    for leaf in ["a/b", "a/c/d"] {
        assert_eq!(
            replayed.lookup(&path(leaf)).map(|i| i.timestamp),
            store.lookup(&path(leaf)).map(|i| i.timestamp),
        );
    }
}

fn seed_logged(store: &ConfigStore) {
    store.set_leaf(&path("a/b"), ConfigValue::Int(1), 10).expect("write");
    store.set_leaf(&path("a/c/d"), ConfigValue::from("x"), 12).expect("write");
    store.set_leaf(&path("a/b"), ConfigValue::Int(2), 15).expect("write");
    store.remove(&path("gone"), 16).expect("remove");
    store
        .set_leaf(&path("list"), ConfigValue::List(vec![ConfigValue::Int(1)]), 17)
        .expect("write");
}

/// Properties 6 & 7 — MERGE and RESET are idempotent.
#[test]
fn merge_and_reset_idempotence() {
    let base = path("services/c/configuration");
    let defaults = json!({"limits": {"max": 10}});
    let live = json!({"msg": "hello", "limits": {"max": 99}});

    let update = ConfigUpdate {
        merge: Some(json!({"msg": "hi"})),
        reset: Some(vec!["/limits".to_string()]),
    };

    let once = plan_component_update(&base, Some(&live), &defaults, &update).expect("plan");
    let store = ConfigStore::new();
    seed(&store, &base, &live);
    store.batch(stamp(&once.forward, 10)).expect("apply");
    let after_once = store.subtree_json(&base).expect("state");

    let twice =
        plan_component_update(&base, Some(&after_once), &defaults, &update).expect("replan");
    assert!(twice.forward.is_empty());
}
