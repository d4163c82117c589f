// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::path::ConfigPath;
use crate::value::ConfigValue;

fn path(text: &str) -> ConfigPath {
    ConfigPath::parse(text)
}

fn populated_store() -> ConfigStore {
    let store = ConfigStore::new();
    store.set_leaf(&path("svc/msg"), ConfigValue::from("hello"), 10).unwrap();
    store.set_leaf(&path("svc/nested/k"), ConfigValue::Int(1), 15).unwrap();
    store.set_leaf(&path("flags/on"), ConfigValue::Bool(true), 20).unwrap();
    store.set_leaf(&path("svc/empty"), ConfigValue::Null, 25).unwrap();
    store
}

#[test]
fn json_round_trip_preserves_values_and_timestamps() {
    let store = populated_store();
    let mut buffer = Vec::new();
    store.dump(&mut buffer, Format::Json).unwrap();

    let restored = ConfigStore::new();
    restored.load(buffer.as_slice(), Format::Json).unwrap();

    assert_eq!(restored.subtree_json(&ConfigPath::root()), store.subtree_json(&ConfigPath::root()));
    assert_eq!(
        restored.lookup(&path("svc/nested/k")).unwrap().timestamp,
        store.lookup(&path("svc/nested/k")).unwrap().timestamp,
    );
    assert_eq!(
        restored.lookup(&path("svc")).unwrap().timestamp,
        store.lookup(&path("svc")).unwrap().timestamp,
    );
}

#[test]
fn yaml_round_trip_preserves_values_and_timestamps() {
    let store = populated_store();
    let mut buffer = Vec::new();
    store.dump(&mut buffer, Format::Yaml).unwrap();

    let restored = ConfigStore::new();
    restored.load(buffer.as_slice(), Format::Yaml).unwrap();

    assert_eq!(restored.subtree_json(&ConfigPath::root()), store.subtree_json(&ConfigPath::root()));
    assert_eq!(restored.lookup(&path("flags/on")).unwrap().timestamp, 20);
}

#[test]
fn malformed_input_leaves_tree_untouched() {
    let store = populated_store();
    let before = store.subtree_json(&ConfigPath::root());

    let err = store.load(&b"{ not json"[..], Format::Json).unwrap_err();
    assert_eq!(err.kind(), ember_core::ErrorKind::MalformedConfig);
    assert_eq!(store.subtree_json(&ConfigPath::root()), before);
}

#[test]
fn wrong_version_is_rejected() {
    let store = ConfigStore::new();
    let doc = r#"{"version": 99, "config": {}, "meta": {"t": 0, "c": {}}}"#;
    let err = store.load(doc.as_bytes(), Format::Json).unwrap_err();
    assert_eq!(err.kind(), ember_core::ErrorKind::MalformedConfig);
}

#[test]
fn scalar_root_is_rejected() {
    let store = ConfigStore::new();
    let doc = r#"{"version": 1, "config": 42, "meta": 7}"#;
    let err = store.load(doc.as_bytes(), Format::Json).unwrap_err();
    assert_eq!(err.kind(), ember_core::ErrorKind::MalformedConfig);
}

#[test]
fn format_detection_by_extension() {
    use std::path::Path;
    assert_eq!(Format::from_path(Path::new("config.json")), Some(Format::Json));
    assert_eq!(Format::from_path(Path::new("config.yaml")), Some(Format::Yaml));
    assert_eq!(Format::from_path(Path::new("config.yml")), Some(Format::Yaml));
    assert_eq!(Format::from_path(Path::new("config.toml")), None);
    assert_eq!(Format::from_path(Path::new("config")), None);
}

#[test]
fn dump_and_load_files_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("config.json");

    let store = populated_store();
    dump_file(&store, &file).unwrap();
    assert!(file.exists());
    assert!(!dir.path().join("config.tmp").exists());

    let restored = ConfigStore::new();
    assert!(load_file(&restored, &file).unwrap());
    assert_eq!(restored.subtree_json(&ConfigPath::root()), store.subtree_json(&ConfigPath::root()));

    // Missing file is not an error.
    assert!(!load_file(&restored, &dir.path().join("absent.json")).unwrap());
}

#[test]
fn lists_survive_snapshots() {
    let store = ConfigStore::new();
    store
        .set_leaf(
            &path("svc/hosts"),
            ConfigValue::List(vec![ConfigValue::from("a"), ConfigValue::from("b")]),
            10,
        )
        .unwrap();

    let mut buffer = Vec::new();
    store.dump(&mut buffer, Format::Json).unwrap();
    let restored = ConfigStore::new();
    restored.load(buffer.as_slice(), Format::Json).unwrap();

    assert_eq!(
        restored.get_value(&path("svc/hosts")),
        Some(ConfigValue::List(vec![ConfigValue::from("a"), ConfigValue::from("b")])),
    );
}
