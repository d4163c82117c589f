// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;
use yare::parameterized;

#[parameterized(
    null = { json!(null) },
    boolean = { json!(true) },
    int = { json!(42) },
    float = { json!(2.5) },
    string = { json!("hello") },
    list = { json!([1, "two", null]) },
    nested_list = { json!([[1, 2], [3]]) },
)]
fn json_round_trips(value: serde_json::Value) {
    let leaf = ConfigValue::from_json(&value).unwrap();
    assert_eq!(leaf.to_json(), value);
}

#[test]
fn object_is_not_a_leaf() {
    assert!(ConfigValue::from_json(&json!({"k": 1})).is_none());
}

#[test]
fn list_containing_object_is_not_a_leaf() {
    assert!(ConfigValue::from_json(&json!([{"k": 1}])).is_none());
}

#[test]
fn large_integers_stay_integers() {
    let leaf = ConfigValue::from_json(&json!(i64::MAX)).unwrap();
    assert_eq!(leaf.as_int(), Some(i64::MAX));
}

#[test]
fn accessors() {
    assert_eq!(ConfigValue::from("x").as_str(), Some("x"));
    assert_eq!(ConfigValue::from(7i64).as_int(), Some(7));
    assert_eq!(ConfigValue::from(true).as_bool(), Some(true));
    assert_eq!(ConfigValue::Null.as_str(), None);
}

#[test]
fn untagged_serde_round_trip() {
    let leaf = ConfigValue::List(vec![ConfigValue::Int(1), ConfigValue::from("a")]);
    let text = serde_json::to_string(&leaf).unwrap();
    assert_eq!(text, "[1,\"a\"]");
    let back: ConfigValue = serde_json::from_str(&text).unwrap();
    assert_eq!(back, leaf);
}
