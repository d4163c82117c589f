// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Short unique identifiers.

const ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generate a deployment id like `dpl-k8x2m4q7v9w1`.
pub fn deployment_id() -> String {
    format!("dpl-{}", nanoid::nanoid!(12, &ALPHABET))
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
