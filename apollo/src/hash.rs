// Copyright 2025 the Apollo Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Order-sensitive hash combination.
//!
//! Cache keys for pipelines and resource-binding sets are built by folding
//! object identities in a fixed traversal order (outputs in primvar order,
//! then inputs in resource order). Order matters: swapping two buffers must
//! produce a different key, and swapping them back must reproduce the
//! original one.

use std::hash::{Hash, Hasher};

/// Hash a single value.
pub fn of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Fold `value` into `seed`.
pub fn combine<T: Hash + ?Sized>(seed: u64, value: &T) -> u64 {
    let h = of(value);
    seed ^ h
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}
