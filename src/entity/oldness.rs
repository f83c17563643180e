//! Oldness recalculation for duplicate same-adapter entities.
//!
//! When one merged entity holds several adapter entities from the same
//! `plugin_name` (duplicates of the same adapter), only the one with the
//! newest `last_seen` is current; the rest are marked `_old`. Any operation
//! that changes a merged entity's member composition must re-derive this or
//! the invariant silently rots.

use super::{AdapterEntity, EntityType, OLD_FIELD};
use std::collections::HashMap;

/// Recalculate `_old` flags in place across the members of a single merged
/// entity.
///
/// Members are grouped by `plugin_name`; within a group where every member
/// carries a `last_seen`, exactly the maximum gets `_old = false` and all
/// siblings `_old = true`. Groups missing `last_seen` on any member cannot
/// be ordered and are left untouched.
pub fn recalculate_oldness(adapters: &mut [AdapterEntity], entity_type: EntityType) {
    if !entity_type.is_old_calculated() {
        return;
    }

    let mut by_plugin_name: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, adapter) in adapters.iter().enumerate() {
        by_plugin_name
            .entry(adapter.plugin_name.clone())
            .or_default()
            .push(idx);
    }

    for group in by_plugin_name.values() {
        if !group.iter().all(|&i| adapters[i].last_seen().is_some()) {
            continue;
        }

        let newest = group
            .iter()
            .copied()
            .max_by_key(|&i| adapters[i].last_seen())
            .expect("group is non-empty");

        for &i in group {
            adapters[i]
                .data
                .insert(OLD_FIELD.to_string(), serde_json::Value::Bool(i != newest));
        }
    }
}
