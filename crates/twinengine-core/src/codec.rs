//! Twin tree codec
//!
//! Pure functions over in-memory twin trees. The service decorates twin
//! payloads with protocol metadata (the `$version` marker, the `__t`
//! component marker, other `$`-prefixed reserved fields); nothing of that may
//! reach user handlers. `strip_metadata` removes it, `normalize` additionally
//! unwraps acknowledgement envelopes down to their inner value so callers see
//! plain state.

use serde_json::{Map, Value};

use crate::ack::is_ack;
use crate::types::{COMPONENT_MARKER_KEY, RESERVED_PREFIX, VERSION_KEY};

/// Check whether a key is protocol metadata rather than user state
fn is_metadata_key(key: &str) -> bool {
    key == VERSION_KEY || key == COMPONENT_MARKER_KEY || key.starts_with(RESERVED_PREFIX)
}

/// Strip protocol metadata from a twin tree
///
/// Returns the remaining `(key, value)` pairs in the tree's own order,
/// removing the version key, the component marker, and any `$`-prefixed
/// reserved field. Non-object input yields no pairs. Idempotent: stripping an
/// already-stripped tree yields the same pairs.
pub fn strip_metadata(tree: &Value) -> Vec<(String, Value)> {
    match tree.as_object() {
        Some(map) => map
            .iter()
            .filter(|(key, _)| !is_metadata_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        None => Vec::new(),
    }
}

/// Normalize a component subtree for user consumption
///
/// Strips protocol metadata and unwraps any acknowledgement-shaped value to
/// its inner `value` field. The unwrap applies one level deep only, to the
/// immediate properties of the component; an ack nested inside an unwrapped
/// value is left as-is. Non-object input is returned unchanged.
pub fn normalize(component_tree: &Value) -> Value {
    if !component_tree.is_object() {
        return component_tree.clone();
    }

    let mut out = Map::new();
    for (key, value) in strip_metadata(component_tree) {
        if is_ack(&value) {
            // is_ack guarantees the field is present
            out.insert(key, value.get("value").cloned().unwrap_or(Value::Null));
        } else {
            out.insert(key, value);
        }
    }
    Value::Object(out)
}
