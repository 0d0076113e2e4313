//! Dotted-path addressing and deep merge over JSON documents.
//!
//! Responsibilities:
//! - Resolve dotted keys (`"window.width"`) against nested JSON objects.
//! - Create intermediate objects on write.
//! - Deep-merge environment overlays onto base documents.
//!
//! Does NOT handle:
//! - File I/O or format parsing (see `store`).
//! - Schema validation (see `schema`).
//!
//! Invariants:
//! - Merge precedence: overlay wins at every leaf; objects merge key-wise;
//!   non-object values replace wholesale.
//! - `set_path` replaces a non-object intermediate with an object rather
//!   than failing, matching write-through semantics for nested keys.

use serde_json::{Map, Value};

/// Looks up a dotted key in a JSON object, returning `None` when any
/// segment is missing or a non-final segment is not an object.
pub fn get_path<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in dotted.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Sets a dotted key in a JSON object, creating intermediate objects as
/// needed. Returns the previous value at the path, if any.
pub fn set_path(root: &mut Map<String, Value>, dotted: &str, value: Value) -> Option<Value> {
    let mut segments = dotted.split('.').peekable();
    let mut current = root;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            return current.insert(segment.to_string(), value);
        }

        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("entry forced to object");
    }

    None
}

/// Removes a dotted key, returning the removed value if it existed.
/// Intermediate objects are left in place even when emptied.
pub fn remove_path(root: &mut Map<String, Value>, dotted: &str) -> Option<Value> {
    let mut segments = dotted.split('.').peekable();
    let mut current = root;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            return current.remove(segment);
        }
        current = current.get_mut(segment)?.as_object_mut()?;
    }

    None
}

/// Deep-merges `overlay` onto `base`.
///
/// Object values merge recursively; everything else in the overlay replaces
/// the base value wholesale. Keys absent from the overlay keep their base
/// value.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, overlay_value) in overlay {
        match (base.get_mut(&key), overlay_value) {
            (Some(Value::Object(base_child)), Value::Object(overlay_child)) => {
                deep_merge(base_child, overlay_child);
            }
            (_, overlay_value) => {
                base.insert(key, overlay_value);
            }
        }
    }
}
