//! Helpers over nested JSON objects addressed by dotted paths.
//!
//! Keys containing `.` cannot be addressed and are not supported.

use std::collections::BTreeMap;

use derive_more::Display;
use serde_json::Map;
use serde_json::Value;

/// Two values at the same path cannot be merged.
#[derive(Debug, Display, PartialEq, Eq)]
#[display("cannot merge object with non-object value at '{path}'")]
pub struct MergeConflict {
    pub path: String,
}

impl std::error::Error for MergeConflict {}

/// Merges `b` into a copy of `a`.
///
/// Disjoint keys are unioned, objects present on both sides are merged
/// recursively, and when both sides hold a plain value `b` wins. An object
/// on one side facing a non-object on the other is a conflict.
pub fn merge_dict_recursive(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
) -> Result<Map<String, Value>, MergeConflict> {
    merge_at(a, b, "")
}

fn merge_at(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    prefix: &str,
) -> Result<Map<String, Value>, MergeConflict> {
    let mut merged = a.clone();
    for (key, right) in b {
        let path = join(prefix, key);
        let value = match (merged.get(key), right) {
            (None, _) => right.clone(),
            (Some(Value::Object(l)), Value::Object(r)) => Value::Object(merge_at(l, r, &path)?),
            (Some(Value::Object(_)), _) | (Some(_), Value::Object(_)) => {
                return Err(MergeConflict { path });
            }
            (Some(_), _) => right.clone(),
        };
        merged.insert(key.clone(), value);
    }
    Ok(merged)
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Flattens nested objects into `dotted.path -> leaf`. Arrays and empty
/// objects are kept as leaves.
pub fn flatten_dictionary(value: &Value) -> BTreeMap<String, Value> {
    let mut flat = BTreeMap::new();
    if let Value::Object(map) = value {
        flatten_into(map, "", &mut flat);
    }
    flat
}

fn flatten_into(map: &Map<String, Value>, prefix: &str, out: &mut BTreeMap<String, Value>) {
    for (key, value) in map {
        let path = join(prefix, key);
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(inner, &path, out),
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
}

/// Inverse of [`flatten_dictionary`].
pub fn unflatten_dictionary(flat: &BTreeMap<String, Value>) -> Value {
    let mut root = Value::Object(Map::new());
    for (path, value) in flat {
        set_path(&mut root, path, value.clone());
    }
    root
}

/// Value at a dotted path, if every segment resolves.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.')
        .try_fold(root, |current, segment| current.as_object()?.get(segment))
}

/// Sets the value at a dotted path, creating (or replacing non-object)
/// intermediate nodes with objects. An empty path replaces the root.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    if path.is_empty() {
        *root = value;
        return;
    }

    let mut segments = path.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
