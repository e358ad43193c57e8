//! Flattening of nested JSON into single-level path → scalar maps.
//!
//! Object keys and array indices share one separator, so
//! `{"a": {"b": 1, "c": [2, 3]}}` flattens to `a.b`, `a.c.0` and `a.c.1`.
//! Whether a segment came from an object or an array is not recoverable
//! from the flat form.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const PATH_SEPARATOR: char = '.';

/// Single-level map from a joined path to a scalar (including `null`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FlatRecord {
    entries: BTreeMap<String, Value>,
}

/// Outcome of looking a path up in a [`FlatRecord`].
#[derive(Debug, PartialEq)]
pub enum Resolved<'a> {
    Missing,
    Scalar(&'a Value),
    /// The path names an interior node; the leaves below it, rebuilt.
    Subtree(Value),
}

impl FlatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Insert unless the path is already present. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, path: String, value: Value) -> bool {
        match self.entries.entry(path) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Insert, replacing any existing value at the path.
    pub fn insert(&mut self, path: String, value: Value) {
        self.entries.insert(path, value);
    }

    /// Look a path up. A path that is a strict prefix of stored paths resolves
    /// to the subtree rebuilt from those leaves.
    pub fn resolve(&self, path: &str) -> Resolved<'_> {
        if let Some(value) = self.entries.get(path) {
            return Resolved::Scalar(value);
        }

        let prefix = format!("{path}{PATH_SEPARATOR}");
        let mut root = Value::Object(Map::new());
        let mut found = false;
        for (key, value) in self.entries.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            found = true;
            insert_nested(&mut root, rest, value.clone());
        }

        if found {
            Resolved::Subtree(restore_arrays(root))
        } else {
            Resolved::Missing
        }
    }
}

impl FromIterator<(String, Value)> for FlatRecord {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Flatten `value` with every path prefixed by `prefix` (no prefix when empty).
pub fn flatten(value: &Value, prefix: &str) -> FlatRecord {
    let mut out = FlatRecord::new();
    flatten_into(value, prefix, &mut out);
    out
}

fn flatten_into(value: &Value, path: &str, out: &mut FlatRecord) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, &join(path, key), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(child, &join(path, &index.to_string()), out);
            }
        }
        scalar => {
            // Only reachable when a key itself contains the separator.
            if !out.insert_if_absent(path.to_string(), scalar.clone()) {
                log::debug!("flatten: duplicate path '{}' kept its first value", path);
            }
        }
    }
}

pub(crate) fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}{PATH_SEPARATOR}{segment}")
    }
}

fn insert_nested(root: &mut Value, path: &str, value: Value) {
    let mut node = root;
    let mut segments = path.split(PATH_SEPARATOR).peekable();
    while let Some(segment) = segments.next() {
        let Value::Object(map) = node else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Objects whose keys are exactly `0..n` become arrays again.
fn restore_arrays(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let contiguous = !map.is_empty()
                && (0..map.len()).all(|index| map.contains_key(&index.to_string()));
            if contiguous {
                let mut items: Vec<(usize, Value)> = map
                    .into_iter()
                    .filter_map(|(key, child)| key.parse().ok().map(|index| (index, child)))
                    .collect();
                items.sort_by_key(|(index, _)| *index);
                Value::Array(items.into_iter().map(|(_, child)| restore_arrays(child)).collect())
            } else {
                Value::Object(
                    map.into_iter()
                        .map(|(key, child)| (key, restore_arrays(child)))
                        .collect(),
                )
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn count_leaves(value: &Value) -> usize {
        match value {
            Value::Object(map) => map.values().map(count_leaves).sum(),
            Value::Array(items) => items.iter().map(count_leaves).sum(),
            _ => 1,
        }
    }

    #[test]
    fn flattens_objects_and_arrays_with_one_separator() {
        let flat = flatten(&json!({"a": {"b": 1, "c": [2, 3]}}), "");
        let expected: FlatRecord = [
            ("a.b".to_string(), json!(1)),
            ("a.c.0".to_string(), json!(2)),
            ("a.c.1".to_string(), json!(3)),
        ]
        .into_iter()
        .collect();
        assert_eq!(flat, expected);
    }

    #[test]
    fn flattening_twice_is_identical_and_preserves_leaf_count() {
        let value = json!({
            "id": 10,
            "status": null,
            "refs": [{"id": 1, "tags": ["x", "y"]}, {"id": 2, "tags": []}],
            "customer": {"name": "Acme", "active": true}
        });
        let first = flatten(&value, "");
        let second = flatten(&value, "");
        assert_eq!(first, second);
        assert_eq!(first.len(), count_leaves(&value));
        assert_eq!(first.get("status"), Some(&Value::Null));
        assert_eq!(first.get("refs.0.tags.1"), Some(&json!("y")));
    }

    #[test]
    fn empty_containers_contribute_no_leaves() {
        let flat = flatten(&json!({"a": {}, "b": [], "c": 1}), "");
        assert_eq!(flat.len(), 1);
        assert!(flat.contains("c"));
    }

    #[test]
    fn prefix_is_applied_to_every_path() {
        let flat = flatten(&json!({"id": 1}), "customer");
        assert_eq!(flat.get("customer.id"), Some(&json!(1)));
    }

    #[test]
    fn scalar_root_lands_at_the_prefix() {
        let flat = flatten(&json!("hello"), "note");
        assert_eq!(flat.get("note"), Some(&json!("hello")));
    }

    #[test]
    fn resolve_distinguishes_scalar_subtree_and_missing() {
        let flat = flatten(&json!({"a": {"b": 1, "c": [2, 3]}, "ab": 4}), "");
        assert_eq!(flat.resolve("a.b"), Resolved::Scalar(&json!(1)));
        assert_eq!(flat.resolve("a.c"), Resolved::Subtree(json!([2, 3])));
        assert_eq!(flat.resolve("a"), Resolved::Subtree(json!({"b": 1, "c": [2, 3]})));
        assert_eq!(flat.resolve("a.d"), Resolved::Missing);
    }

    #[test]
    fn non_contiguous_indices_stay_an_object() {
        let flat: FlatRecord = [
            ("items.0".to_string(), json!("a")),
            ("items.2".to_string(), json!("c")),
        ]
        .into_iter()
        .collect();
        assert_eq!(flat.resolve("items"), Resolved::Subtree(json!({"0": "a", "2": "c"})));
    }

    #[test]
    fn insert_if_absent_keeps_existing_value() {
        let mut flat = flatten(&json!({"id": 10}), "");
        assert!(!flat.insert_if_absent("id".into(), json!(1)));
        assert!(flat.insert_if_absent("name".into(), json!("Acme")));
        assert_eq!(flat.get("id"), Some(&json!(10)));
    }
}
