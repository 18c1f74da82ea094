//! Path-addressed patches over JSON trees.
//!
//! A patch is one `{op, path, value?}` description of a change. Diffing two
//! trees yields a *pair* of batches: the forward batch transforms the old
//! tree into the new one, the inverse batch transforms the new tree back
//! into the old one, bit-for-bit. Batches apply strictly in array order.
//!
//! The serialized shape is the persisted/transmitted wire format shared by
//! every client on a document, so it must stay stable: `op` is a lowercase
//! string, `path` is an array of strings (array indices as decimal
//! strings), `value` is omitted for removes.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Patch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

/// One step of a patch path: an object key or an array index.
///
/// On the wire both forms are strings; a numeric segment addressing an
/// array is interpreted as an index when applied.
#[derive(Debug, Clone)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    pub fn key(k: impl Into<String>) -> Self {
        PathSegment::Key(k.into())
    }

    /// The segment as an array index, if it is one (or spells one).
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(k) => k.parse().ok(),
        }
    }

    /// The segment as an object key.
    pub fn as_key(&self) -> String {
        match self {
            PathSegment::Key(k) => k.clone(),
            PathSegment::Index(i) => i.to_string(),
        }
    }

    /// The segment as a borrowed string key, when it is not an index.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PathSegment::Key(k) => Some(k.as_str()),
            PathSegment::Index(_) => None,
        }
    }
}

// `Key("3")` and `Index(3)` address the same slot, and patches that went
// through the wire come back as keys; comparisons must not care.
impl PartialEq for PathSegment {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PathSegment::Key(a), PathSegment::Key(b)) => a == b,
            (PathSegment::Index(a), PathSegment::Index(b)) => a == b,
            (PathSegment::Key(k), PathSegment::Index(i))
            | (PathSegment::Index(i), PathSegment::Key(k)) => k.parse::<usize>().ok() == Some(*i),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        PathSegment::Key(s.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        PathSegment::Key(s)
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        PathSegment::Index(i)
    }
}

impl Serialize for PathSegment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathSegment::Key(k) => serializer.serialize_str(k),
            PathSegment::Index(i) => serializer.serialize_str(&i.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for PathSegment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SegmentVisitor;

        impl<'de> Visitor<'de> for SegmentVisitor {
            type Value = PathSegment;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a path segment string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PathSegment, E> {
                Ok(PathSegment::Key(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PathSegment, E> {
                Ok(PathSegment::Index(v as usize))
            }
        }

        deserializer.deserialize_any(SegmentVisitor)
    }
}

/// Render a path as `/a/b/0`. The empty path (the tree root) renders as `/`.
pub fn format_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for seg in path {
        out.push('/');
        out.push_str(&seg.as_key());
    }
    out
}

/// Whether `prefix` addresses the same node as `path` or an ancestor of it.
pub fn is_prefix_of(prefix: &[PathSegment], path: &[PathSegment]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path).all(|(a, b)| a == b)
}

/// A single change to a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Patch {
    pub fn add(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    pub fn remove(path: Vec<PathSegment>) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    pub fn replace(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            value: Some(value),
        }
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            PatchOp::Add => "add",
            PatchOp::Remove => "remove",
            PatchOp::Replace => "replace",
        };
        write!(f, "{} {}", op, format_path(&self.path))
    }
}

/// A forward batch and its paired inverse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchPair {
    pub forward: Vec<Patch>,
    pub inverse: Vec<Patch>,
}

impl PatchPair {
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("index out of bounds at {0}")]
    IndexOutOfBounds(String),

    #[error("cannot descend into a scalar at {0}")]
    NotAContainer(String),

    #[error("expected an array index at {0}")]
    ExpectedIndex(String),

    #[error("patch at {0} is missing its value")]
    MissingValue(String),

    #[error("cannot remove the tree root")]
    RemoveRoot,
}

/// Diff two trees into a forward/inverse patch pair.
///
/// Object diffs recurse per key; array diffs recurse per index when the
/// lengths match, handle pure tail growth/shrink positionally, and fall
/// back to a whole-array replace otherwise.
pub fn diff(old: &Value, new: &Value) -> PatchPair {
    let mut forward = Vec::new();
    let mut inverse = Vec::new();
    let mut path = Vec::new();
    diff_into(old, new, &mut path, &mut forward, &mut inverse);
    // Complements were collected 1:1 with forward patches; an inverse batch
    // must undo them last-first.
    inverse.reverse();
    PatchPair { forward, inverse }
}

fn diff_into(
    old: &Value,
    new: &Value,
    path: &mut Vec<PathSegment>,
    forward: &mut Vec<Patch>,
    inverse: &mut Vec<Patch>,
) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_val) in old_map {
                if !new_map.contains_key(key) {
                    path.push(PathSegment::Key(key.clone()));
                    forward.push(Patch::remove(path.clone()));
                    inverse.push(Patch::add(path.clone(), old_val.clone()));
                    path.pop();
                }
            }
            for (key, new_val) in new_map {
                path.push(PathSegment::Key(key.clone()));
                match old_map.get(key) {
                    None => {
                        forward.push(Patch::add(path.clone(), new_val.clone()));
                        inverse.push(Patch::remove(path.clone()));
                    }
                    Some(old_val) => diff_into(old_val, new_val, path, forward, inverse),
                }
                path.pop();
            }
        }
        (Value::Array(old_arr), Value::Array(new_arr)) => {
            diff_arrays(old_arr, new_arr, path, forward, inverse);
        }
        _ => {
            forward.push(Patch::replace(path.clone(), new.clone()));
            inverse.push(Patch::replace(path.clone(), old.clone()));
        }
    }
}

fn diff_arrays(
    old: &[Value],
    new: &[Value],
    path: &mut Vec<PathSegment>,
    forward: &mut Vec<Patch>,
    inverse: &mut Vec<Patch>,
) {
    if old.len() == new.len() {
        for (i, (old_val, new_val)) in old.iter().zip(new).enumerate() {
            path.push(PathSegment::Index(i));
            diff_into(old_val, new_val, path, forward, inverse);
            path.pop();
        }
    } else if new.len() > old.len() && old == &new[..old.len()] {
        // Pure tail append.
        for (i, new_val) in new.iter().enumerate().skip(old.len()) {
            path.push(PathSegment::Index(i));
            forward.push(Patch::add(path.clone(), new_val.clone()));
            inverse.push(Patch::remove(path.clone()));
            path.pop();
        }
    } else if old.len() > new.len() && new == &old[..new.len()] {
        // Pure tail truncation; remove highest index first so earlier
        // removes don't shift the later ones.
        for i in (new.len()..old.len()).rev() {
            path.push(PathSegment::Index(i));
            forward.push(Patch::remove(path.clone()));
            inverse.push(Patch::add(path.clone(), old[i].clone()));
            path.pop();
        }
    } else {
        forward.push(Patch::replace(path.clone(), Value::Array(new.to_vec())));
        inverse.push(Patch::replace(path.clone(), Value::Array(old.to_vec())));
    }
}

/// Apply a batch in array order. The first failing patch aborts with the
/// target left as the earlier patches produced it; callers that need
/// atomicity apply against a scratch clone.
pub fn apply(target: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_one(target, patch)?;
    }
    Ok(())
}

fn apply_one(target: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let rendered = || format_path(&patch.path);

    if patch.path.is_empty() {
        return match patch.op {
            PatchOp::Add | PatchOp::Replace => {
                let value = patch
                    .value
                    .clone()
                    .ok_or_else(|| PatchError::MissingValue(rendered()))?;
                *target = value;
                Ok(())
            }
            PatchOp::Remove => Err(PatchError::RemoveRoot),
        };
    }

    let (parent_path, last) = patch.path.split_at(patch.path.len() - 1);
    let parent = resolve_mut(target, parent_path)
        .ok_or_else(|| PatchError::PathNotFound(format_path(parent_path)))?;
    let last = &last[0];

    match parent {
        Value::Object(map) => {
            let key = last.as_key();
            match patch.op {
                // Lenient like a JSON object insert: adding over an
                // existing key overwrites it.
                PatchOp::Add => {
                    let value = patch
                        .value
                        .clone()
                        .ok_or_else(|| PatchError::MissingValue(rendered()))?;
                    map.insert(key, value);
                }
                PatchOp::Replace => {
                    let value = patch
                        .value
                        .clone()
                        .ok_or_else(|| PatchError::MissingValue(rendered()))?;
                    let slot = map
                        .get_mut(&key)
                        .ok_or_else(|| PatchError::PathNotFound(rendered()))?;
                    *slot = value;
                }
                PatchOp::Remove => {
                    map.remove(&key)
                        .ok_or_else(|| PatchError::PathNotFound(rendered()))?;
                }
            }
            Ok(())
        }
        Value::Array(arr) => {
            let index = last
                .as_index()
                .ok_or_else(|| PatchError::ExpectedIndex(rendered()))?;
            match patch.op {
                PatchOp::Add => {
                    if index > arr.len() {
                        return Err(PatchError::IndexOutOfBounds(rendered()));
                    }
                    let value = patch
                        .value
                        .clone()
                        .ok_or_else(|| PatchError::MissingValue(rendered()))?;
                    arr.insert(index, value);
                }
                PatchOp::Replace => {
                    let value = patch
                        .value
                        .clone()
                        .ok_or_else(|| PatchError::MissingValue(rendered()))?;
                    let slot = arr
                        .get_mut(index)
                        .ok_or_else(|| PatchError::IndexOutOfBounds(rendered()))?;
                    *slot = value;
                }
                PatchOp::Remove => {
                    if index >= arr.len() {
                        return Err(PatchError::IndexOutOfBounds(rendered()));
                    }
                    arr.remove(index);
                }
            }
            Ok(())
        }
        _ => Err(PatchError::NotAContainer(format_path(parent_path))),
    }
}

/// Borrow the node a path addresses, if it exists.
pub fn resolve<'a>(value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    let mut current = value;
    for seg in path {
        current = match current {
            Value::Object(map) => map.get(&seg.as_key())?,
            Value::Array(arr) => arr.get(seg.as_index()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn resolve_mut<'a>(value: &'a mut Value, path: &[PathSegment]) -> Option<&'a mut Value> {
    let mut current = value;
    for seg in path {
        current = match current {
            Value::Object(map) => map.get_mut(&seg.as_key())?,
            Value::Array(arr) => arr.get_mut(seg.as_index()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Recursively merge `overlay` into `target`: objects merge per key,
/// anything else overwrites.
pub fn merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                match target_map.get_mut(key) {
                    Some(slot) => merge(slot, overlay_val),
                    None => {
                        target_map.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (slot, overlay_val) => *slot = overlay_val.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(old: Value, new: Value) {
        let pair = diff(&old, &new);

        let mut tree = old.clone();
        apply(&mut tree, &pair.forward).unwrap();
        assert_eq!(tree, new, "forward batch must produce the new tree");

        apply(&mut tree, &pair.inverse).unwrap();
        assert_eq!(tree, old, "inverse batch must restore the old tree");
    }

    #[test]
    fn test_identical_trees_produce_no_patches() {
        let v = json!({"a": 1, "b": [1, 2]});
        assert!(diff(&v, &v).is_empty());
    }

    #[test]
    fn test_scalar_replace_roundtrip() {
        roundtrip(json!({"title": "old"}), json!({"title": "new"}));
    }

    #[test]
    fn test_key_add_and_remove_roundtrip() {
        roundtrip(
            json!({"keep": 1, "drop": {"x": 2}}),
            json!({"keep": 1, "fresh": [3]}),
        );
    }

    #[test]
    fn test_nested_object_roundtrip() {
        roundtrip(
            json!({"el": {"data": {"bounds": {"x": 0.0, "y": 0.0}}}}),
            json!({"el": {"data": {"bounds": {"x": 5.0, "y": 0.0}}}}),
        );
    }

    #[test]
    fn test_array_same_length_diffs_per_index() {
        let pair = diff(&json!([1, 2, 3]), &json!([1, 9, 3]));
        assert_eq!(pair.forward.len(), 1);
        assert_eq!(pair.forward[0].path, vec![PathSegment::Index(1)]);
        roundtrip(json!([1, 2, 3]), json!([1, 9, 3]));
    }

    #[test]
    fn test_array_tail_append_roundtrip() {
        roundtrip(json!(["a"]), json!(["a", "b", "c"]));
    }

    #[test]
    fn test_array_tail_truncate_roundtrip() {
        roundtrip(json!(["a", "b", "c"]), json!(["a"]));
    }

    #[test]
    fn test_array_reorder_falls_back_to_replace() {
        let pair = diff(&json!([1, 2]), &json!([2, 1, 3]));
        assert_eq!(pair.forward.len(), 1);
        assert_eq!(pair.forward[0].op, PatchOp::Replace);
        roundtrip(json!([1, 2]), json!([2, 1, 3]));
    }

    #[test]
    fn test_root_replace_roundtrip() {
        roundtrip(json!({"a": 1}), json!([1, 2, 3]));
    }

    #[test]
    fn test_apply_reports_missing_path() {
        let mut tree = json!({"a": {}});
        let err = apply(
            &mut tree,
            &[Patch::replace(
                vec!["a".into(), "missing".into()],
                json!(1),
            )],
        )
        .unwrap_err();
        assert_eq!(err, PatchError::PathNotFound("/a/missing".to_string()));
    }

    #[test]
    fn test_apply_rejects_root_remove() {
        let mut tree = json!({});
        let err = apply(&mut tree, &[Patch::remove(vec![])]).unwrap_err();
        assert_eq!(err, PatchError::RemoveRoot);
    }

    #[test]
    fn test_wire_format_is_stable() {
        let patch = Patch::add(
            vec!["elements".into(), "e1".into(), "points".into(), 0usize.into()],
            json!({"x": 1.0}),
        );
        let wire = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            wire,
            json!({"op": "add", "path": ["elements", "e1", "points", "0"], "value": {"x": 1.0}})
        );

        let back: Patch = serde_json::from_value(wire).unwrap();
        assert_eq!(back.op, PatchOp::Add);
        // A numeric segment comes back as a key but still addresses the index.
        assert_eq!(back.path[3], PathSegment::Index(0));
    }

    #[test]
    fn test_remove_omits_value_on_the_wire() {
        let wire = serde_json::to_value(Patch::remove(vec!["a".into()])).unwrap();
        assert_eq!(wire, json!({"op": "remove", "path": ["a"]}));
    }

    #[test]
    fn test_prefix_containment() {
        let parent = vec![PathSegment::key("elements"), PathSegment::key("e1")];
        let child = vec![
            PathSegment::key("elements"),
            PathSegment::key("e1"),
            PathSegment::key("data"),
        ];
        assert!(is_prefix_of(&parent, &child));
        assert!(is_prefix_of(&parent, &parent));
        assert!(!is_prefix_of(&child, &parent));
    }

    #[test]
    fn test_merge_recurses_objects_and_overwrites_leaves() {
        let mut target = json!({"a": {"x": 1, "y": 2}, "b": 3});
        merge(&mut target, &json!({"a": {"y": 9}, "c": 4}));
        assert_eq!(target, json!({"a": {"x": 1, "y": 9}, "b": 3, "c": 4}));
    }
}
