//! JSON patch engine (C5) — RFC 7396 merge patch and RFC 6902 JSON Patch.
//! Spec §4.5.

use crate::error::{EngineError, Result};
use serde::Deserialize;
use serde_json::Value;

/// RFC 7396: null in the patch deletes the key, object recurses,
/// scalar/array replaces wholesale.
pub fn merge_patch(target: &Value, patch: &Value) -> Value {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            let mut out = target_map.clone();
            for (k, v) in patch_map {
                if v.is_null() {
                    out.remove(k);
                } else {
                    let merged = merge_patch(out.get(k).unwrap_or(&Value::Null), v);
                    out.insert(k.clone(), merged);
                }
            }
            Value::Object(out)
        }
        (_, patch) => patch.clone(),
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub from: Option<String>,
}

fn split_pointer(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if !path.starts_with('/') {
        return Err(EngineError::client(400, "PATCH body request malformed"));
    }
    Ok(path[1..]
        .split('/')
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn navigate<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in segments {
        cur = match cur {
            Value::Object(map) => map.get_mut(seg)?,
            Value::Array(arr) => {
                let idx: usize = seg.parse().ok()?;
                arr.get_mut(idx)?
            }
            _ => return None,
        };
    }
    Some(cur)
}

fn navigate_parent<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    if segments.is_empty() {
        return None;
    }
    navigate(root, &segments[..segments.len() - 1])
}

fn set_at(root: &mut Value, segments: &[String], value: Value) -> Result<()> {
    if segments.is_empty() {
        *root = value;
        return Ok(());
    }
    let last = segments.last().unwrap().clone();
    let parent = if segments.len() == 1 {
        root
    } else {
        navigate_parent(root, segments).ok_or_else(malformed)?
    };
    match parent {
        Value::Object(map) => {
            map.insert(last, value);
            Ok(())
        }
        Value::Array(arr) => {
            if last == "-" {
                arr.push(value);
            } else {
                let idx: usize = last.parse().map_err(|_| malformed())?;
                if idx > arr.len() {
                    return Err(malformed());
                }
                arr.insert(idx, value);
            }
            Ok(())
        }
        _ => Err(malformed()),
    }
}

fn remove_at(root: &mut Value, segments: &[String]) -> Result<Value> {
    if segments.is_empty() {
        return Err(malformed());
    }
    let last = segments.last().unwrap().clone();
    let parent = if segments.len() == 1 {
        root
    } else {
        navigate_parent(root, segments).ok_or_else(malformed)?
    };
    match parent {
        Value::Object(map) => map.remove(&last).ok_or_else(malformed),
        Value::Array(arr) => {
            let idx: usize = last.parse().map_err(|_| malformed())?;
            if idx >= arr.len() {
                return Err(malformed());
            }
            Ok(arr.remove(idx))
        }
        _ => Err(malformed()),
    }
}

fn get_at(root: &Value, segments: &[String]) -> Result<Value> {
    let mut cur = root.clone();
    for seg in segments {
        cur = match &cur {
            Value::Object(map) => map.get(seg).cloned().ok_or_else(malformed)?,
            Value::Array(arr) => {
                let idx: usize = seg.parse().map_err(|_| malformed())?;
                arr.get(idx).cloned().ok_or_else(malformed)?
            }
            _ => return Err(malformed()),
        };
    }
    Ok(cur)
}

fn malformed() -> EngineError {
    EngineError::client(400, "PATCH body request malformed")
}

/// Applies a sequence of RFC 6902 operations in order. Each invalid
/// operation raises `CLIENT_ERROR` and leaves `target` unmodified, because
/// we operate on a clone and only commit on full success (spec §8
/// "JSON-Patch soundness").
pub fn apply_json_patch(target: &Value, ops: &[PatchOp]) -> Result<Value> {
    let mut working = target.clone();
    for op in ops {
        let segments = split_pointer(&op.path)?;
        match op.op.as_str() {
            "add" => {
                set_at(&mut working, &segments, op.value.clone())?;
            }
            "remove" => {
                remove_at(&mut working, &segments)?;
            }
            "replace" => {
                if navigate(&mut working, &segments).is_none() {
                    return Err(malformed());
                }
                set_replace(&mut working, &segments, op.value.clone())?;
            }
            "move" => {
                let from = op
                    .from
                    .as_deref()
                    .ok_or_else(malformed)?;
                let from_segments = split_pointer(from)?;
                let value = remove_at(&mut working, &from_segments)?;
                set_at(&mut working, &segments, value)?;
            }
            "copy" => {
                let from = op
                    .from
                    .as_deref()
                    .ok_or_else(malformed)?;
                let from_segments = split_pointer(from)?;
                let value = get_at(&working, &from_segments)?;
                set_at(&mut working, &segments, value)?;
            }
            other => {
                return Err(EngineError::client(
                    400,
                    format!("PATCH operation not supported: {other}"),
                ));
            }
        }
    }
    Ok(working)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_removes_null_fields_and_recurses() {
        let target = json!({"name": "a", "address": {"city": "x", "zip": "1"}});
        let patch = json!({"name": null, "address": {"zip": "2"}});
        let merged = merge_patch(&target, &patch);
        assert_eq!(merged, json!({"address": {"city": "x", "zip": "2"}}));
    }

    #[test]
    fn merge_patch_replaces_scalars_and_arrays_wholesale() {
        let target = json!({"tags": ["a", "b"]});
        let patch = json!({"tags": ["c"]});
        assert_eq!(merge_patch(&target, &patch), json!({"tags": ["c"]}));
    }

    #[test]
    fn json_patch_add_replace_remove() {
        let target = json!({"a": 1, "list": [1, 2]});
        let ops = vec![
            PatchOp { op: "add".to_string(), path: "/b".to_string(), value: json!(2), from: None },
            PatchOp { op: "replace".to_string(), path: "/a".to_string(), value: json!(9), from: None },
            PatchOp { op: "remove".to_string(), path: "/list/0".to_string(), value: Value::Null, from: None },
        ];
        let result = apply_json_patch(&target, &ops).unwrap();
        assert_eq!(result, json!({"a": 9, "b": 2, "list": [2]}));
    }

    #[test]
    fn json_patch_move_and_copy() {
        let target = json!({"a": 1});
        let ops = vec![
            PatchOp { op: "copy".to_string(), path: "/b".to_string(), value: Value::Null, from: Some("/a".to_string()) },
            PatchOp { op: "move".to_string(), path: "/c".to_string(), value: Value::Null, from: Some("/b".to_string()) },
        ];
        let result = apply_json_patch(&target, &ops).unwrap();
        assert_eq!(result, json!({"a": 1, "c": 1}));
    }

    #[test]
    fn json_patch_leaves_target_untouched_on_failure() {
        let target = json!({"a": 1});
        let ops = vec![PatchOp { op: "replace".to_string(), path: "/missing".to_string(), value: json!(1), from: None }];
        assert!(apply_json_patch(&target, &ops).is_err());
    }

    #[test]
    fn unsupported_op_is_rejected() {
        let target = json!({});
        let ops = vec![PatchOp { op: "test".to_string(), path: "/a".to_string(), value: json!(1), from: None }];
        assert!(apply_json_patch(&target, &ops).is_err());
    }
}

fn set_replace(root: &mut Value, segments: &[String], value: Value) -> Result<()> {
    if segments.is_empty() {
        *root = value;
        return Ok(());
    }
    let last = segments.last().unwrap().clone();
    let parent = if segments.len() == 1 {
        root
    } else {
        navigate_parent(root, segments).ok_or_else(malformed)?
    };
    match parent {
        Value::Object(map) => {
            map.insert(last, value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx: usize = last.parse().map_err(|_| malformed())?;
            if idx >= arr.len() {
                return Err(malformed());
            }
            arr[idx] = value;
            Ok(())
        }
        _ => Err(malformed()),
    }
}
