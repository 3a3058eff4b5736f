//! Filesystem request engine (C8) — per-method semantics over resolved
//! files. Spec §4.8.

use crate::error::{EngineError, Result};
use crate::fs_resolver::{self, is_json_mime};
use crate::pagination::{self, ResolvedAxis};
use crate::request::{Method, Request};
use crate::response::{Response, ResponseBody};
use serde_json::Value;
use std::path::Path;
use tokio::io::AsyncReadExt;

fn element_count(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::Null => 0,
        _ => 1,
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut f = tokio::fs::File::open(path).await.map_err(EngineError::from)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).await.map_err(EngineError::from)?;
    Ok(buf)
}

async fn read_json(path: &Path) -> Result<Value> {
    let bytes = read_file(path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| EngineError::Internal(format!("invalid JSON on disk at {}: {e}", path.display())))
}

async fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(EngineError::from)?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(EngineError::from)?;
    tokio::fs::write(path, bytes).await.map_err(EngineError::from)?;
    Ok(())
}

/// Applies the resolved pagination/filter axis to a JSON value, honoring
/// the object-as-one-element-sequence collapse (spec §3 invariant). A
/// `None` axis or a non-array/object value is returned unchanged.
fn apply_axis(value: Value, axis: &ResolvedAxis, req: &Request) -> Result<(Value, Option<usize>)> {
    let Some((mut items, was_array)) = pagination::as_sequence(&value) else {
        return Ok((value, None));
    };

    if let Some(filter_cfg) = &axis.filter {
        items = pagination::apply_filters(req, filter_cfg, items)?;
    }
    let total = items.len();
    if let Some(pagination_cfg) = &axis.pagination {
        let resolved = pagination::extract_pagination(req, pagination_cfg)?;
        pagination::apply_pagination(&mut items, &resolved);
    }
    Ok((pagination::from_sequence(items, was_array), Some(total)))
}

/// HEAD/GET: resolve the file, compute headers, optionally body.
pub async fn handle_read(
    method: Method,
    req: &Request,
    root: &Path,
    url_path: &str,
    axis: &ResolvedAxis,
) -> Result<Response> {
    if req.has_body() {
        return Err(EngineError::client(
            400,
            "GET request cannot have a body in [REST ]File System API mode",
        ));
    }
    let Some(resolved) = fs_resolver::resolve(root, url_path) else {
        return Err(EngineError::not_found("Resource not found"));
    };

    if !is_json_mime(resolved.mime) {
        let total_len = tokio::fs::metadata(&resolved.path).await.map_err(EngineError::from)?.len();
        let mut resp = Response::new(200);
        resp.headers.insert("Content-Type", resolved.mime);
        resp.headers.insert("Content-Length", total_len.to_string());
        resp.headers.insert("X-Total-Elements", "1");
        resp.body = if method == Method::Head {
            ResponseBody::Empty
        } else {
            let file = tokio::fs::File::open(&resolved.path).await.map_err(EngineError::from)?;
            ResponseBody::Stream(Box::new(file))
        };
        return Ok(resp);
    }

    let value = read_json(&resolved.path).await?;
    let (filtered, total) = apply_axis(value, axis, req)?;
    let total = total.unwrap_or_else(|| element_count(&filtered));
    let bytes = serde_json::to_vec(&filtered).map_err(EngineError::from)?;

    let mut resp = Response::new(200);
    resp.headers.insert("Content-Type", "application/json");
    resp.headers.insert("Content-Length", bytes.len().to_string());
    resp.headers.insert("X-Total-Elements", total.to_string());
    resp.body = if method == Method::Head { ResponseBody::Empty } else { ResponseBody::Bytes(bytes) };
    Ok(resp)
}

fn json_body_value(req: &Request) -> Option<Value> {
    req.body.as_json().cloned()
}

/// POST — spec §4.8.
pub async fn handle_post(req: &Request, root: &Path, url_path: &str, axis: &ResolvedAxis) -> Result<Response> {
    if req.files.len() > 1 {
        return Err(EngineError::client(400, "Only one file may be uploaded per request"));
    }
    let has_file = !req.files.is_empty();
    let has_body = json_body_value(req).is_some() || !req.raw_body().is_empty();
    if has_body && has_file {
        return Err(EngineError::client(400, "Request cannot contain both a body and a file"));
    }

    let resolved = fs_resolver::resolve(root, url_path);

    if let Some(resolved) = &resolved {
        if !is_json_mime(resolved.mime) {
            return Err(EngineError::client(
                400,
                "POST request for not json file is not allowed, use PUT or PATCH",
            ));
        }
        let has_axis = axis.pagination.is_some() || axis.filter.is_some();
        if has_axis {
            let value = read_json(&resolved.path).await?;
            let (filtered, total) = apply_axis(value, axis, req)?;
            let total = total.unwrap_or_else(|| element_count(&filtered));
            let mut resp = Response::with_json(200, &filtered);
            resp.headers.insert("X-Total-Elements", total.to_string());
            return Ok(resp);
        }
        return Err(EngineError::client(
            409,
            format!("File at {} already exists", resolved.path.display()),
        ));
    }

    let has_axis = axis.pagination.is_some() || axis.filter.is_some();
    if has_axis {
        return Err(EngineError::client(400, "No data to filter or to paginate"));
    }
    if !has_body && !has_file {
        return Err(EngineError::client(400, "No data provided"));
    }

    write_new_resource(req, root, url_path).await
}

async fn write_new_resource(req: &Request, root: &Path, url_path: &str) -> Result<Response> {
    let content_type = req.content_type().unwrap_or("application/json");
    let target = fs_resolver::target_path(root, url_path, content_type);

    if let Some(file) = req.files.first() {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(EngineError::from)?;
        }
        tokio::fs::write(&target, &file.content).await.map_err(EngineError::from)?;
    } else if let Some(value) = json_body_value(req) {
        write_json_pretty(&target, &value).await?;
    } else {
        tokio::fs::write(&target, req.raw_body()).await.map_err(EngineError::from)?;
    }
    Ok(Response::new(201))
}

/// PUT — spec §4.8.
pub async fn handle_put(req: &Request, root: &Path, url_path: &str) -> Result<Response> {
    if req.files.len() > 1 {
        return Err(EngineError::client(400, "Only one file may be uploaded per request"));
    }
    let has_body = json_body_value(req).is_some() || !req.raw_body().is_empty();
    if !has_body && req.files.is_empty() {
        return Err(EngineError::client(400, "No data provided"));
    }

    let existed = fs_resolver::resolve(root, url_path).is_some();
    write_new_resource(req, root, url_path).await?;
    Ok(Response::new(if existed { 200 } else { 201 }))
}

/// PATCH — spec §4.8.
pub async fn handle_patch(req: &Request, root: &Path, url_path: &str) -> Result<Response> {
    let content_type = req
        .content_type()
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_string())
        .unwrap_or_default();
    if !crate::body::JSON_MEDIA_TYPES.contains(&content_type.as_str()) {
        return Err(EngineError::client(415, "Unsupported Media Type for PATCH"));
    }
    let Some(resolved) = fs_resolver::resolve(root, url_path) else {
        return Err(EngineError::not_found("Resource not found"));
    };
    if !is_json_mime(resolved.mime) {
        return Err(EngineError::client(400, "PATCH target is not a JSON file"));
    }
    let current = read_json(&resolved.path).await?;
    let patched = match content_type.as_str() {
        "application/merge-patch+json" => {
            let patch = json_body_value(req).ok_or_else(|| EngineError::client(400, "PATCH body request malformed"))?;
            crate::patch::merge_patch(&current, &patch)
        }
        "application/json-patch+json" => {
            let body = json_body_value(req).ok_or_else(|| EngineError::client(400, "PATCH body request malformed"))?;
            let ops: Vec<crate::patch::PatchOp> = serde_json::from_value(body)
                .map_err(|_| EngineError::client(400, "PATCH body request malformed"))?;
            crate::patch::apply_json_patch(&current, &ops)?
        }
        "application/json" => {
            let patch = json_body_value(req).ok_or_else(|| EngineError::client(400, "PATCH body request malformed"))?;
            crate::patch::merge_patch(&current, &patch)
        }
        _ => unreachable!("checked above"),
    };
    write_json_pretty(&resolved.path, &patched).await?;
    Ok(Response::new(200))
}

/// DELETE — spec §4.8.
pub async fn handle_delete(req: &Request, root: &Path, url_path: &str, axis: &ResolvedAxis) -> Result<Response> {
    if req.has_body() {
        return Err(EngineError::client(400, "DELETE request cannot have a body"));
    }
    let Some(resolved) = fs_resolver::resolve(root, url_path) else {
        return Err(EngineError::not_found("Resource not found"));
    };

    let has_axis = axis.pagination.is_some() || axis.filter.is_some();
    if !has_axis || !is_json_mime(resolved.mime) {
        tokio::fs::remove_file(&resolved.path).await.map_err(EngineError::from)?;
        let mut resp = Response::new(204);
        resp.headers.insert("X-Deleted-Elements", "1");
        return Ok(resp);
    }

    let value = read_json(&resolved.path).await?;
    let Some((items, was_array)) = pagination::as_sequence(&value) else {
        tokio::fs::remove_file(&resolved.path).await.map_err(EngineError::from)?;
        let mut resp = Response::new(204);
        resp.headers.insert("X-Deleted-Elements", "1");
        return Ok(resp);
    };

    let mask = if let Some(filter_cfg) = &axis.filter {
        pagination::filter_mask(req, filter_cfg, &items)?
    } else {
        vec![true; items.len()]
    };
    let deleted = mask.iter().filter(|keep| **keep).count();
    if deleted == 0 {
        return Err(EngineError::not_found("Partial resource to delete not found"));
    }
    let remaining: Vec<Value> = items
        .into_iter()
        .zip(mask)
        .filter(|(_, keep)| !*keep)
        .map(|(v, _)| v)
        .collect();

    if remaining.is_empty() {
        tokio::fs::remove_file(&resolved.path).await.map_err(EngineError::from)?;
    } else {
        write_json_pretty(&resolved.path, &pagination::from_sequence(remaining, was_array)).await?;
    }

    let mut resp = Response::new(204);
    resp.headers.insert("X-Deleted-Elements", deleted.to_string());
    Ok(resp)
}

/// OPTIONS in pure filesystem mode: 405.
pub fn handle_options() -> Result<Response> {
    Err(EngineError::client(405, "Method Not Allowed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;
    use tempfile::tempdir;

    fn no_axis() -> ResolvedAxis {
        ResolvedAxis { pagination: None, filter: None }
    }

    #[tokio::test]
    async fn get_returns_json_array_with_total_elements_header() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("items.json"), r#"[{"id":1},{"id":2}]"#).unwrap();
        let req = Request::new(Method::Get, "/items.json");
        let resp = handle_read(Method::Get, &req, dir.path(), "/items.json", &no_axis()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("X-Total-Elements"), Some("2"));
    }

    #[tokio::test]
    async fn get_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let req = Request::new(Method::Get, "/missing.json");
        let err = handle_read(Method::Get, &req, dir.path(), "/missing.json", &no_axis()).await.unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn get_non_json_file_streams_instead_of_buffering() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("logo.png"), b"\x89PNG\r\n\x1a\n").unwrap();
        let req = Request::new(Method::Get, "/logo.png");
        let resp = handle_read(Method::Get, &req, dir.path(), "/logo.png", &no_axis()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert!(matches!(resp.body, ResponseBody::Stream(_)));
    }

    #[tokio::test]
    async fn head_non_json_file_has_empty_body() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("logo.png"), b"\x89PNG\r\n\x1a\n").unwrap();
        let req = Request::new(Method::Head, "/logo.png");
        let resp = handle_read(Method::Head, &req, dir.path(), "/logo.png", &no_axis()).await.unwrap();
        assert!(matches!(resp.body, ResponseBody::Empty));
    }

    #[tokio::test]
    async fn post_creates_new_json_resource() {
        let dir = tempdir().unwrap();
        let mut req = Request::new(Method::Post, "/new.json").with_raw_body(br#"{"id":1}"#.to_vec());
        req.body = crate::request::Body::from_value(serde_json::json!({"id": 1}));
        let resp = handle_post(&req, dir.path(), "/new.json", &no_axis()).await.unwrap();
        assert_eq!(resp.status, 201);
        assert!(dir.path().join("new.json").is_file());
    }

    #[tokio::test]
    async fn post_on_existing_json_without_axis_conflicts() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("items.json"), "{}").unwrap();
        let mut req = Request::new(Method::Post, "/items.json");
        req.body = crate::request::Body::from_value(serde_json::json!({"id": 1}));
        let err = handle_post(&req, dir.path(), "/items.json", &no_axis()).await.unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[tokio::test]
    async fn post_with_raw_binary_body_writes_new_resource() {
        let dir = tempdir().unwrap();
        let mut req = Request::new(Method::Post, "/blob.bin").with_raw_body(vec![0u8, 1, 2, 3]);
        req.headers.insert("Content-Type", "application/octet-stream");
        let resp = handle_post(&req, dir.path(), "/blob.bin", &no_axis()).await.unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(std::fs::read(dir.path().join("blob.bin")).unwrap(), vec![0u8, 1, 2, 3]);
    }

    #[tokio::test]
    async fn post_with_axis_but_no_existing_resource_is_rejected() {
        let dir = tempdir().unwrap();
        let mut req = Request::new(Method::Post, "/items.json").with_raw_body(b"{}".to_vec());
        req.body = crate::request::Body::from_value(serde_json::json!({"id": 1}));
        let axis = ResolvedAxis { pagination: Some(crate::config::PaginationConfig::default()), filter: None };
        let err = handle_post(&req, dir.path(), "/items.json", &axis).await.unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.message(), "No data to filter or to paginate");
    }

    #[tokio::test]
    async fn patch_applies_merge_patch_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("item.json");
        std::fs::write(&path, r#"{"name":"a","age":1}"#).unwrap();
        let mut req = Request::new(Method::Patch, "/item.json");
        req.headers.insert("Content-Type", "application/merge-patch+json");
        req.body = crate::request::Body::from_value(serde_json::json!({"age": null, "city": "x"}));
        let resp = handle_patch(&req, dir.path(), "/item.json").await.unwrap();
        assert_eq!(resp.status, 200);
        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, serde_json::json!({"name": "a", "city": "x"}));
    }

    #[tokio::test]
    async fn delete_without_axis_removes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.json");
        std::fs::write(&path, "{}").unwrap();
        let req = Request::new(Method::Delete, "/gone.json");
        let resp = handle_delete(&req, dir.path(), "/gone.json", &no_axis()).await.unwrap();
        assert_eq!(resp.status, 204);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_with_filter_removes_only_matching_duplicates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(&path, r#"[{"v":1},{"v":2},{"v":1}]"#).unwrap();
        let req = Request::new(Method::Delete, "/items.json?v=1");
        let axis = ResolvedAxis {
            pagination: None,
            filter: Some(crate::config::FilterConfig {
                source: Some(crate::config::PaginationSource::QueryParam),
                root: None,
                rules: vec![crate::config::FilterRule {
                    key: "v".to_string(),
                    value_type: crate::config::ValueType::Number,
                    comparison: crate::config::Comparison::Eq,
                    regex_flags: None,
                }],
            }),
        };
        let resp = handle_delete(&req, dir.path(), "/items.json", &axis).await.unwrap();
        assert_eq!(resp.headers.get("X-Deleted-Elements"), Some("2"));
        let remaining: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(remaining, serde_json::json!([{"v": 2}]));
    }
}
