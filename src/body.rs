//! Body parser (C3) — spec §4.3.
//!
//! Selected by `Content-Type`: JSON (including the two patch media types),
//! urlencoded, multipart/form-data (fields + files), `text/*`, and a
//! fallback that tries JSON then falls back to a raw string. Disabled
//! entirely when `parser: false`.

use crate::error::{EngineError, Result};
use crate::request::{Body, FileField};
use bytes::Bytes;
use serde_json::Value;

pub const JSON_MEDIA_TYPES: &[&str] = &[
    "application/json",
    "application/merge-patch+json",
    "application/json-patch+json",
];

/// Parses a raw body into `(Body, files, query-from-body-if-any)` based on
/// the declared content type. `query` is always empty here; it exists as a
/// hook for custom parsers (spec: "a user-supplied parser ... must still
/// produce `{body?, files?, query?}`").
pub async fn parse(content_type: Option<&str>, raw: &[u8]) -> Result<(Body, Vec<FileField>)> {
    if raw.is_empty() {
        return Ok((Body::Null, Vec::new()));
    }
    let essence = content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .map(|m| format!("{}/{}", m.type_(), m.subtype()))
        .unwrap_or_default();

    if JSON_MEDIA_TYPES.contains(&essence.as_str()) {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| EngineError::client(400, format!("PARSE_ERROR: invalid JSON body: {e}")))?;
        return Ok((Body::from_value(value), Vec::new()));
    }

    if essence == "application/x-www-form-urlencoded" {
        let mut map = serde_json::Map::new();
        for (k, v) in url::form_urlencoded::parse(raw) {
            map.insert(k.into_owned(), Value::String(v.into_owned()));
        }
        return Ok((Body::Object(Value::Object(map)), Vec::new()));
    }

    if essence == "multipart/form-data" {
        let boundary = content_type
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .and_then(|m| m.get_param("boundary").map(|b| b.to_string()))
            .ok_or_else(|| EngineError::client(400, "PARSE_ERROR: missing multipart boundary"))?;
        return parse_multipart(raw, &boundary).await;
    }

    if essence.starts_with("text/") {
        let s = String::from_utf8(raw.to_vec())
            .map_err(|e| EngineError::client(400, format!("PARSE_ERROR: invalid UTF-8: {e}")))?;
        return Ok((Body::Scalar(Value::String(s)), Vec::new()));
    }

    // Fallback: attempt JSON, else raw string/bytes.
    if let Ok(value) = serde_json::from_slice::<Value>(raw) {
        return Ok((Body::from_value(value), Vec::new()));
    }
    match String::from_utf8(raw.to_vec()) {
        Ok(s) => Ok((Body::Scalar(Value::String(s)), Vec::new())),
        Err(_) => Ok((Body::Raw(raw.to_vec()), Vec::new())),
    }
}

async fn parse_multipart(raw: &[u8], boundary: &str) -> Result<(Body, Vec<FileField>)> {
    use buffered_stream::once_stream;

    let stream = once_stream(Ok::<Bytes, std::io::Error>(Bytes::copy_from_slice(raw)));
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = serde_json::Map::new();
    let mut files = Vec::new();

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| EngineError::client(400, format!("PARSE_ERROR: {e}")))?;
        let Some(field) = field else { break };

        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(|s| s.to_string());
        let content_type = field.content_type().map(|m| m.to_string());

        let bytes = field
            .bytes()
            .await
            .map_err(|e| EngineError::client(400, format!("PARSE_ERROR: {e}")))?;

        if file_name.is_some() {
            files.push(FileField {
                name,
                content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
                content: bytes.to_vec(),
            });
        } else {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            fields.insert(name, Value::String(text));
        }
    }

    Ok((Body::Object(Value::Object(fields)), files))
}

/// Tiny internal shim so `multer`'s stream-based API can consume a buffer
/// we've already read fully into memory (this engine is development-grade
/// and does not stream request bodies — spec §1 non-goals).
mod buffered_stream {
    use futures_util::stream::{self, Stream};

    pub fn once_stream<T>(item: T) -> impl Stream<Item = T>
    where
        T: Send + 'static,
    {
        stream::once(std::future::ready(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_json_body() {
        let (body, files) = parse(Some("application/json"), br#"{"a":1}"#).await.unwrap();
        assert_eq!(body.as_json().unwrap(), &serde_json::json!({"a": 1}));
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_json() {
        let result = parse(Some("application/json"), b"{not json").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn parses_urlencoded_form() {
        let (body, _) = parse(Some("application/x-www-form-urlencoded"), b"a=1&b=two").await.unwrap();
        assert_eq!(body.as_json().unwrap(), &serde_json::json!({"a": "1", "b": "two"}));
    }

    #[tokio::test]
    async fn empty_body_is_null() {
        let (body, files) = parse(Some("application/json"), b"").await.unwrap();
        assert!(matches!(body, Body::Null));
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn fallback_treats_unknown_content_type_as_raw_text() {
        let (body, _) = parse(Some("application/octet-stream"), b"plain text").await.unwrap();
        assert_eq!(body.as_json(), Some(&serde_json::Value::String("plain text".to_string())));
    }
}
