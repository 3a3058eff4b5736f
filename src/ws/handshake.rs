//! WebSocket handshake (C10) — spec §4.10.

use crate::error::{EngineError, Result};
use crate::request::{Headers, Method};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use std::sync::Arc;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Minimal request shape the host hands to `handle_upgrade` — just enough
/// of an HTTP/1.1 upgrade request for the handshake to negotiate against.
#[derive(Clone, Debug)]
pub struct UpgradeRequest {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
}

pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();
    STANDARD.encode(digest)
}

/// Per-connection extension negotiation policy declared by a WS handler.
#[derive(Clone, Debug)]
pub struct DeflatePolicy {
    pub enabled: bool,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
    pub strict: bool,
}

impl Default for DeflatePolicy {
    fn default() -> Self {
        DeflatePolicy {
            enabled: true,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: None,
            client_max_window_bits: None,
            strict: false,
        }
    }
}

/// Negotiated extension parameters echoed back in
/// `Sec-WebSocket-Extensions`.
#[derive(Clone, Debug, Default)]
pub struct NegotiatedDeflate {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    pub client_max_window_bits: Option<u8>,
}

impl NegotiatedDeflate {
    pub fn to_extension_header(&self) -> String {
        let mut parts = vec!["permessage-deflate".to_string()];
        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if let Some(bits) = self.server_max_window_bits {
            parts.push(format!("server_max_window_bits={bits}"));
        }
        if let Some(bits) = self.client_max_window_bits {
            parts.push(format!("client_max_window_bits={bits}"));
        }
        parts.join("; ")
    }
}

fn parse_extension_params(raw: &str) -> Vec<(String, Option<String>)> {
    raw.split(';')
        .skip(1) // first token is the extension name
        .filter_map(|p| {
            let p = p.trim();
            if p.is_empty() {
                return None;
            }
            match p.split_once('=') {
                Some((k, v)) => Some((k.trim().to_string(), Some(v.trim().trim_matches('"').to_string()))),
                None => Some((p.to_string(), None)),
            }
        })
        .collect()
}

/// Negotiates permessage-deflate per spec §4.10. Returns `None` if the
/// client did not offer it or the handler disabled it. Raises a handshake
/// error only when `strict` policy demands one on an out-of-range value.
pub fn negotiate_deflate(
    extensions_header: Option<&str>,
    policy: &DeflatePolicy,
) -> Result<Option<NegotiatedDeflate>> {
    if !policy.enabled {
        return Ok(None);
    }
    let Some(header) = extensions_header else { return Ok(None) };

    let offer = header
        .split(',')
        .map(|s| s.trim())
        .find(|s| s.starts_with("permessage-deflate"));
    let Some(offer) = offer else { return Ok(None) };

    let params = parse_extension_params(offer);
    let mut out = NegotiatedDeflate::default();

    for (key, value) in &params {
        match key.as_str() {
            "server_no_context_takeover" => out.server_no_context_takeover = true,
            "client_no_context_takeover" => out.client_no_context_takeover = true,
            "server_max_window_bits" => {
                let bits = value
                    .as_deref()
                    .and_then(|v| v.parse::<u8>().ok())
                    .filter(|b| (8..=15).contains(b));
                match bits {
                    Some(b) => out.server_max_window_bits = Some(b),
                    None if policy.strict => {
                        return Err(EngineError::client(400, "invalid server_max_window_bits"))
                    }
                    None => {}
                }
            }
            "client_max_window_bits" => {
                let bits = value
                    .as_deref()
                    .and_then(|v| v.parse::<u8>().ok())
                    .filter(|b| (8..=15).contains(b));
                match bits {
                    Some(b) => out.client_max_window_bits = Some(b),
                    None if policy.strict => {
                        return Err(EngineError::client(400, "invalid client_max_window_bits"))
                    }
                    None => {}
                }
            }
            _ => {}
        }
    }

    if policy.server_no_context_takeover && !out.server_no_context_takeover {
        out.server_no_context_takeover = true;
    } else if !policy.server_no_context_takeover && out.server_no_context_takeover && policy.strict {
        return Err(EngineError::client(400, "server_no_context_takeover mismatch"));
    }
    if policy.client_no_context_takeover && !out.client_no_context_takeover {
        out.client_no_context_takeover = true;
    } else if !policy.client_no_context_takeover && out.client_no_context_takeover && policy.strict {
        return Err(EngineError::client(400, "client_no_context_takeover mismatch"));
    }

    Ok(Some(out))
}

/// Intersects the client's requested subprotocols (comma-separated,
/// trimmed, in client order) with the handler's declared list; the first
/// match wins.
pub fn negotiate_subprotocol(client_header: Option<&str>, supported: &[String]) -> Option<String> {
    let client_header = client_header?;
    client_header
        .split(',')
        .map(|s| s.trim())
        .find(|candidate| supported.iter().any(|s| s == candidate))
        .map(|s| s.to_string())
}

pub struct HandshakeResponse {
    pub status: u16,
    pub headers: Headers,
}

/// Optional per-route auth hook. Returning `Ok(false)` fails the handshake
/// with 401; returning `Err` fails it with 500 (spec §4.10).
#[async_trait::async_trait]
pub trait Authenticate: Send + Sync {
    async fn call(&self, req: &UpgradeRequest) -> Result<bool>;
}

/// A registered WebSocket endpoint, matched against the upgrade request's
/// path before the handshake proceeds — the WS analogue of a REST
/// `HandlerDescriptor` (spec §4.10: "404 when no handler pattern matches").
pub struct WsRoute {
    pub pattern: String,
    pub supported_subprotocols: Vec<String>,
    pub deflate_policy: DeflatePolicy,
    pub authenticate: Option<Arc<dyn Authenticate>>,
}

impl WsRoute {
    pub fn new(pattern: impl Into<String>) -> Self {
        WsRoute {
            pattern: pattern.into(),
            supported_subprotocols: Vec::new(),
            deflate_policy: DeflatePolicy::default(),
            authenticate: None,
        }
    }
}

/// First registered route whose pattern matches `path`, in registration
/// order — mirrors `path_matcher`'s first-match semantics for REST handlers.
pub fn match_route<'a>(routes: &'a [WsRoute], path: &str) -> Option<&'a WsRoute> {
    routes.iter().find(|r| crate::path_matcher::match_pattern(&r.pattern, path).is_some())
}

/// Computes the full 101 response (or a failure status) per spec §4.10:
/// 400 on a missing `Sec-WebSocket-Key`, 401 when `route.authenticate`
/// returns `Ok(false)`, 500 when it returns `Err`. Path-pattern matching
/// (404) happens in [`match_route`], before this is called.
pub async fn build_handshake_response(
    req: &UpgradeRequest,
    route: &WsRoute,
) -> Result<(HandshakeResponse, Option<NegotiatedDeflate>)> {
    let Some(client_key) = req.headers.get("sec-websocket-key") else {
        return Err(EngineError::client(400, "Missing Sec-WebSocket-Key"));
    };

    if let Some(authenticate) = &route.authenticate {
        match authenticate.call(req).await {
            Ok(true) => {}
            Ok(false) => return Err(EngineError::client(401, "Unauthorized")),
            Err(e) => return Err(EngineError::Internal(e.message())),
        }
    }

    let accept = compute_accept_key(client_key);
    let negotiated = negotiate_deflate(req.headers.get("sec-websocket-extensions"), &route.deflate_policy)?;
    let subprotocol = negotiate_subprotocol(req.headers.get("sec-websocket-protocol"), &route.supported_subprotocols);

    let mut headers = Headers::new();
    headers.insert("Upgrade", "websocket");
    headers.insert("Connection", "Upgrade");
    headers.insert("Sec-WebSocket-Accept", accept);
    if let Some(proto) = subprotocol {
        headers.insert("Sec-WebSocket-Protocol", proto);
    }
    if let Some(neg) = &negotiated {
        headers.insert("Sec-WebSocket-Extensions", neg.to_extension_header());
    }

    Ok((HandshakeResponse { status: 101, headers }, negotiated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        assert_eq!(compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn subprotocol_negotiation_honors_client_order() {
        let supported = vec!["chat".to_string(), "notify".to_string()];
        assert_eq!(negotiate_subprotocol(Some("soap, chat, notify"), &supported), Some("chat".to_string()));
        assert_eq!(negotiate_subprotocol(Some("soap"), &supported), None);
        assert_eq!(negotiate_subprotocol(None, &supported), None);
    }

    #[test]
    fn deflate_negotiation_parses_offered_params() {
        let policy = DeflatePolicy::default();
        let negotiated =
            negotiate_deflate(Some("permessage-deflate; client_max_window_bits=10"), &policy).unwrap().unwrap();
        assert_eq!(negotiated.client_max_window_bits, Some(10));
    }

    #[test]
    fn deflate_disabled_policy_ignores_client_offer() {
        let mut policy = DeflatePolicy::default();
        policy.enabled = false;
        assert!(negotiate_deflate(Some("permessage-deflate"), &policy).unwrap().is_none());
    }

    #[test]
    fn strict_policy_rejects_out_of_range_window_bits() {
        let policy = DeflatePolicy { strict: true, ..DeflatePolicy::default() };
        let result = negotiate_deflate(Some("permessage-deflate; server_max_window_bits=20"), &policy);
        assert!(result.is_err());
    }

    fn upgrade_req(headers: Headers) -> UpgradeRequest {
        UpgradeRequest { method: Method::Get, path: "/ws".to_string(), headers }
    }

    struct AlwaysDeny;
    #[async_trait::async_trait]
    impl Authenticate for AlwaysDeny {
        async fn call(&self, _req: &UpgradeRequest) -> Result<bool> {
            Ok(false)
        }
    }

    struct AlwaysThrow;
    #[async_trait::async_trait]
    impl Authenticate for AlwaysThrow {
        async fn call(&self, _req: &UpgradeRequest) -> Result<bool> {
            Err(EngineError::Internal("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn build_handshake_response_requires_key() {
        let req = upgrade_req(Headers::new());
        let route = WsRoute::new("/ws");
        let result = build_handshake_response(&req, &route).await;
        assert_eq!(result.unwrap_err().status(), 400);
    }

    #[tokio::test]
    async fn build_handshake_response_echoes_accept_key() {
        let mut headers = Headers::new();
        headers.insert("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        let req = upgrade_req(headers);
        let route = WsRoute::new("/ws");
        let (resp, _) = build_handshake_response(&req, &route).await.unwrap();
        assert_eq!(resp.status, 101);
        assert_eq!(resp.headers.get("Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[tokio::test]
    async fn build_handshake_response_denies_with_401_when_authenticate_returns_false() {
        let mut headers = Headers::new();
        headers.insert("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        let req = upgrade_req(headers);
        let mut route = WsRoute::new("/ws");
        route.authenticate = Some(Arc::new(AlwaysDeny));
        let result = build_handshake_response(&req, &route).await;
        assert_eq!(result.unwrap_err().status(), 401);
    }

    #[tokio::test]
    async fn build_handshake_response_maps_authenticate_error_to_500() {
        let mut headers = Headers::new();
        headers.insert("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        let req = upgrade_req(headers);
        let mut route = WsRoute::new("/ws");
        route.authenticate = Some(Arc::new(AlwaysThrow));
        let result = build_handshake_response(&req, &route).await;
        assert_eq!(result.unwrap_err().status(), 500);
    }

    #[test]
    fn match_route_picks_first_matching_pattern_in_order() {
        let routes = vec![WsRoute::new("/chat/{id}"), WsRoute::new("/**")];
        let matched = match_route(&routes, "/chat/42").unwrap();
        assert_eq!(matched.pattern, "/chat/{id}");
        assert!(match_route(&routes, "/anything/else").is_some());
        assert!(match_route(&[], "/chat/42").is_none());
    }
}
