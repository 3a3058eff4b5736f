//! WebSocket dispatcher (C14) — per-frame processing: control frames,
//! validation, fragmentation reassembly, response matching. Spec §4.14.

use crate::error::{EngineError, Result};
use crate::ws::connection::{Connection, ConnectionManager, OutMessage};
use crate::ws::deflate::DeflateDecoderState;
use crate::ws::frame::{Frame, OPCODE_BINARY, OPCODE_CLOSE, OPCODE_CONTINUATION, OPCODE_PING, OPCODE_PONG, OPCODE_TEXT};
use serde_json::Value;
use std::sync::Arc;

/// Validates a WebSocket close code per RFC 6455 §7.4 plus the
/// application range, as enumerated in the glossary's close-code classes.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// A derived inbound message handed to response matching / `onMessage`.
#[derive(Clone, Debug)]
pub enum InMessage {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

/// One `{match, response, broadcast?}` rule, spec §4.14 "Response matching".
#[async_trait::async_trait]
pub trait ResponseRule: Send + Sync {
    /// Returns `true` if this rule should handle `msg`.
    async fn matches(&self, conn: &Connection, msg: &InMessage) -> Result<bool>;
    /// Computes the response payload once matched.
    async fn respond(&self, conn: &Connection, msg: &InMessage) -> Result<Value>;
    /// `Some(room)` broadcasts to that room, `Some(None-room)` (i.e. no
    /// room filter) broadcasts to everyone; `None` sends to the caller only.
    fn broadcast_target(&self) -> Option<Option<String>> {
        None
    }
}

#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, _conn: &Connection, _msg: &InMessage) -> Result<()> {
        Ok(())
    }
    async fn on_ping(&self, _conn: &Connection, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
    async fn on_pong(&self, _conn: &Connection, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
    async fn on_error(&self, _conn: &Connection, _err: &EngineError) {}
}

/// Per-connection handler configuration: response rules and lifecycle
/// hooks. Compression is negotiated per-connection, not per-handler — see
/// [`WsDispatcher::new`]. `heartbeat_interval_ms`/`inactivity_timeout_ms`
/// are read by `handle_upgrade`'s read loop, not by the dispatcher itself
/// (spec §4.13 "Heartbeat"/"Inactivity"); `None` disables the respective
/// timer.
pub struct WsHandler {
    pub rules: Vec<Arc<dyn ResponseRule>>,
    pub hooks: Option<Arc<dyn MessageHandler>>,
    pub heartbeat_interval_ms: Option<u64>,
    pub inactivity_timeout_ms: Option<u64>,
}

/// Reassembles fragmented messages and tracks the state needed to apply
/// §4.14's validation rules across a connection's whole lifetime.
pub struct WsDispatcher {
    conn: Arc<Connection>,
    manager: Arc<ConnectionManager>,
    handler: WsHandler,
    deflate_decoder: Option<DeflateDecoderState>,
    fragment_opcode: Option<u8>,
    fragment_buf: Vec<u8>,
    fragment_rsv1: bool,
}

impl WsDispatcher {
    /// `deflate_decoder` is `Some` exactly when permessage-deflate was
    /// negotiated for this connection (built by `handle_upgrade` from the
    /// handshake's negotiated parameters).
    pub fn new(
        conn: Arc<Connection>,
        manager: Arc<ConnectionManager>,
        handler: WsHandler,
        deflate_decoder: Option<DeflateDecoderState>,
    ) -> Self {
        WsDispatcher {
            conn,
            manager,
            handler,
            deflate_decoder,
            fragment_opcode: None,
            fragment_buf: Vec::new(),
            fragment_rsv1: false,
        }
    }

    /// Processes one frame per the §4.14 order: control, then validation,
    /// then data accumulation. Returns `Some(close)` when the connection
    /// should be torn down (close code + reason already queued for send).
    pub async fn process_frame(&mut self, frame: Frame) -> Option<(u16, String)> {
        let is_control = matches!(frame.opcode, OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG);
        if is_control {
            return self.handle_control(&frame).await;
        }
        if let Some(outcome) = self.validate(&frame) {
            return Some(outcome);
        }
        self.handle_data(frame).await;
        None
    }

    async fn handle_control(&mut self, frame: &Frame) -> Option<(u16, String)> {
        match frame.opcode {
            OPCODE_CLOSE => Some(self.handle_close(&frame.payload)),
            OPCODE_PING => {
                self.conn.missed_pongs.store(0, std::sync::atomic::Ordering::Relaxed);
                if let Some(hooks) = &self.handler.hooks {
                    let _ = hooks.on_ping(&self.conn, &frame.payload).await;
                } else {
                    let _ = self.conn.send(OutMessage::Pong(frame.payload.clone())).await;
                }
                None
            }
            OPCODE_PONG => {
                self.conn.missed_pongs.store(0, std::sync::atomic::Ordering::Relaxed);
                if let Some(hooks) = &self.handler.hooks {
                    let _ = hooks.on_pong(&self.conn, &frame.payload).await;
                }
                None
            }
            _ => None,
        }
    }

    fn handle_close(&self, payload: &[u8]) -> (u16, String) {
        match payload.len() {
            0 => (1000, String::new()),
            1 => (1002, "invalid close payload".to_string()),
            n if n > 125 => (1002, "invalid close payload".to_string()),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason_bytes = &payload[2..];
                match std::str::from_utf8(reason_bytes) {
                    Ok(reason) if is_valid_close_code(code) => (code, reason.to_string()),
                    Ok(_) => (1002, "invalid close code".to_string()),
                    Err(_) => (1002, "invalid close payload".to_string()),
                }
            }
        }
    }

    /// Spec §4.14 "Validation": reserved opcodes, unnegotiated rsv1/rsv2/rsv3.
    fn validate(&self, frame: &Frame) -> Option<(u16, String)> {
        if frame.opcode > 0x0A || (0x03..=0x07).contains(&frame.opcode) {
            return Some((1002, "unknown opcode".to_string()));
        }
        if frame.rsv2 || frame.rsv3 {
            return Some((1002, "reserved bits set".to_string()));
        }
        if frame.rsv1 && self.deflate_decoder.is_none() {
            return Some((1002, "rsv1 set without negotiated deflate".to_string()));
        }
        None
    }

    async fn handle_data(&mut self, frame: Frame) {
        if frame.opcode == OPCODE_CONTINUATION {
            if self.fragment_opcode.is_none() {
                if let Some(hooks) = &self.handler.hooks {
                    hooks.on_error(&self.conn, &EngineError::Internal("Continuation frame without initial frame".to_string())).await;
                }
                return;
            }
            self.fragment_buf.extend_from_slice(&frame.payload);
        } else {
            self.fragment_opcode = Some(frame.opcode);
            self.fragment_rsv1 = frame.rsv1;
            self.fragment_buf = frame.payload;
        }

        if !frame.fin {
            return;
        }

        let opcode = self.fragment_opcode.take().unwrap_or(frame.opcode);
        let rsv1 = self.fragment_rsv1;
        let mut payload = std::mem::take(&mut self.fragment_buf);

        if rsv1 {
            if let Some(dec) = &mut self.deflate_decoder {
                match dec.decompress(&payload) {
                    Ok(decompressed) => payload = decompressed,
                    Err(e) => {
                        if let Some(hooks) = &self.handler.hooks {
                            hooks.on_error(&self.conn, &e).await;
                        }
                        return;
                    }
                }
            }
        }

        let msg = match opcode {
            OPCODE_TEXT => match serde_json::from_slice::<Value>(&payload) {
                Ok(v) => InMessage::Json(v),
                Err(_) => match String::from_utf8(payload) {
                    Ok(s) => InMessage::Text(s),
                    Err(_) => return,
                },
            },
            OPCODE_BINARY => InMessage::Binary(payload),
            _ => InMessage::Binary(payload),
        };

        self.dispatch_message(msg).await;
    }

    async fn dispatch_message(&self, msg: InMessage) {
        for rule in &self.handler.rules {
            match rule.matches(&self.conn, &msg).await {
                Ok(true) => {
                    let response = match rule.respond(&self.conn, &msg).await {
                        Ok(v) => v,
                        Err(e) => {
                            if let Some(hooks) = &self.handler.hooks {
                                hooks.on_error(&self.conn, &e).await;
                            }
                            return;
                        }
                    };
                    let text = response.to_string();
                    match rule.broadcast_target() {
                        Some(room) => self.manager.broadcast(room.as_deref(), OutMessage::Text(text)).await,
                        None => {
                            let _ = self.conn.send(OutMessage::Text(text)).await;
                        }
                    }
                    return;
                }
                Ok(false) => continue,
                Err(e) => {
                    if let Some(hooks) = &self.handler.hooks {
                        hooks.on_error(&self.conn, &e).await;
                    }
                    return;
                }
            }
        }
        if let Some(hooks) = &self.handler.hooks {
            let _ = hooks.on_message(&self.conn, &msg).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_validator_matches_glossary_ranges() {
        assert!(is_valid_close_code(1000));
        assert!(is_valid_close_code(1011));
        assert!(!is_valid_close_code(1004));
        assert!(!is_valid_close_code(1005));
        assert!(!is_valid_close_code(1006));
        assert!(!is_valid_close_code(1015));
        assert!(!is_valid_close_code(2000));
        assert!(is_valid_close_code(3000));
        assert!(is_valid_close_code(4999));
        assert!(!is_valid_close_code(5000));
    }
}
