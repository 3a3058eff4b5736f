//! Filesystem-driven REST + WebSocket mock backend engine.
//!
//! Two entrypoints mirror a Node-style HTTP server's two hook points:
//! [`Engine::dispatch`] for ordinary requests, returning
//! [`DispatchOutcome::Response`] or [`DispatchOutcome::Forward`] (the
//! `next()` case), and the free function [`handle_upgrade`] for the
//! `upgrade` event, which runs the handshake against a set of registered
//! [`ws::WsRoute`]s and then drives the connection's read loop. Everything
//! else — config, handler wiring, the connection manager — is constructed
//! once at startup and handed to the engine as [`config::Options`].

pub mod body;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fs_engine;
pub mod fs_resolver;
pub mod middleware;
pub mod mime;
pub mod pagination;
pub mod patch;
pub mod path_matcher;
pub mod request;
pub mod response;
pub mod ws;

pub use config::Options;
pub use dispatcher::{DispatchOutcome, Engine};
pub use error::{EngineError, Result};
pub use request::Request;
pub use response::Response;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use ws::connection::{Connection, ConnectionManager, MAX_MISSED_PONGS};
use ws::deflate::{DeflateDecoderState, DeflateEncoderState};
use ws::dispatcher::WsHandler;
use ws::frame::FrameParser;
use ws::handshake;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Runs the full upgrade handshake against `req`, matching it against
/// `routes` first (404 if none matches), then hands the new connection to
/// `manager` and drives its read loop — heartbeat, inactivity timeout, and
/// frame dispatch — until the socket closes. Spec §4.10/§4.13/§4.14, host
/// entrypoint `handleUpgrade`.
pub async fn handle_upgrade<S>(
    req: &handshake::UpgradeRequest,
    routes: &[handshake::WsRoute],
    manager: Arc<ConnectionManager>,
    handler_factory: impl FnOnce(Arc<Connection>, Option<ws::NegotiatedDeflate>) -> WsHandler,
    socket: &mut S,
    initial_bytes: &[u8],
) -> crate::error::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let Some(route) = handshake::match_route(routes, &req.path) else {
        let resp = Response::error_envelope(&EngineError::not_found("No WebSocket handler pattern matched"), &req.path);
        let _ = resp.write_to(socket).await;
        return Err(EngineError::not_found("No WebSocket handler pattern matched"));
    };

    let (handshake_resp, negotiated) = match handshake::build_handshake_response(req, route).await {
        Ok(ok) => ok,
        Err(e) => {
            let resp = Response::error_envelope(&e, &req.path);
            let _ = resp.write_to(socket).await;
            return Err(e);
        }
    };

    let mut status_line = format!("HTTP/1.1 {} Switching Protocols\r\n", handshake_resp.status);
    for (name, value) in handshake_resp.headers.iter() {
        status_line.push_str(&format!("{name}: {value}\r\n"));
    }
    status_line.push_str("\r\n");
    socket.write_all(status_line.as_bytes()).await.map_err(EngineError::from)?;
    socket.flush().await.map_err(EngineError::from)?;

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let conn = Connection::new(tx);
    manager.add(conn.clone());

    // Compression is a property of the negotiated connection, not of the
    // handler: wire both directions here so every handler gets it for free.
    let deflate_decoder = if let Some(neg) = &negotiated {
        conn.set_deflate_encoder(DeflateEncoderState::new(neg.server_no_context_takeover));
        Some(DeflateDecoderState::new(neg.client_no_context_takeover))
    } else {
        None
    };

    let handler = handler_factory(conn.clone(), negotiated);
    let heartbeat_interval_ms = handler.heartbeat_interval_ms;
    let inactivity_timeout_ms = handler.inactivity_timeout_ms;
    let mut dispatcher = ws::WsDispatcher::new(conn.clone(), manager.clone(), handler, deflate_decoder);

    let mut heartbeat = heartbeat_interval_ms.map(|ms| tokio::time::interval(Duration::from_millis(ms.max(1))));
    let mut inactivity_deadline = inactivity_timeout_ms
        .map(|ms| Box::pin(tokio::time::sleep(Duration::from_millis(ms.max(1)))));

    let mut parser = FrameParser::new();
    parser.push(initial_bytes);

    let mut read_buf = [0u8; 8192];
    let close_outcome = loop {
        if let Some(frame) = parser.next_frame() {
            conn.touch(now_ms());
            if let Some(ms) = inactivity_timeout_ms {
                if let Some(deadline) = inactivity_deadline.as_mut() {
                    deadline.as_mut().reset(tokio::time::Instant::now() + Duration::from_millis(ms.max(1)));
                }
            }
            if let Some(outcome) = dispatcher.process_frame(frame).await {
                break Some(outcome);
            }
            continue;
        }

        tokio::select! {
            n = socket.read(&mut read_buf) => {
                match n {
                    Ok(0) => break Some((1006, "Connection closed abnormally".to_string())),
                    Ok(n) => parser.push(&read_buf[..n]),
                    Err(_) => break Some((1006, "Connection closed abnormally".to_string())),
                }
            }
            Some(out_msg) = rx.recv() => {
                let wire = conn.render(&out_msg);
                if socket.write_all(&wire).await.is_err() {
                    break Some((1006, "Connection closed abnormally".to_string()));
                }
            }
            _ = tick_or_pending(&mut heartbeat), if heartbeat.is_some() => {
                let missed = conn.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1;
                if missed >= MAX_MISSED_PONGS {
                    break Some((1000, "No pong received".to_string()));
                }
                let _ = conn.send(ws::OutMessage::Ping(Vec::new())).await;
            }
            _ = sleep_or_pending(&mut inactivity_deadline), if inactivity_deadline.is_some() => {
                break Some((1000, "Inactivity timeout".to_string()));
            }
        }
    };

    if let Some((code, reason)) = close_outcome {
        let close = ws::OutMessage::Close(code, reason);
        let _ = socket.write_all(&close.to_wire()).await;
        let _ = socket.flush().await;
    }

    manager.remove(conn.id);
    Ok(())
}

/// Ticks `interval` when present, else never resolves — lets a `None`
/// heartbeat config sit in the same `tokio::select!` without a branch guard
/// doing double duty as the await target.
async fn tick_or_pending(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_or_pending(deadline: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>) {
    match deadline {
        Some(d) => d.as_mut().await,
        None => std::future::pending().await,
    }
}
