use mockengine::config::Options;
use mockengine::request::{Headers, Method, Request};
use mockengine::response::Response;
use mockengine::ws::connection::ConnectionManager;
use mockengine::ws::dispatcher::WsHandler;
use mockengine::ws::handshake::{UpgradeRequest, WsRoute};
use mockengine::{handle_upgrade, DispatchOutcome, Engine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::time::{timeout, Duration};

const PORT: u16 = 8080;
const MAX_HEADER_SIZE: usize = 16 * 1024;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const INACTIVITY_TIMEOUT_MS: u64 = 120_000;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let options = Options::default();
    let engine = Arc::new(Engine::new(options));
    let ws_manager = Arc::new(ConnectionManager::new());
    // Demo wiring: a single catch-all route. A real embedding host
    // registers one `WsRoute` per upgrade-eligible pattern.
    let ws_routes = Arc::new(vec![WsRoute::new("/**")]);

    let listener = TcpListener::bind(format!("0.0.0.0:{PORT}")).await.expect("failed to bind to address");

    tracing::info!(port = PORT, "mockengine-server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(handle_connection(stream, engine.clone(), ws_manager.clone(), ws_routes.clone()));
                    }
                    Err(_) => continue,
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received, stopping server");
                SHUTDOWN.store(true, Ordering::Relaxed);
                break;
            }
        }
    }

    tracing::info!("server shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    engine: Arc<Engine>,
    ws_manager: Arc<ConnectionManager>,
    ws_routes: Arc<Vec<WsRoute>>,
) {
    let result = timeout(
        Duration::from_secs(CONNECTION_TIMEOUT_SECS),
        handle_connection_inner(&mut stream, engine, ws_manager, ws_routes),
    )
    .await;
    if result.is_err() {
        let _ = stream.write_all(b"HTTP/1.1 408 Request Timeout\r\nContent-Length: 0\r\n\r\n").await;
        let _ = stream.flush().await;
    }
}

/// Reads one HTTP/1.1 request, parses it with `httparse`, detects a
/// WebSocket upgrade, and otherwise dispatches through the REST engine.
/// Keeps the connection open across requests unless the client closes it,
/// mirroring the teacher's per-connection read loop.
async fn handle_connection_inner(
    stream: &mut TcpStream,
    engine: Arc<Engine>,
    ws_manager: Arc<ConnectionManager>,
    ws_routes: Arc<Vec<WsRoute>>,
) -> std::io::Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut scratch = [0u8; 4096];

    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            return Ok(());
        }

        let header_end = loop {
            if let Some(pos) = find_header_end(&buf) {
                break pos;
            }
            if buf.len() > MAX_HEADER_SIZE {
                let _ = stream.write_all(b"HTTP/1.1 431 Request Header Fields Too Large\r\nContent-Length: 0\r\n\r\n").await;
                return Ok(());
            }
            let n = stream.read(&mut scratch).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&scratch[..n]);
        };

        let mut headers_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers_storage);
        let parse_result = match parsed.parse(&buf[..header_end]) {
            Ok(httparse::Status::Complete(n)) => n,
            _ => {
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await;
                return Ok(());
            }
        };
        let _ = parse_result;

        let method = parsed.method.and_then(Method::parse).unwrap_or(Method::Get);
        let url = parsed.path.unwrap_or("/").to_string();

        let mut headers = Headers::new();
        let mut content_length = 0usize;
        for h in parsed.headers.iter() {
            let value = String::from_utf8_lossy(h.value).to_string();
            if h.name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
            headers.insert(h.name.to_string(), value);
        }

        let is_upgrade = headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);

        let body_start = header_end;
        while buf.len() < body_start + content_length {
            let n = stream.read(&mut scratch).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&scratch[..n]);
        }
        let body_bytes = buf[body_start..(body_start + content_length).min(buf.len())].to_vec();
        let trailing = buf[(body_start + content_length).min(buf.len())..].to_vec();

        if is_upgrade {
            let upgrade_req = UpgradeRequest { method, path: url.clone(), headers: headers.clone() };
            let _ = handle_upgrade(
                &upgrade_req,
                &ws_routes,
                ws_manager.clone(),
                |_conn, _negotiated| WsHandler {
                    rules: Vec::new(),
                    hooks: None,
                    heartbeat_interval_ms: Some(HEARTBEAT_INTERVAL_MS),
                    inactivity_timeout_ms: Some(INACTIVITY_TIMEOUT_MS),
                },
                stream,
                &trailing,
            )
            .await;
            return Ok(());
        }

        let req = Request::new(method, url).with_raw_body(body_bytes);
        let mut req = req;
        req.headers = headers;

        match engine.dispatch(req).await {
            DispatchOutcome::Response(resp) => {
                write_response(stream, resp).await?;
            }
            DispatchOutcome::Forward => {
                let mut resp = Response::new(404);
                resp.headers.insert("Content-Length", "0");
                write_response(stream, resp).await?;
            }
        }

        buf.clear();
    }
}

async fn write_response(stream: &mut TcpStream, resp: Response) -> std::io::Result<()> {
    resp.write_to(stream).await
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
