//! Response writer (C9) — status/header/body emission, streaming, error
//! envelope. Spec §4.9, §6.

use crate::error::{reason_phrase, EngineError};
use crate::request::Headers;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Body of an outgoing response. `Stream` pipes an arbitrary async reader
/// through to the socket rather than buffering it in memory.
pub enum ResponseBody {
    Empty,
    Bytes(Vec<u8>),
    Stream(Box<dyn AsyncRead + Unpin + Send>),
}

pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: ResponseBody,
    ended: bool,
}

/// Error envelope shape from spec §4.9 / §6.
#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    status: u16,
    error: &'a str,
    message: &'a str,
    path: &'a str,
    timestamp: String,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Headers::new(),
            body: ResponseBody::Empty,
            ended: false,
        }
    }

    pub fn with_json(status: u16, value: &serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        let mut r = Response::new(status);
        r.headers.insert("Content-Type", "application/json");
        r.headers.insert("Content-Length", bytes.len().to_string());
        r.body = ResponseBody::Bytes(bytes);
        r
    }

    pub fn error_envelope(err: &EngineError, path: &str) -> Self {
        let status = err.status();
        let envelope = ErrorEnvelope {
            status,
            error: reason_phrase(status),
            message: &err.message(),
            path,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let bytes = serde_json::to_vec(&envelope).unwrap_or_default();
        let mut r = Response::new(status);
        // Writer removes upstream headers before emitting the error body
        // (spec §4.9): starting from a fresh Headers map achieves this.
        r.headers.insert("Content-Type", "application/json");
        r.headers.insert("Content-Length", bytes.len().to_string());
        r.body = ResponseBody::Bytes(bytes);
        r
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    /// Write status line, headers and body to `sink`. For a streamed body,
    /// the first chunk is read before anything is committed to the wire: if
    /// that read fails, the response downgrades to a 500 with "Failed to
    /// send stream data" instead of the originally intended status (spec
    /// §4.9). A failure after the status line is already committed
    /// surfaces as a plain I/O error — there's nothing left to downgrade.
    pub async fn write_to<W: AsyncWrite + Unpin>(mut self, sink: &mut W) -> std::io::Result<()> {
        if let ResponseBody::Stream(r) = &mut self.body {
            let mut buf = [0u8; 8192];
            match r.read(&mut buf).await {
                Ok(n) => {
                    self.write_head(sink).await?;
                    if n > 0 {
                        sink.write_all(&buf[..n]).await?;
                    }
                    loop {
                        let n = r.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        sink.write_all(&buf[..n]).await?;
                    }
                    sink.flush().await?;
                    self.ended = true;
                    return Ok(());
                }
                Err(_) => {
                    // Inlined rather than recursing into `write_to`: a
                    // second `Response` here would always carry a `Bytes`
                    // body, but async fns can't recurse into themselves
                    // without boxing the resulting future.
                    let err = EngineError::Internal("Failed to send stream data".to_string());
                    let failed = Response::error_envelope(&err, "");
                    failed.write_head(sink).await?;
                    if let ResponseBody::Bytes(b) = &failed.body {
                        sink.write_all(b).await?;
                    }
                    sink.flush().await?;
                    return Ok(());
                }
            }
        }

        self.write_head(sink).await?;
        if let ResponseBody::Bytes(b) = &self.body {
            sink.write_all(b).await?;
        }
        sink.flush().await?;
        self.ended = true;
        Ok(())
    }

    async fn write_head<W: AsyncWrite + Unpin>(&self, sink: &mut W) -> std::io::Result<()> {
        let reason = reason_phrase(self.status);
        let status_line = format!("HTTP/1.1 {} {}\r\n", self.status, reason);
        sink.write_all(status_line.as_bytes()).await?;
        for (name, value) in self.headers.iter() {
            sink.write_all(format!("{name}: {value}\r\n").as_bytes()).await?;
        }
        sink.write_all(b"\r\n").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_to_streams_a_reader_body_without_buffering_it_first() {
        let mut resp = Response::new(200);
        resp.headers.insert("Content-Type", "application/octet-stream");
        resp.body = ResponseBody::Stream(Box::new(std::io::Cursor::new(b"hello world".to_vec())));
        let mut out = Vec::new();
        resp.write_to(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello world"));
    }

    struct FailingReader;
    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("disk gone")))
        }
    }

    #[tokio::test]
    async fn write_to_downgrades_to_500_when_the_stream_read_fails() {
        let mut resp = Response::new(200);
        resp.body = ResponseBody::Stream(Box::new(FailingReader));
        let mut out = Vec::new();
        resp.write_to(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("Failed to send stream data"));
    }

    #[tokio::test]
    async fn write_to_writes_a_bytes_body_directly() {
        let resp = Response::with_json(200, &serde_json::json!({"ok": true}));
        let mut out = Vec::new();
        resp.write_to(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(r#"{"ok":true}"#));
    }
}
