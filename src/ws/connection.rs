//! WebSocket connection state and room-aware connection manager (C13) —
//! spec §3 supplement, §4.13.

use rustc_hash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ws::deflate::DeflateEncoderState;
use crate::ws::frame::{encode_frame, OPCODE_BINARY, OPCODE_CLOSE, OPCODE_PING, OPCODE_PONG, OPCODE_TEXT};

pub const MAX_MISSED_PONGS: u32 = 3;

/// Outbound frame, queued for the connection's writer task.
#[derive(Clone, Debug)]
pub enum OutMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(u16, String),
}

impl OutMessage {
    fn parts(&self) -> (u8, Vec<u8>) {
        match self {
            OutMessage::Text(s) => (OPCODE_TEXT, s.clone().into_bytes()),
            OutMessage::Binary(b) => (OPCODE_BINARY, b.clone()),
            OutMessage::Ping(b) => (OPCODE_PING, b.clone()),
            OutMessage::Pong(b) => (OPCODE_PONG, b.clone()),
            OutMessage::Close(code, reason) => {
                let mut payload = code.to_be_bytes().to_vec();
                payload.extend_from_slice(reason.as_bytes());
                (OPCODE_CLOSE, payload)
            }
        }
    }

    /// Renders the message to raw, uncompressed wire bytes. Used directly
    /// only when the connection has no negotiated deflate extension —
    /// [`Connection::render`] is the compression-aware entrypoint.
    pub fn to_wire(&self) -> Vec<u8> {
        let (opcode, payload) = self.parts();
        encode_frame(true, false, opcode, &payload)
    }
}

fn is_compressible(opcode: u8) -> bool {
    matches!(opcode, OPCODE_TEXT | OPCODE_BINARY)
}

/// A single live connection: identity, room membership, and a bounded
/// outbound queue drained by the socket's writer task.
pub struct Connection {
    pub id: Uuid,
    pub rooms: RwLock<Vec<String>>,
    sender: mpsc::Sender<OutMessage>,
    pub missed_pongs: AtomicU32,
    pub last_activity_ms: AtomicU64,
    /// Per-connection compressor for permessage-deflate, `None` when the
    /// extension wasn't negotiated. The codec isn't reentrant (spec §4.12),
    /// so access is always through this single mutex.
    deflate_encoder: Mutex<Option<DeflateEncoderState>>,
}

impl Connection {
    pub fn new(sender: mpsc::Sender<OutMessage>) -> Arc<Self> {
        Arc::new(Connection {
            id: Uuid::new_v4(),
            rooms: RwLock::new(Vec::new()),
            sender,
            missed_pongs: AtomicU32::new(0),
            last_activity_ms: AtomicU64::new(0),
            deflate_encoder: Mutex::new(None),
        })
    }

    pub fn set_deflate_encoder(&self, encoder: DeflateEncoderState) {
        *self.deflate_encoder.lock() = Some(encoder);
    }

    pub async fn send(&self, msg: OutMessage) -> Result<(), mpsc::error::SendError<OutMessage>> {
        self.sender.send(msg).await
    }

    /// Renders `msg` to wire bytes, compressing and setting rsv1 when this
    /// connection negotiated permessage-deflate and the opcode is
    /// compressible (spec §4.13 `send`: "applies deflate when negotiated,
    /// setting rsv1 on the resulting frame").
    pub fn render(&self, msg: &OutMessage) -> Vec<u8> {
        let (opcode, payload) = msg.parts();
        if is_compressible(opcode) {
            let mut guard = self.deflate_encoder.lock();
            if let Some(encoder) = guard.as_mut() {
                if let Ok(compressed) = encoder.compress(&payload) {
                    return encode_frame(true, true, opcode, &compressed);
                }
            }
        }
        encode_frame(true, false, opcode, &payload)
    }

    /// Resets the inactivity clock on any received frame (spec §4.13). Does
    /// *not* touch `missed_pongs` — that counter only resets on a received
    /// pong (or ping, which implies a live peer too), handled separately by
    /// the dispatcher's control-frame path.
    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn join(&self, room: impl Into<String>) {
        let room = room.into();
        let mut rooms = self.rooms.write();
        if !rooms.contains(&room) {
            rooms.push(room);
        }
    }

    pub fn leave(&self, room: &str) {
        self.rooms.write().retain(|r| r != room);
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.read().iter().any(|r| r == room)
    }
}

/// Registry of live connections, keyed by connection id. Broadcasts iterate
/// a snapshot so a connection dropping mid-broadcast cannot deadlock the
/// registry lock or panic the iteration (spec §3 supplement).
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<FxHashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager { connections: RwLock::new(FxHashMap::default()) }
    }

    pub fn add(&self, conn: Arc<Connection>) {
        self.connections.write().insert(conn.id, conn);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.write().remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn get_by_room(&self, room: &str) -> Vec<Arc<Connection>> {
        self.connections.read().values().filter(|c| c.in_room(room)).cloned().collect()
    }

    /// Sends `msg` to every connection in `room` (or every connection, if
    /// `room` is `None`). Individual send failures (queue closed/full) are
    /// swallowed — a slow or dead peer never blocks or aborts the broadcast.
    pub async fn broadcast(&self, room: Option<&str>, msg: OutMessage) {
        let targets = match room {
            Some(r) => self.get_by_room(r),
            None => self.get_all(),
        };
        for conn in targets {
            let _ = conn.send(msg.clone()).await;
        }
    }

    pub async fn close_all(&self, code: u16, reason: &str) {
        let targets = self.get_all();
        for conn in targets {
            let _ = conn.send(OutMessage::Close(code, reason.to_string())).await;
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_only_room_members() {
        let manager = ConnectionManager::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = Connection::new(tx_a);
        let b = Connection::new(tx_b);
        a.join("lobby");
        manager.add(a.clone());
        manager.add(b.clone());

        manager.broadcast(Some("lobby"), OutMessage::Text("hi".to_string())).await;

        assert!(matches!(rx_a.try_recv(), Ok(OutMessage::Text(s)) if s == "hi"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn render_compresses_text_frames_when_encoder_is_configured() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(tx);
        conn.set_deflate_encoder(DeflateEncoderState::new(false));

        let wire = conn.render(&OutMessage::Text("hello deflate".to_string()));
        let byte0 = wire[0];
        assert_eq!(byte0 & 0x40, 0x40, "rsv1 must be set on a compressed frame");

        let mut parser = super::super::frame::FrameParser::new();
        parser.push(&wire);
        let frame = parser.next_frame().unwrap();
        assert!(frame.rsv1);

        let mut decoder = crate::ws::deflate::DeflateDecoderState::new(false);
        let payload = decoder.decompress(&frame.payload).unwrap();
        assert_eq!(payload, b"hello deflate");
    }

    #[test]
    fn render_without_encoder_sends_raw_uncompressed_frame() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(tx);
        let wire = conn.render(&OutMessage::Text("plain".to_string()));
        assert_eq!(wire[0] & 0x40, 0, "rsv1 must stay clear with no negotiated deflate");
    }

    #[test]
    fn remove_drops_from_registry() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(tx);
        let id = conn.id;
        manager.add(conn);
        assert_eq!(manager.len(), 1);
        manager.remove(id);
        assert!(manager.is_empty());
    }
}
