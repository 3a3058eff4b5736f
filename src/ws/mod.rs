//! WebSocket engine: handshake, framing, compression, connection
//! management, and per-frame dispatch. Spec §4.10-§4.14.

pub mod connection;
pub mod deflate;
pub mod dispatcher;
pub mod frame;
pub mod handshake;

pub use connection::{Connection, ConnectionManager, OutMessage};
pub use dispatcher::{InMessage, MessageHandler, ResponseRule, WsDispatcher, WsHandler};
pub use frame::{Frame, FrameParser};
pub use handshake::{
    build_handshake_response, match_route, Authenticate, DeflatePolicy, HandshakeResponse, NegotiatedDeflate,
    UpgradeRequest, WsRoute,
};
