//! permessage-deflate codec (C12) — spec §4.10/§4.12. Raw DEFLATE framing
//! per RFC 7692: the trailing 0x00 0x00 0xFF 0xFF is stripped on compress
//! and re-appended before inflate.

use crate::error::{EngineError, Result};
use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Write;

const TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Per-direction compressor. When `no_context_takeover` is set a fresh
/// encoder is created for every message instead of carrying the sliding
/// window across messages.
pub struct DeflateEncoderState {
    encoder: Option<DeflateEncoder<Vec<u8>>>,
    no_context_takeover: bool,
}

impl DeflateEncoderState {
    pub fn new(no_context_takeover: bool) -> Self {
        DeflateEncoderState {
            encoder: if no_context_takeover { None } else { Some(DeflateEncoder::new(Vec::new(), Compression::default())) },
            no_context_takeover,
        }
    }

    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if self.no_context_takeover {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(payload).map_err(|e| EngineError::Internal(format!("deflate compress failed: {e}")))?;
            let out = enc.finish().map_err(|e| EngineError::Internal(format!("deflate flush failed: {e}")))?;
            return Ok(strip_trailer(out));
        }

        let enc = self.encoder.get_or_insert_with(|| DeflateEncoder::new(Vec::new(), Compression::default()));
        enc.write_all(payload).map_err(|e| EngineError::Internal(format!("deflate compress failed: {e}")))?;
        enc.flush().map_err(|e| EngineError::Internal(format!("deflate flush failed: {e}")))?;
        let out = std::mem::take(enc.get_mut());
        Ok(strip_trailer(out))
    }
}

fn strip_trailer(mut data: Vec<u8>) -> Vec<u8> {
    if data.ends_with(&TRAILER) {
        data.truncate(data.len() - TRAILER.len());
    }
    data
}

/// Per-direction decompressor, mirroring `DeflateEncoderState`'s
/// context-takeover policy.
pub struct DeflateDecoderState {
    decoder: Option<DeflateDecoder<Vec<u8>>>,
    no_context_takeover: bool,
}

impl DeflateDecoderState {
    pub fn new(no_context_takeover: bool) -> Self {
        DeflateDecoderState {
            decoder: if no_context_takeover { None } else { Some(DeflateDecoder::new(Vec::new())) },
            no_context_takeover,
        }
    }

    pub fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut input = payload.to_vec();
        input.extend_from_slice(&TRAILER);

        if self.no_context_takeover {
            let mut dec = DeflateDecoder::new(Vec::new());
            dec.write_all(&input).map_err(|_| EngineError::client(1002, "invalid compressed frame"))?;
            return dec.finish().map_err(|_| EngineError::client(1002, "invalid compressed frame"));
        }

        let dec = self.decoder.get_or_insert_with(|| DeflateDecoder::new(Vec::new()));
        dec.write_all(&input).map_err(|_| EngineError::client(1002, "invalid compressed frame"))?;
        dec.flush().map_err(|_| EngineError::client(1002, "invalid compressed frame"))?;
        Ok(std::mem::take(dec.get_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_context_takeover() {
        let mut enc = DeflateEncoderState::new(false);
        let mut dec = DeflateDecoderState::new(false);
        for msg in ["hello", "world", "permessage-deflate"] {
            let compressed = enc.compress(msg.as_bytes()).unwrap();
            let restored = dec.decompress(&compressed).unwrap();
            assert_eq!(restored, msg.as_bytes());
        }
    }

    #[test]
    fn round_trips_without_context_takeover() {
        let mut enc = DeflateEncoderState::new(true);
        let mut dec = DeflateDecoderState::new(true);
        let compressed = enc.compress(b"no context takeover").unwrap();
        let restored = dec.decompress(&compressed).unwrap();
        assert_eq!(restored, b"no context takeover");
    }
}
