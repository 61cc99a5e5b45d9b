//! Heartbeat frame carried on the dedicated data channel.
//!
//! The frame is the 4-byte ASCII tag `ping` followed by the sender's nonce as
//! an 8-byte big-endian integer. Nonces are monotone per sender per session.

use bytes::{BufMut, Bytes, BytesMut};

/// Label of the dedicated heartbeat data channel.
pub const HEARTBEAT_CHANNEL: &str = "heartbeat";

const TAG: &[u8; 4] = b"ping";
const FRAME_LEN: usize = TAG.len() + 8;

pub fn encode(nonce: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    buf.put_slice(TAG);
    buf.put_u64(nonce);
    buf.freeze()
}

/// Returns the nonce, or `None` when the frame is not a heartbeat.
pub fn decode(frame: &[u8]) -> Option<u64> {
    if frame.len() != FRAME_LEN || &frame[..TAG.len()] != TAG {
        return None;
    }
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&frame[TAG.len()..]);
    Some(u64::from_be_bytes(nonce))
}
