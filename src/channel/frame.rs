//! KWS frame codec.
//!
//! KWS is a thin framed layer carried over KCP: each frame is a
//! big-endian `u16` opcode followed by the payload bytes. The first
//! client frame of a session uses `TEXT_SESSION` and carries a JSON
//! registration object (at least a `path` field); subsequent frames
//! use `TEXT_SIGNALLING`.

use crate::error::{AgentError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// First signaling frame of a session; JSON registration payload.
pub const OPCODE_TEXT_SESSION: u16 = 0x01;

/// Any signaling frame after the session frame.
pub const OPCODE_TEXT_SIGNALLING: u16 = 0x02;

/// One decoded KWS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: u16, payload: Bytes) -> Self {
        Self { opcode, payload }
    }

    /// Encode to wire bytes: `[opcode: u16 BE][payload]`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.payload.len());
        buf.put_u16(self.opcode);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from wire bytes. A frame shorter than the opcode header
    /// is a protocol error.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(AgentError::Protocol(format!(
                "kws frame too short: {} bytes",
                data.len()
            )));
        }
        let opcode = u16::from_be_bytes([data[0], data[1]]);
        Ok(Self {
            opcode,
            payload: Bytes::copy_from_slice(&data[2..]),
        })
    }

    pub fn is_session(&self) -> bool {
        self.opcode == OPCODE_TEXT_SESSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let frame = Frame::new(OPCODE_TEXT_SIGNALLING, Bytes::from_static(b"ping"));
        let wire = frame.encode();
        assert_eq!(&wire[..2], &[0x00, 0x02]);
        let decoded = Frame::decode(&wire).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(OPCODE_TEXT_SESSION, Bytes::new());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert!(decoded.is_session());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(Frame::decode(&[0x01]).is_err());
        assert!(Frame::decode(&[]).is_err());
    }
}
