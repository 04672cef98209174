//! Message framing for the vela overlay protocol.
//!
//! Each message on the wire is prefixed with a 4-byte big-endian length
//! field:
//!
//! ```text
//! +------------------+--------------------+
//! | Length (4 bytes) |    Message Body    |
//! +------------------+--------------------+
//! ```
//!
//! # Length Field Format
//!
//! - **Bit 31 (MSB)**: Reserved continuation flag. The encoder sets it to
//!   mark the frame as the last record of the message; the decoder masks it
//!   off before interpreting the length.
//! - **Bits 0-30**: Message body length in bytes.
//!
//! # Message Size Limits
//!
//! - Before the handshake completes: 4 KiB ([`MAX_UNAUTH_MESSAGE_SIZE`])
//! - Afterwards: 16 MiB ([`MAX_MESSAGE_SIZE`])
//!
//! A zero length is a protocol error in both cases. Violations surface as
//! decode errors, which cost the remote its connection.

use crate::{OverlayError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum message body size (16 MiB) once the peer is authenticated.
pub const MAX_MESSAGE_SIZE: usize = 0x100_0000;

/// Maximum message body size (4 KiB) before authentication completes.
pub const MAX_UNAUTH_MESSAGE_SIZE: usize = 0x1000;

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Continuation flag carried in the top bit of the length prefix.
const LAST_RECORD_FLAG: u32 = 0x8000_0000;

/// Codec for length-prefixed overlay frames.
///
/// Implements tokio's `Decoder` and `Encoder` over raw frame bodies. The
/// decoder is a two-state machine (length, then body) and only reserves the
/// body allocation after the length has passed validation, so a hostile
/// header cannot trigger an oversized allocation.
///
/// The decoder's size limit depends on whether the peer has authenticated;
/// the transport refreshes that via [`set_authenticated`](Self::set_authenticated)
/// as the connection advances.
#[derive(Debug, Default)]
pub struct MessageCodec {
    decode_state: DecodeState,
    authenticated: bool,
}

#[derive(Debug, Default)]
enum DecodeState {
    /// Waiting for the 4-byte length prefix.
    #[default]
    ReadingLength,
    /// Have a validated length, waiting for the body.
    ReadingBody { len: usize },
}

impl MessageCodec {
    /// Creates a codec in the unauthenticated (4 KiB limit) state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the authentication state, selecting the inbound size limit.
    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    fn max_frame_size(&self) -> usize {
        if self.authenticated {
            MAX_MESSAGE_SIZE
        } else {
            MAX_UNAUTH_MESSAGE_SIZE
        }
    }

    /// Produces the full on-wire buffer for a payload: length prefix with
    /// the continuation flag set, followed by the payload bytes.
    pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
        if payload.is_empty() {
            return Err(OverlayError::Message(
                "refusing to frame an empty payload".to_string(),
            ));
        }
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(OverlayError::Message(format!(
                "message too large: {} bytes (limit: {})",
                payload.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u32(payload.len() as u32 | LAST_RECORD_FLAG);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }

    /// Decodes and validates a length prefix against the current size limit.
    pub fn decode_frame_length(&self, header: [u8; HEADER_SIZE]) -> Result<usize> {
        // Clear the continuation bit before interpreting the length.
        let length = (usize::from(header[0] & 0x7f) << 24)
            | (usize::from(header[1]) << 16)
            | (usize::from(header[2]) << 8)
            | usize::from(header[3]);

        if length == 0 {
            return Err(OverlayError::Message(
                "zero-length frame".to_string(),
            ));
        }
        if length > self.max_frame_size() {
            return Err(OverlayError::Message(format!(
                "message size unacceptable: {}{}",
                length,
                if self.authenticated {
                    ""
                } else {
                    " while not authenticated"
                }
            )));
        }
        Ok(length)
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            match self.decode_state {
                DecodeState::ReadingLength => {
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let len = self.decode_frame_length([src[0], src[1], src[2], src[3]])?;
                    src.advance(HEADER_SIZE);
                    src.reserve(len);
                    self.decode_state = DecodeState::ReadingBody { len };
                }
                DecodeState::ReadingBody { len } => {
                    if src.len() < len {
                        return Ok(None);
                    }

                    let body = src.split_to(len).freeze();
                    self.decode_state = DecodeState::ReadingLength;
                    return Ok(Some(body));
                }
            }
        }
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = OverlayError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        let frame = Self::encode_frame(&payload)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
