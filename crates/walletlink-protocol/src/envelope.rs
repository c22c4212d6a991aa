//! Encrypted envelope -- the wire unit after the handshake.
//!
//! Frame payload layout:
//! ```text
//! +----------------+----------------------+------------------+
//! | sequence (u32) | ciphertext (n bytes) | auth tag (16 B)  |
//! +----------------+----------------------+------------------+
//! ```
//! The sequence is big-endian and authenticated as associated data.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{ProtocolError, AUTH_TAG_LEN};

const SEQUENCE_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sequence: u32,
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; AUTH_TAG_LEN],
}

impl Envelope {
    /// Serialize into a frame payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SEQUENCE_LEN + self.ciphertext.len() + AUTH_TAG_LEN);
        buf.put_u32(self.sequence);
        buf.extend_from_slice(&self.ciphertext);
        buf.extend_from_slice(&self.auth_tag);
        buf.freeze()
    }

    /// Parse a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < SEQUENCE_LEN + AUTH_TAG_LEN {
            return Err(ProtocolError::MalformedEnvelope(format!(
                "{} bytes is shorter than the envelope header",
                payload.len()
            )));
        }

        let sequence = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let tag_start = payload.len() - AUTH_TAG_LEN;
        let mut auth_tag = [0u8; AUTH_TAG_LEN];
        auth_tag.copy_from_slice(&payload[tag_start..]);

        Ok(Self {
            sequence,
            ciphertext: payload[SEQUENCE_LEN..tag_start].to_vec(),
            auth_tag,
        })
    }

    /// Associated data bound into the AEAD tag.
    pub fn aad(sequence: u32) -> [u8; SEQUENCE_LEN] {
        sequence.to_be_bytes()
    }
}
