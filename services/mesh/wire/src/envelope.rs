//! Envelopes: one logical message unit exchanged over a link.
//!
//! ```text
//! +----------------------+----------------------------+
//! | header               | opcode + fixed fields      |
//! +----------------------+----------------------------+
//! | u32 payload_len      | length of payload          |
//! +----------------------+----------------------------+
//! | payload              | opaque application bytes   |
//! +----------------------+----------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::header::Header;
use crate::WireError;

/// Largest encoded envelope accepted by either side (16 MiB)
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Header plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Routing and control information
    pub header: Header,
    /// Application payload
    pub payload: Bytes,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(header: Header, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Create an envelope without payload
    pub fn control(header: Header) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Encode into a fresh buffer ready for in-place encryption
    pub fn encode(&self) -> Result<BytesMut, WireError> {
        let mut buf = BytesMut::with_capacity(64 + self.payload.len());
        self.header.encode(&mut buf)?;

        let total = buf.len() + 4 + self.payload.len();
        if total > MAX_ENVELOPE_SIZE {
            return Err(WireError::Size(total));
        }
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a complete envelope, rejecting leftovers
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() > MAX_ENVELOPE_SIZE {
            return Err(WireError::Size(buf.len()));
        }
        let header = Header::decode(&mut buf)?;

        if buf.remaining() < 4 {
            return Err(WireError::Incomplete);
        }
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() < payload_len {
            return Err(WireError::Incomplete);
        }
        let payload = buf.split_to(payload_len);
        if !buf.is_empty() {
            return Err(WireError::Trailing(buf.len()));
        }

        Ok(Self { header, payload })
    }
}
