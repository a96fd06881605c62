//! Envelope headers for the session protocol.
//!
//! Every envelope starts with a one byte opcode followed by the fixed fields
//! of that opcode. The header travels inside the encrypted link frame, so it
//! is never visible on the raw stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;

use crate::WireError;

/// Longest topic name accepted on the wire
pub const MAX_TOPIC_LEN: usize = 4096;

/// Envelope opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Broadcast to every subscriber of an application topic
    Broadcast = 0x00,
    /// Topic event for subscriptions
    Publish = 0x01,
    /// Request balanced to one subscriber
    Request = 0x02,
    /// Reply to a previous request
    Reply = 0x03,
    /// Tunnel setup request balanced to one subscriber
    TunnelInit = 0x04,
    /// Tunnel setup confirmation from the acceptor
    TunnelConfirm = 0x05,
    /// Tunnel data unit
    TunnelData = 0x06,
    /// Tunnel data acknowledgment (one credit)
    TunnelAck = 0x07,
    /// Tunnel teardown notification
    TunnelClose = 0x08,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Opcode::Broadcast),
            0x01 => Ok(Opcode::Publish),
            0x02 => Ok(Opcode::Request),
            0x03 => Ok(Opcode::Reply),
            0x04 => Ok(Opcode::TunnelInit),
            0x05 => Ok(Opcode::TunnelConfirm),
            0x06 => Ok(Opcode::TunnelData),
            0x07 => Ok(Opcode::TunnelAck),
            0x08 => Ok(Opcode::TunnelClose),
            _ => Err(WireError::Opcode(value)),
        }
    }
}

/// Outcome carried by a reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Payload is the reply
    Ok = 0,
    /// Payload is a failure reason reported by the remote application
    Failed = 1,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::Failed),
            _ => Err(WireError::Status(value)),
        }
    }
}

/// Envelope header, one variant per opcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Application broadcast
    Broadcast {
        /// Application topic the broadcast is addressed to
        topic: String,
    },
    /// Topic event
    Publish {
        /// Topic of the event
        topic: String,
    },
    /// Request/reply RPC call
    Request {
        /// Topic the request is balanced over
        topic: String,
        /// Session waiting for the reply on the origin node
        src_session: u64,
        /// Request id scoped to `src_session`
        request_id: u64,
        /// Time the origin is willing to wait
        timeout: Duration,
    },
    /// Reply to a request
    Reply {
        /// Session waiting for the reply
        dst_session: u64,
        /// Request id scoped to `dst_session`
        request_id: u64,
        /// Whether the payload is a reply or a failure reason
        status: ReplyStatus,
    },
    /// Tunnel setup request
    TunnelInit {
        /// Topic the tunnel request is balanced over
        topic: String,
        /// Initiating session
        src_session: u64,
        /// Temporary tunnel id on the initiator side
        tunnel_id: u64,
        /// Receive buffer offered by the initiator (in data units)
        buffer: u32,
        /// Time the initiator waits for the confirmation
        timeout: Duration,
    },
    /// Tunnel setup confirmation
    TunnelConfirm {
        /// Initiating session
        dst_session: u64,
        /// Temporary tunnel id on the initiator side
        tunnel_id: u64,
        /// Accepting session
        peer_session: u64,
        /// Tunnel id allocated by the acceptor
        peer_tunnel: u64,
        /// Negotiated window (in data units)
        buffer: u32,
    },
    /// Tunnel data unit
    TunnelData {
        /// Receiving session
        dst_session: u64,
        /// Tunnel id on the receiving side
        tunnel_id: u64,
    },
    /// Tunnel acknowledgment
    TunnelAck {
        /// Receiving session
        dst_session: u64,
        /// Tunnel id on the receiving side
        tunnel_id: u64,
    },
    /// Tunnel close notification
    TunnelClose {
        /// Receiving session
        dst_session: u64,
        /// Tunnel id on the receiving side
        tunnel_id: u64,
    },
}

impl Header {
    /// Opcode of this header
    pub fn opcode(&self) -> Opcode {
        match self {
            Header::Broadcast { .. } => Opcode::Broadcast,
            Header::Publish { .. } => Opcode::Publish,
            Header::Request { .. } => Opcode::Request,
            Header::Reply { .. } => Opcode::Reply,
            Header::TunnelInit { .. } => Opcode::TunnelInit,
            Header::TunnelConfirm { .. } => Opcode::TunnelConfirm,
            Header::TunnelData { .. } => Opcode::TunnelData,
            Header::TunnelAck { .. } => Opcode::TunnelAck,
            Header::TunnelClose { .. } => Opcode::TunnelClose,
        }
    }

    /// Destination session for directly addressed headers
    pub fn dst_session(&self) -> Option<u64> {
        match self {
            Header::Reply { dst_session, .. }
            | Header::TunnelConfirm { dst_session, .. }
            | Header::TunnelData { dst_session, .. }
            | Header::TunnelAck { dst_session, .. }
            | Header::TunnelClose { dst_session, .. } => Some(*dst_session),
            _ => None,
        }
    }

    /// Topic for topic addressed headers
    pub fn topic(&self) -> Option<&str> {
        match self {
            Header::Broadcast { topic }
            | Header::Publish { topic }
            | Header::Request { topic, .. }
            | Header::TunnelInit { topic, .. } => Some(topic),
            _ => None,
        }
    }

    /// Encode the header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u8(self.opcode() as u8);
        match self {
            Header::Broadcast { topic } | Header::Publish { topic } => {
                put_topic(buf, topic)?;
            }
            Header::Request {
                topic,
                src_session,
                request_id,
                timeout,
            } => {
                put_topic(buf, topic)?;
                buf.put_u64(*src_session);
                buf.put_u64(*request_id);
                buf.put_u64(millis(*timeout));
            }
            Header::Reply {
                dst_session,
                request_id,
                status,
            } => {
                buf.put_u64(*dst_session);
                buf.put_u64(*request_id);
                buf.put_u8(*status as u8);
            }
            Header::TunnelInit {
                topic,
                src_session,
                tunnel_id,
                buffer,
                timeout,
            } => {
                put_topic(buf, topic)?;
                buf.put_u64(*src_session);
                buf.put_u64(*tunnel_id);
                buf.put_u32(*buffer);
                buf.put_u64(millis(*timeout));
            }
            Header::TunnelConfirm {
                dst_session,
                tunnel_id,
                peer_session,
                peer_tunnel,
                buffer,
            } => {
                buf.put_u64(*dst_session);
                buf.put_u64(*tunnel_id);
                buf.put_u64(*peer_session);
                buf.put_u64(*peer_tunnel);
                buf.put_u32(*buffer);
            }
            Header::TunnelData {
                dst_session,
                tunnel_id,
            }
            | Header::TunnelAck {
                dst_session,
                tunnel_id,
            }
            | Header::TunnelClose {
                dst_session,
                tunnel_id,
            } => {
                buf.put_u64(*dst_session);
                buf.put_u64(*tunnel_id);
            }
        }
        Ok(())
    }

    /// Decode a header (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let opcode = Opcode::try_from(get_u8(buf)?)?;

        let header = match opcode {
            Opcode::Broadcast => Header::Broadcast {
                topic: get_topic(buf)?,
            },
            Opcode::Publish => Header::Publish {
                topic: get_topic(buf)?,
            },
            Opcode::Request => Header::Request {
                topic: get_topic(buf)?,
                src_session: get_u64(buf)?,
                request_id: get_u64(buf)?,
                timeout: Duration::from_millis(get_u64(buf)?),
            },
            Opcode::Reply => Header::Reply {
                dst_session: get_u64(buf)?,
                request_id: get_u64(buf)?,
                status: ReplyStatus::try_from(get_u8(buf)?)?,
            },
            Opcode::TunnelInit => Header::TunnelInit {
                topic: get_topic(buf)?,
                src_session: get_u64(buf)?,
                tunnel_id: get_u64(buf)?,
                buffer: get_u32(buf)?,
                timeout: Duration::from_millis(get_u64(buf)?),
            },
            Opcode::TunnelConfirm => Header::TunnelConfirm {
                dst_session: get_u64(buf)?,
                tunnel_id: get_u64(buf)?,
                peer_session: get_u64(buf)?,
                peer_tunnel: get_u64(buf)?,
                buffer: get_u32(buf)?,
            },
            Opcode::TunnelData => Header::TunnelData {
                dst_session: get_u64(buf)?,
                tunnel_id: get_u64(buf)?,
            },
            Opcode::TunnelAck => Header::TunnelAck {
                dst_session: get_u64(buf)?,
                tunnel_id: get_u64(buf)?,
            },
            Opcode::TunnelClose => Header::TunnelClose {
                dst_session: get_u64(buf)?,
                tunnel_id: get_u64(buf)?,
            },
        };
        Ok(header)
    }
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn put_topic(buf: &mut BytesMut, topic: &str) -> Result<(), WireError> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(WireError::Topic(topic.len()));
    }
    buf.put_u16(topic.len() as u16);
    buf.put_slice(topic.as_bytes());
    Ok(())
}

fn get_topic(buf: &mut Bytes) -> Result<String, WireError> {
    let len = get_u16(buf)? as usize;
    if len > MAX_TOPIC_LEN {
        return Err(WireError::Topic(len));
    }
    if buf.remaining() < len {
        return Err(WireError::Incomplete);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
}

fn get_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Incomplete);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Incomplete);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Incomplete);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Incomplete);
    }
    Ok(buf.get_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(header: Header) -> Header {
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        let mut bytes = buf.freeze();
        let decoded = Header::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        decoded
    }

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::try_from(0x00).unwrap(), Opcode::Broadcast);
        assert_eq!(Opcode::try_from(0x08).unwrap(), Opcode::TunnelClose);
        assert_eq!(Opcode::try_from(0x09), Err(WireError::Opcode(0x09)));
        assert_eq!(Opcode::try_from(0xFF), Err(WireError::Opcode(0xFF)));
    }

    #[test]
    fn test_request_header_roundtrip() {
        let header = Header::Request {
            topic: "calc".to_string(),
            src_session: 7,
            request_id: 42,
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(roundtrip(header.clone()), header);
        assert_eq!(header.opcode(), Opcode::Request);
        assert_eq!(header.topic(), Some("calc"));
        assert_eq!(header.dst_session(), None);
    }

    #[test]
    fn test_tunnel_confirm_roundtrip() {
        let header = Header::TunnelConfirm {
            dst_session: 1,
            tunnel_id: 2,
            peer_session: 3,
            peer_tunnel: 4,
            buffer: 64,
        };
        assert_eq!(roundtrip(header.clone()), header);
        assert_eq!(header.dst_session(), Some(1));
        assert_eq!(header.topic(), None);
    }

    #[test]
    fn test_truncated_header() {
        let header = Header::Reply {
            dst_session: 9,
            request_id: 10,
            status: ReplyStatus::Failed,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();

        let mut short = buf.freeze().slice(..10);
        assert_eq!(Header::decode(&mut short), Err(WireError::Incomplete));
    }

    #[test]
    fn test_invalid_reply_status() {
        let mut buf = BytesMut::new();
        buf.put_u8(Opcode::Reply as u8);
        buf.put_u64(1);
        buf.put_u64(2);
        buf.put_u8(7);
        assert_eq!(
            Header::decode(&mut buf.freeze()),
            Err(WireError::Status(7))
        );
    }

    #[test]
    fn test_topic_limits() {
        let header = Header::Publish {
            topic: "x".repeat(MAX_TOPIC_LEN + 1),
        };
        let mut buf = BytesMut::new();
        assert_eq!(
            header.encode(&mut buf),
            Err(WireError::Topic(MAX_TOPIC_LEN + 1))
        );

        let mut buf = BytesMut::new();
        buf.put_u8(Opcode::Publish as u8);
        buf.put_u16(2);
        buf.put_slice(&[0xC3, 0x28]);
        assert_eq!(Header::decode(&mut buf.freeze()), Err(WireError::Utf8));
    }
}
