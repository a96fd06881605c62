//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Field cut short (need more data)
    #[error("incomplete envelope")]
    Incomplete,

    /// Unknown opcode, the peer speaks something else
    #[error("unknown opcode {0:#04x}")]
    Opcode(u8),

    /// Unknown reply status
    #[error("unknown reply status {0}")]
    Status(u8),

    /// Topic longer than the protocol allows
    #[error("topic too long: {0} bytes")]
    Topic(usize),

    /// Topic is not valid UTF-8
    #[error("topic is not valid utf-8")]
    Utf8,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Bytes left over after the payload
    #[error("{0} trailing bytes after payload")]
    Trailing(usize),
}
