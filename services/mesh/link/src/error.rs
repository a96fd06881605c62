//! Link error types.

use mesh_wire::WireError;
use thiserror::Error;

/// Secure link errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Frame MAC did not verify
    #[error("frame authentication failed")]
    Authentication,

    /// Frame or envelope could not be parsed
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    /// Underlying stream failed
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    /// Key material source could not provide the key slots
    #[error("key material unavailable")]
    KeyMaterial,

    /// Stream cipher ran out of keystream
    #[error("keystream exhausted")]
    Exhausted,

    /// Link was closed (locally or by the peer)
    #[error("link closed")]
    Closed,

    /// Link failed earlier and is permanently unusable
    #[error("link is dead: {0}")]
    Dead(String),
}

impl LinkError {
    /// Whether the error leaves the link unusable
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkError::KeyMaterial)
    }
}
