//! Authenticated, encrypted point-to-point links between mesh nodes.
//!
//! A [`SecureLink`] wraps any bidirectional byte stream and exchanges
//! [`Envelope`](mesh_wire::Envelope)s with integrity, confidentiality and
//! ordering guarantees. Keys come from a [`KeyMaterial`] source shared by
//! both ends; the [`Role`] decides which half of the key schedule protects
//! each direction.
//!
//! ## Features
//!
//! - **Stream Encryption**: ChaCha20 keystream per direction
//! - **Chained Authentication**: running HMAC-SHA256 over every length and body
//! - **Direct Mode**: caller-driven send and receive
//! - **Queued Mode**: background workers behind bounded queues

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod error;
pub mod frame;
pub mod keys;
pub mod link;
pub mod queued;
pub mod transport;

// Re-export main types
pub use error::LinkError;
pub use keys::{HkdfKeyMaterial, KeyMaterial, Role, HKDF_INFO, HKDF_SALT};
pub use link::SecureLink;
pub use queued::{LinkCloser, LinkReceiver, LinkSender, QueuedLink, CLOSE_TIMEOUT};
pub use transport::{accept_link, connect_link, connect_tcp, listen_tcp};
