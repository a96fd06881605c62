//! Envelope framing, opcodes and header encoding/decoding for mesh sessions.
//!
//! This crate provides the plaintext message format carried inside secure
//! links: a tagged header selected by an opcode, followed by an opaque
//! application payload.
//!
//! ## Features
//!
//! - **Tagged Headers**: one variant per opcode with fixed fields
//! - **Exhaustive Decoding**: unknown opcodes are rejected, never guessed
//! - **Zero-Copy Payloads**: uses `Bytes`/`BytesMut` for minimal allocations
//! - **Strict Bounds**: size, topic and trailing-byte checks on decode

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;
pub mod header;

// Re-export main types
pub use envelope::{Envelope, MAX_ENVELOPE_SIZE};
pub use error::WireError;
pub use header::{Header, Opcode, ReplyStatus, MAX_TOPIC_LEN};
