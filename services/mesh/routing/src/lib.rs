//! Overlay delivery and local topic fan-out for mesh nodes.
//!
//! This crate provides the collaborator a node uses to reach other nodes,
//! together with the in-process router that resolves group names to locally
//! attached subscribers.
//!
//! ## Components
//!
//! - [`Overlay`]: deliver to a node, to every interested node, or to one
//! - [`LoopbackOverlay`]: single-node deployments and tests
//! - [`PeerOverlay`]: two nodes joined by a queued secure link
//! - [`TopicRouter`]: name to subscriber fan-out with uniform balancing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod loopback;
pub mod overlay;
pub mod peer;
pub mod topics;

pub use error::{OverlayError, RouterError};
pub use loopback::LoopbackOverlay;
pub use overlay::{Delivery, NodeId, Overlay, Scope};
pub use peer::{forward_link, PeerOverlay};
pub use topics::TopicRouter;
