//! Routing and overlay errors.

use thiserror::Error;

use crate::overlay::NodeId;

/// Overlay delivery errors
#[derive(Error, Debug)]
pub enum OverlayError {
    /// No route to the requested node
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The underlying link is gone
    #[error("link unavailable: {0}")]
    Link(#[from] mesh_link::LinkError),

    /// The local node no longer accepts deliveries
    #[error("local inbox closed")]
    InboxClosed,
}

/// Topic router errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Subscriber already registered on the topic
    #[error("subscriber {id} already registered on '{topic}'")]
    AlreadySubscribed {
        /// Topic name
        topic: String,
        /// Subscriber id
        id: u64,
    },

    /// Subscriber not registered on the topic
    #[error("subscriber {id} not registered on '{topic}'")]
    NotSubscribed {
        /// Topic name
        topic: String,
        /// Subscriber id
        id: u64,
    },
}
