//! Session layer errors.

use mesh_routing::{OverlayError, RouterError};
use thiserror::Error;

/// Outcome of a failed request, on either side of the exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No reply arrived in time
    #[error("request timed out")]
    Timeout,

    /// The session was torn down while waiting
    #[error("session terminating")]
    Terminating,

    /// The remote application reported a failure
    #[error("remote failure: {0}")]
    Failed(String),

    /// The request could not be handed to the overlay
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl RequestError {
    /// Text sent back to the requester when a handler fails
    pub fn failure_message(&self) -> String {
        match self {
            RequestError::Failed(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Tunnel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Setup, send or receive did not complete in time
    #[error("tunnel operation timed out")]
    Timeout,

    /// The tunnel is closed and fully drained
    #[error("tunnel closed")]
    Closed,

    /// The owning session was torn down during setup
    #[error("session terminating")]
    Terminating,

    /// A message could not be handed to the overlay
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Session management errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session has been closed
    #[error("session closed")]
    Closed,

    /// The session already subscribes to the topic
    #[error("already subscribed to '{0}'")]
    AlreadySubscribed(String),

    /// The session does not subscribe to the topic
    #[error("not subscribed to '{0}'")]
    NotSubscribed(String),

    /// Router bookkeeping failed
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// The overlay rejected a delivery or registration
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),
}

/// Protocol violations detected while dispatching inbound envelopes.
///
/// Any of these means the delivering link is presumed faulty and should be
/// dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A direct envelope named a session that never existed on this node
    #[error("unknown destination session {0}")]
    UnknownSession(u64),

    /// The peer sent more tunnel data than the negotiated window
    #[error("tunnel {tunnel} of session {session} exceeded its window")]
    WindowExceeded {
        /// Destination session
        session: u64,
        /// Local tunnel id
        tunnel: u64,
    },
}
