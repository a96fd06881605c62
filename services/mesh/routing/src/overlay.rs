//! The overlay collaborator consumed by mesh nodes.
//!
//! An overlay decides which node receives a message addressed to a node id
//! or to a named group. Nodes only ever see it through [`Overlay`]; inbound
//! traffic arrives as a stream of [`Delivery`] values.

use async_trait::async_trait;
use mesh_wire::Envelope;
use std::fmt;

use crate::OverlayError;

/// Node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Namespace of a group name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Sessions attached under an application cluster name
    Cluster,
    /// Event subscriptions
    Topic,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Cluster => write!(f, "cluster"),
            Scope::Topic => write!(f, "topic"),
        }
    }
}

/// An envelope handed to a node by the overlay
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Node the envelope came from
    pub src: NodeId,
    /// The envelope itself
    pub envelope: Envelope,
}

/// Message delivery across the mesh
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Identifier of the local node
    fn local_node(&self) -> NodeId;

    /// Deliver to one specific node
    async fn deliver_direct(&self, node: NodeId, envelope: Envelope) -> Result<(), OverlayError>;

    /// Deliver to every node with interest in `name`
    async fn deliver_broadcast(
        &self,
        scope: Scope,
        name: &str,
        envelope: Envelope,
    ) -> Result<(), OverlayError>;

    /// Deliver to one node with interest in `name`
    async fn deliver_balance(
        &self,
        scope: Scope,
        name: &str,
        envelope: Envelope,
    ) -> Result<(), OverlayError>;

    /// Announce local interest in `name`
    async fn subscribe(&self, scope: Scope, name: &str) -> Result<(), OverlayError>;

    /// Withdraw local interest in `name`
    async fn unsubscribe(&self, scope: Scope, name: &str) -> Result<(), OverlayError>;
}
