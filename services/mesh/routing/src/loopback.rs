//! Single-node overlay.

use async_trait::async_trait;
use mesh_wire::Envelope;
use tokio::sync::mpsc;
use tracing::debug;

use crate::overlay::{Delivery, NodeId, Overlay, Scope};
use crate::OverlayError;

/// Overlay for a node without peers: every delivery returns to the local inbox
pub struct LoopbackOverlay {
    node: NodeId,
    inbox: mpsc::Sender<Delivery>,
}

impl LoopbackOverlay {
    /// Create a loopback overlay feeding `inbox`
    pub fn new(node: NodeId, inbox: mpsc::Sender<Delivery>) -> Self {
        Self { node, inbox }
    }

    async fn loop_back(&self, envelope: Envelope) -> Result<(), OverlayError> {
        self.inbox
            .send(Delivery {
                src: self.node,
                envelope,
            })
            .await
            .map_err(|_| OverlayError::InboxClosed)
    }
}

#[async_trait]
impl Overlay for LoopbackOverlay {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn deliver_direct(&self, node: NodeId, envelope: Envelope) -> Result<(), OverlayError> {
        if node != self.node {
            return Err(OverlayError::UnknownNode(node));
        }
        self.loop_back(envelope).await
    }

    async fn deliver_broadcast(
        &self,
        _scope: Scope,
        _name: &str,
        envelope: Envelope,
    ) -> Result<(), OverlayError> {
        self.loop_back(envelope).await
    }

    async fn deliver_balance(
        &self,
        _scope: Scope,
        _name: &str,
        envelope: Envelope,
    ) -> Result<(), OverlayError> {
        self.loop_back(envelope).await
    }

    async fn subscribe(&self, scope: Scope, name: &str) -> Result<(), OverlayError> {
        debug!(%scope, name, "Loopback interest registered");
        Ok(())
    }

    async fn unsubscribe(&self, scope: Scope, name: &str) -> Result<(), OverlayError> {
        debug!(%scope, name, "Loopback interest withdrawn");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::Header;

    #[tokio::test]
    async fn test_loopback_returns_to_inbox() {
        let (tx, mut rx) = mpsc::channel(4);
        let overlay = LoopbackOverlay::new(NodeId(7), tx);

        let envelope = Envelope::control(Header::Broadcast {
            topic: "c".to_string(),
        });
        overlay
            .deliver_broadcast(Scope::Cluster, "c", envelope.clone())
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.src, NodeId(7));
        assert_eq!(delivery.envelope, envelope);
    }

    #[tokio::test]
    async fn test_loopback_rejects_foreign_node() {
        let (tx, _rx) = mpsc::channel(4);
        let overlay = LoopbackOverlay::new(NodeId(1), tx);
        let envelope = Envelope::control(Header::TunnelAck {
            dst_session: 1,
            tunnel_id: 1,
        });
        assert!(matches!(
            overlay.deliver_direct(NodeId(2), envelope).await,
            Err(OverlayError::UnknownNode(NodeId(2)))
        ));
    }
}
