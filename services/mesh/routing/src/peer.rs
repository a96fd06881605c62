//! Two-node overlay over a queued secure link.

use std::collections::HashSet;

use async_trait::async_trait;
use mesh_link::{LinkReceiver, LinkSender};
use mesh_wire::Envelope;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::overlay::{Delivery, NodeId, Overlay, Scope};
use crate::OverlayError;

/// Overlay connecting the local node with exactly one peer.
///
/// Group deliveries reach the local inbox when the local node has announced
/// interest, and are always forwarded to the peer. Balanced deliveries stay
/// local when possible and go to the peer otherwise.
pub struct PeerOverlay {
    local: NodeId,
    peer: NodeId,
    link: LinkSender,
    inbox: mpsc::Sender<Delivery>,
    interest: RwLock<HashSet<(Scope, String)>>,
}

impl PeerOverlay {
    /// Create an overlay routing to `peer` through `link`
    pub fn new(
        local: NodeId,
        peer: NodeId,
        link: LinkSender,
        inbox: mpsc::Sender<Delivery>,
    ) -> Self {
        Self {
            local,
            peer,
            link,
            inbox,
            interest: RwLock::new(HashSet::new()),
        }
    }

    /// Identifier of the remote node
    pub fn peer_node(&self) -> NodeId {
        self.peer
    }

    async fn has_interest(&self, scope: Scope, name: &str) -> bool {
        self.interest
            .read()
            .await
            .contains(&(scope, name.to_string()))
    }

    async fn deliver_local(&self, envelope: Envelope) -> Result<(), OverlayError> {
        self.inbox
            .send(Delivery {
                src: self.local,
                envelope,
            })
            .await
            .map_err(|_| OverlayError::InboxClosed)
    }

    async fn deliver_peer(&self, envelope: Envelope) -> Result<(), OverlayError> {
        self.link.send(envelope).await?;
        Ok(())
    }
}

#[async_trait]
impl Overlay for PeerOverlay {
    fn local_node(&self) -> NodeId {
        self.local
    }

    async fn deliver_direct(&self, node: NodeId, envelope: Envelope) -> Result<(), OverlayError> {
        if node == self.local {
            self.deliver_local(envelope).await
        } else if node == self.peer {
            self.deliver_peer(envelope).await
        } else {
            Err(OverlayError::UnknownNode(node))
        }
    }

    async fn deliver_broadcast(
        &self,
        scope: Scope,
        name: &str,
        envelope: Envelope,
    ) -> Result<(), OverlayError> {
        if self.has_interest(scope, name).await {
            self.deliver_local(envelope.clone()).await?;
        }
        self.deliver_peer(envelope).await
    }

    async fn deliver_balance(
        &self,
        scope: Scope,
        name: &str,
        envelope: Envelope,
    ) -> Result<(), OverlayError> {
        if self.has_interest(scope, name).await {
            self.deliver_local(envelope).await
        } else {
            self.deliver_peer(envelope).await
        }
    }

    async fn subscribe(&self, scope: Scope, name: &str) -> Result<(), OverlayError> {
        debug!(%scope, name, "Announcing local interest");
        self.interest.write().await.insert((scope, name.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, scope: Scope, name: &str) -> Result<(), OverlayError> {
        debug!(%scope, name, "Withdrawing local interest");
        self.interest
            .write()
            .await
            .remove(&(scope, name.to_string()));
        Ok(())
    }
}

/// Pump envelopes arriving on `link` into the node inbox, tagged with `peer`.
///
/// Returns the link failure reason when the link died, or `None` when it
/// closed cleanly or the inbox went away.
pub async fn forward_link(
    mut link: LinkReceiver,
    peer: NodeId,
    inbox: mpsc::Sender<Delivery>,
) -> Option<String> {
    while let Some(envelope) = link.recv().await {
        if inbox
            .send(Delivery {
                src: peer,
                envelope,
            })
            .await
            .is_err()
        {
            debug!(%peer, "Node inbox closed, stopping link forwarder");
            return None;
        }
    }

    let failure = link.failure();
    match &failure {
        Some(reason) => warn!(%peer, "Link to peer failed: {}", reason),
        None => info!(%peer, "Link to peer closed"),
    }
    failure
}
