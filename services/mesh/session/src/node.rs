//! A mesh node: owns the attached sessions and dispatches inbound envelopes.
//!
//! Inbound deliveries are dispatched sequentially from [`Node::serve`], so
//! envelopes for one destination (a session's broadcast worker, a
//! subscription, a tunnel) keep their arrival order. Anything that may wait
//! on the overlay or on application code runs on its own task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mesh_routing::{Delivery, NodeId, Overlay, Scope, TopicRouter};
use mesh_wire::{Envelope, Header, ReplyStatus};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::handler::ConnectionHandler;
use crate::session::{Session, SessionInner};
use crate::workers::WorkerQueue;
use crate::{DispatchError, RequestError, SessionError};

/// State shared between a node and its sessions
pub(crate) struct NodeShared {
    pub(crate) config: SessionConfig,
    pub(crate) overlay: Arc<dyn Overlay>,
    pub(crate) sessions: RwLock<HashMap<u64, Arc<SessionInner>>>,
    pub(crate) clusters: TopicRouter<Arc<SessionInner>>,
    pub(crate) topics: TopicRouter<WorkerQueue>,
    next_session: AtomicU64,
    request_slots: Arc<Semaphore>,
}

impl NodeShared {
    /// Whether `id` was handed out by this node at some point
    fn ever_allocated(&self, id: u64) -> bool {
        id != 0 && id < self.next_session.load(Ordering::Acquire)
    }
}

/// Session multiplexer for one mesh node
pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    /// Create a node delivering through `overlay`
    pub fn new(config: SessionConfig, overlay: Arc<dyn Overlay>) -> Self {
        let request_slots = Arc::new(Semaphore::new(config.request_workers.max(1)));
        info!(node = %overlay.local_node(), "Mesh node created");
        Self {
            shared: Arc::new(NodeShared {
                config,
                overlay,
                sessions: RwLock::new(HashMap::new()),
                clusters: TopicRouter::new(),
                topics: TopicRouter::new(),
                next_session: AtomicU64::new(1),
                request_slots,
            }),
        }
    }

    /// Identifier of this node
    pub fn local_node(&self) -> NodeId {
        self.shared.overlay.local_node()
    }

    /// Session layer configuration
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Number of attached sessions
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    /// Number of topics with local subscribers
    pub async fn topic_count(&self) -> usize {
        self.shared.topics.topic_count().await
    }

    /// Attach an application under `cluster`
    pub async fn attach(
        &self,
        cluster: &str,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Session, SessionError> {
        let id = self.shared.next_session.fetch_add(1, Ordering::AcqRel);
        let inner = SessionInner::new(id, cluster, handler, self.shared.clone());

        self.shared.sessions.write().await.insert(id, inner.clone());
        if self.shared.clusters.subscribe(cluster, id, inner.clone()).await? {
            if let Err(e) = self.shared.overlay.subscribe(Scope::Cluster, cluster).await {
                inner.teardown().await;
                return Err(e.into());
            }
        }

        info!(session = id, cluster, "Session attached");
        Ok(Session::new(inner))
    }

    /// Close every attached session, notifying their handlers
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.shared.sessions.read().await.values().cloned().collect();
        info!(count = sessions.len(), "Shutting down mesh node");
        for session in sessions {
            session.drop_with("node shutdown").await;
        }
    }

    /// Dispatch deliveries from `inbox` until it closes.
    ///
    /// Returns the first protocol violation; the caller should drop the link
    /// that produced it.
    pub async fn serve(&self, mut inbox: mpsc::Receiver<Delivery>) -> Result<(), DispatchError> {
        while let Some(delivery) = inbox.recv().await {
            if let Err(e) = self.dispatch(delivery).await {
                error!("Protocol violation: {}", e);
                return Err(e);
            }
        }
        debug!("Node inbox closed");
        Ok(())
    }

    /// Dispatch one inbound delivery
    pub async fn dispatch(&self, delivery: Delivery) -> Result<(), DispatchError> {
        let Delivery { src, envelope } = delivery;
        let Envelope { header, payload } = envelope;
        debug!(%src, opcode = ?header.opcode(), "Dispatching envelope");

        match header {
            Header::Broadcast { topic } => {
                for session in self.shared.clusters.publish(&topic).await {
                    session.enqueue_broadcast(payload.clone());
                }
            }
            Header::Publish { topic } => {
                for queue in self.shared.topics.publish(&topic).await {
                    queue.offer(payload.clone());
                }
            }
            Header::Request {
                topic,
                src_session,
                request_id,
                timeout,
            } => match self.shared.clusters.balance(&topic).await {
                Some(session) => self.spawn_request(session, src, src_session, request_id, timeout, payload),
                None => debug!(cluster = %topic, "Dropping request for cluster without sessions"),
            },
            Header::Reply {
                dst_session,
                request_id,
                status,
            } => {
                if let Some(session) = self.session(dst_session).await? {
                    let result = match status {
                        ReplyStatus::Ok => Ok(payload),
                        ReplyStatus::Failed => Err(String::from_utf8_lossy(&payload).into_owned()),
                    };
                    session.requests.resolve(request_id, result).await;
                }
            }
            Header::TunnelInit {
                topic,
                src_session,
                tunnel_id,
                buffer,
                ..
            } => match self.shared.clusters.balance(&topic).await {
                Some(session) => session.accept_tunnel(src, src_session, tunnel_id, buffer).await,
                None => debug!(cluster = %topic, "Dropping tunnel request for cluster without sessions"),
            },
            Header::TunnelConfirm {
                dst_session,
                tunnel_id,
                peer_session,
                peer_tunnel,
                buffer,
            } => {
                if let Some(session) = self.session(dst_session).await? {
                    session
                        .confirm_tunnel(src, tunnel_id, peer_session, peer_tunnel, buffer)
                        .await;
                }
            }
            Header::TunnelData {
                dst_session,
                tunnel_id,
            } => {
                if let Some(session) = self.session(dst_session).await? {
                    match session.tunnels.get(tunnel_id).await {
                        Some(tunnel) => tunnel.deliver(payload).map_err(|_| {
                            DispatchError::WindowExceeded {
                                session: dst_session,
                                tunnel: tunnel_id,
                            }
                        })?,
                        None => debug!(tunnel = tunnel_id, "Dropping data for unknown tunnel"),
                    }
                }
            }
            Header::TunnelAck {
                dst_session,
                tunnel_id,
            } => {
                if let Some(session) = self.session(dst_session).await? {
                    if let Some(tunnel) = session.tunnels.get(tunnel_id).await {
                        tunnel.ack();
                    }
                }
            }
            Header::TunnelClose {
                dst_session,
                tunnel_id,
            } => {
                if let Some(session) = self.session(dst_session).await? {
                    if let Some(tunnel) = session.tunnels.get(tunnel_id).await {
                        tunnel.close_remote().await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a direct destination.
    ///
    /// Sessions that existed but have since closed are an expected race;
    /// ids this node never issued are a protocol violation.
    async fn session(&self, id: u64) -> Result<Option<Arc<SessionInner>>, DispatchError> {
        if let Some(session) = self.shared.sessions.read().await.get(&id) {
            return Ok(Some(session.clone()));
        }
        if self.shared.ever_allocated(id) {
            debug!(session = id, "Dropping envelope for closed session");
            return Ok(None);
        }
        Err(DispatchError::UnknownSession(id))
    }

    fn spawn_request(
        &self,
        session: Arc<SessionInner>,
        src: NodeId,
        src_session: u64,
        request_id: u64,
        timeout: Duration,
        payload: Bytes,
    ) {
        let slots = self.shared.request_slots.clone();
        let overlay = self.shared.overlay.clone();

        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };

            let (status, body) = match session.handler.handle_request(payload, timeout).await {
                Ok(reply) => (ReplyStatus::Ok, reply),
                Err(RequestError::Timeout) | Err(RequestError::Terminating) => {
                    debug!(session = session.id, request_id, "Request abandoned without reply");
                    return;
                }
                Err(e) => (ReplyStatus::Failed, Bytes::from(e.failure_message())),
            };

            let reply = Envelope::new(
                Header::Reply {
                    dst_session: src_session,
                    request_id,
                    status,
                },
                body,
            );
            if let Err(e) = overlay.deliver_direct(src, reply).await {
                warn!(%src, request_id, "Failed to deliver reply: {}", e);
            }
        });
    }
}
