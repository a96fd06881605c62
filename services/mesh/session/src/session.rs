//! Application sessions attached to a node.
//!
//! A session owns its outstanding requests, its tunnel setups and tunnels,
//! its topic subscriptions and a broadcast worker. Closing it fails every
//! pending wait with a terminating outcome, closes every tunnel and removes
//! all of its registrations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use mesh_routing::{NodeId, Scope};
use mesh_wire::{Envelope, Header};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::handler::{ConnectionHandler, SubscriptionHandler};
use crate::node::NodeShared;
use crate::pending::{Outcome, RequestTable};
use crate::tunnel::{Tunnel, TunnelInner, TunnelPeer, TunnelRegistry};
use crate::workers::{Target, WorkerQueue};
use crate::{RequestError, SessionError, TunnelError};

pub(crate) struct SessionInner {
    pub(crate) id: u64,
    cluster: String,
    pub(crate) handler: Arc<dyn ConnectionHandler>,
    node: Arc<NodeShared>,
    pub(crate) requests: RequestTable<Bytes>,
    setups: RequestTable<()>,
    pub(crate) tunnels: Arc<TunnelRegistry>,
    subscriptions: RwLock<HashMap<String, WorkerQueue>>,
    broadcasts: StdMutex<Option<WorkerQueue>>,
    terminate: watch::Sender<bool>,
    closed: AtomicBool,
}

impl SessionInner {
    pub(crate) fn new(
        id: u64,
        cluster: &str,
        handler: Arc<dyn ConnectionHandler>,
        node: Arc<NodeShared>,
    ) -> Arc<Self> {
        let broadcasts = WorkerQueue::spawn(
            format!("session-{}-broadcast", id),
            node.config.worker_backlog,
            Target::Broadcast(handler.clone()),
        );
        let (terminate, _) = watch::channel(false);

        Arc::new(Self {
            id,
            cluster: cluster.to_string(),
            handler,
            node,
            requests: RequestTable::new(),
            setups: RequestTable::new(),
            tunnels: TunnelRegistry::new(),
            subscriptions: RwLock::new(HashMap::new()),
            broadcasts: StdMutex::new(Some(broadcasts)),
            terminate,
            closed: AtomicBool::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn enqueue_broadcast(&self, msg: Bytes) {
        let queue = self.broadcasts.lock().ok().and_then(|q| q.clone());
        match queue {
            Some(queue) => {
                queue.offer(msg);
            }
            None => debug!(session = self.id, "Dropping broadcast for closed session"),
        }
    }

    fn window_for(&self, remote_buffer: u32) -> u32 {
        remote_buffer.min(self.node.config.tunnel_buffer).max(1)
    }

    /// Accept a tunnel requested by a remote session
    pub(crate) async fn accept_tunnel(
        self: &Arc<Self>,
        src: NodeId,
        src_session: u64,
        remote_tunnel: u64,
        remote_buffer: u32,
    ) {
        if self.is_closed() {
            debug!(session = self.id, "Ignoring tunnel request for closed session");
            return;
        }

        let id = self.setups.allocate();
        let buffer = self.node.config.tunnel_buffer;
        let tunnel = TunnelInner::new(id, self.id, buffer, self.node.overlay.clone(), &self.tunnels);
        let peer = TunnelPeer {
            node: src,
            session: src_session,
            tunnel: remote_tunnel,
        };
        tunnel.promote(peer, self.window_for(remote_buffer));
        self.tunnels.insert(tunnel.clone()).await;

        let confirm = Envelope::control(Header::TunnelConfirm {
            dst_session: src_session,
            tunnel_id: remote_tunnel,
            peer_session: self.id,
            peer_tunnel: id,
            buffer,
        });
        let overlay = self.node.overlay.clone();
        let handler = self.handler.clone();
        let session = self.id;
        tokio::spawn(async move {
            if let Err(e) = overlay.deliver_direct(src, confirm).await {
                warn!(session, tunnel = id, "Failed to confirm tunnel: {}", e);
                tunnel.close_remote().await;
                return;
            }
            debug!(session, tunnel = id, %src, "Tunnel accepted");
            handler.handle_tunnel(Tunnel::new(tunnel)).await;
        });
    }

    /// Complete a tunnel this session initiated
    pub(crate) async fn confirm_tunnel(
        &self,
        src: NodeId,
        tunnel_id: u64,
        peer_session: u64,
        peer_tunnel: u64,
        remote_buffer: u32,
    ) {
        let peer = TunnelPeer {
            node: src,
            session: peer_session,
            tunnel: peer_tunnel,
        };
        let promoted = match self.tunnels.get(tunnel_id).await {
            Some(tunnel) => tunnel.promote(peer, self.window_for(remote_buffer)),
            None => false,
        };

        if promoted {
            // A waiter that timed out meanwhile closes the tunnel itself
            self.setups.resolve(tunnel_id, Ok(())).await;
            return;
        }

        debug!(session = self.id, tunnel = tunnel_id, "Rejecting stray tunnel confirmation");
        let close = Envelope::control(Header::TunnelClose {
            dst_session: peer_session,
            tunnel_id: peer_tunnel,
        });
        let overlay = self.node.overlay.clone();
        tokio::spawn(async move {
            if let Err(e) = overlay.deliver_direct(src, close).await {
                debug!("Failed to reject stray tunnel: {}", e);
            }
        });
    }

    async fn open_tunnel(&self, cluster: &str, timeout: Duration) -> Result<Tunnel, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Terminating);
        }
        let timeout = timeout.min(self.node.config.tunnel_setup_timeout);

        let id = self.setups.allocate();
        let buffer = self.node.config.tunnel_buffer;
        let tunnel = TunnelInner::new(id, self.id, buffer, self.node.overlay.clone(), &self.tunnels);
        self.tunnels.insert(tunnel.clone()).await;
        let waiter = self.setups.register(id).await;

        let init = Envelope::control(Header::TunnelInit {
            topic: cluster.to_string(),
            src_session: self.id,
            tunnel_id: id,
            buffer,
            timeout,
        });
        if let Err(e) = self
            .node
            .overlay
            .deliver_balance(Scope::Cluster, cluster, init)
            .await
        {
            self.setups.release(id).await;
            tunnel.close().await;
            return Err(TunnelError::Delivery(e.to_string()));
        }

        let outcome = waiter.wait(timeout, self.terminate.subscribe()).await;
        self.setups.release(id).await;

        let failure = match outcome {
            Outcome::Reply(()) => {
                debug!(session = self.id, tunnel = id, cluster, "Tunnel established");
                return Ok(Tunnel::new(tunnel));
            }
            Outcome::TimedOut => TunnelError::Timeout,
            Outcome::Terminated => TunnelError::Terminating,
            Outcome::Failed(reason) => TunnelError::Delivery(reason),
        };
        tunnel.close().await;
        Err(failure)
    }

    async fn request(&self, cluster: &str, msg: Bytes, timeout: Duration) -> Result<Bytes, RequestError> {
        if self.is_closed() {
            return Err(RequestError::Terminating);
        }

        let id = self.requests.allocate();
        let waiter = self.requests.register(id).await;
        let envelope = Envelope::new(
            Header::Request {
                topic: cluster.to_string(),
                src_session: self.id,
                request_id: id,
                timeout,
            },
            msg,
        );
        if let Err(e) = self
            .node
            .overlay
            .deliver_balance(Scope::Cluster, cluster, envelope)
            .await
        {
            self.requests.release(id).await;
            return Err(RequestError::Delivery(e.to_string()));
        }

        let outcome = waiter.wait(timeout, self.terminate.subscribe()).await;
        self.requests.release(id).await;

        match outcome {
            Outcome::Reply(reply) => Ok(reply),
            Outcome::Failed(reason) => Err(RequestError::Failed(reason)),
            Outcome::TimedOut => Err(RequestError::Timeout),
            Outcome::Terminated => Err(RequestError::Terminating),
        }
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn SubscriptionHandler>) -> Result<(), SessionError> {
        // Held until registration finishes so teardown drains a complete entry
        let mut subscriptions = self.subscriptions.write().await;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if subscriptions.contains_key(topic) {
            return Err(SessionError::AlreadySubscribed(topic.to_string()));
        }

        let queue = WorkerQueue::spawn(
            format!("session-{}-topic-{}", self.id, topic),
            self.node.config.worker_backlog,
            Target::Event(handler),
        );
        subscriptions.insert(topic.to_string(), queue.clone());

        let first = match self.node.topics.subscribe(topic, self.id, queue).await {
            Ok(first) => first,
            Err(e) => {
                subscriptions.remove(topic);
                return Err(e.into());
            }
        };
        if first {
            if let Err(e) = self.node.overlay.subscribe(Scope::Topic, topic).await {
                subscriptions.remove(topic);
                if let Err(undo) = self.node.topics.unsubscribe(topic, self.id).await {
                    debug!(session = self.id, topic, "Subscription rollback failed: {}", undo);
                }
                return Err(e.into());
            }
        }
        debug!(session = self.id, topic, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.remove(topic).is_none() {
            return Err(SessionError::NotSubscribed(topic.to_string()));
        }
        self.leave(Scope::Topic, topic).await?;
        drop(subscriptions);
        debug!(session = self.id, topic, "Unsubscribed");
        Ok(())
    }

    /// Remove this session from a router, withdrawing overlay interest when
    /// it was the last local member
    async fn leave(&self, scope: Scope, name: &str) -> Result<(), SessionError> {
        let empty = match scope {
            Scope::Cluster => self.node.clusters.unsubscribe(name, self.id).await?,
            Scope::Topic => self.node.topics.unsubscribe(name, self.id).await?,
        };
        if empty {
            self.node.overlay.unsubscribe(scope, name).await?;
        }
        Ok(())
    }

    /// Tear the session down; only the first call has any effect
    pub(crate) async fn teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.terminate.send_replace(true);

        if let Err(e) = self.leave(Scope::Cluster, &self.cluster).await {
            debug!(session = self.id, "Cluster removal failed: {}", e);
        }

        {
            let mut subscriptions = self.subscriptions.write().await;
            for (topic, _) in subscriptions.drain() {
                if let Err(e) = self.leave(Scope::Topic, &topic).await {
                    debug!(session = self.id, topic, "Subscription removal failed: {}", e);
                }
            }
        }

        for tunnel in self.tunnels.snapshot().await {
            tunnel.close().await;
        }

        let requests = self.requests.clear().await;
        let setups = self.setups.clear().await;
        if let Ok(mut broadcasts) = self.broadcasts.lock() {
            broadcasts.take();
        }
        self.node.sessions.write().await.remove(&self.id);

        info!(
            session = self.id,
            cluster = %self.cluster,
            requests,
            setups,
            "Session closed"
        );
        true
    }

    /// Tear down on behalf of the node and notify the application
    pub(crate) async fn drop_with(&self, reason: &str) {
        if self.teardown().await {
            self.handler.handle_drop(reason).await;
        }
    }
}

/// Handle for an attached application
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Session id, unique within the node
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Cluster the session was attached under
    pub fn cluster(&self) -> &str {
        &self.inner.cluster
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Deliver `msg` to every session of `cluster` across the mesh
    pub async fn broadcast(&self, cluster: &str, msg: Bytes) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let envelope = Envelope::new(
            Header::Broadcast {
                topic: cluster.to_string(),
            },
            msg,
        );
        self.inner
            .node
            .overlay
            .deliver_broadcast(Scope::Cluster, cluster, envelope)
            .await?;
        Ok(())
    }

    /// Send `msg` to one session of `cluster` and wait up to `timeout` for
    /// its reply
    pub async fn request(&self, cluster: &str, msg: Bytes, timeout: Duration) -> Result<Bytes, RequestError> {
        self.inner.request(cluster, msg, timeout).await
    }

    /// Receive events published on `topic`
    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn SubscriptionHandler>) -> Result<(), SessionError> {
        self.inner.subscribe(topic, handler).await
    }

    /// Stop receiving events on `topic`
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        self.inner.unsubscribe(topic).await
    }

    /// Publish `msg` to every subscriber of `topic` across the mesh
    pub async fn publish(&self, topic: &str, msg: Bytes) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let envelope = Envelope::new(
            Header::Publish {
                topic: topic.to_string(),
            },
            msg,
        );
        self.inner
            .node
            .overlay
            .deliver_broadcast(Scope::Topic, topic, envelope)
            .await?;
        Ok(())
    }

    /// Open a tunnel to one session of `cluster`.
    ///
    /// Setup waits for `timeout`, capped by the configured setup timeout.
    pub async fn tunnel(&self, cluster: &str, timeout: Duration) -> Result<Tunnel, TunnelError> {
        self.inner.open_tunnel(cluster, timeout).await
    }

    /// Number of requests currently awaiting a reply
    pub async fn pending_requests(&self) -> usize {
        self.inner.requests.len().await
    }

    /// Number of tunnels registered on this session, live or in setup
    pub async fn tunnel_count(&self) -> usize {
        self.inner.tunnels.len().await
    }

    #[cfg(test)]
    pub(crate) async fn tunnel_ids(&self) -> Vec<u64> {
        self.inner.tunnels.snapshot().await.iter().map(|t| t.id()).collect()
    }

    /// Detach from the node; repeated calls are no-ops
    pub async fn close(&self) {
        self.inner.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::SessionConfig;
    use async_trait::async_trait;
    use mesh_routing::{Delivery, LoopbackOverlay, Overlay, OverlayError};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Notify};

    /// Answers requests only once released and keeps accepted tunnels open
    struct Stalled {
        release: Notify,
        dropped: AtomicUsize,
        tunnels: tokio::sync::Mutex<Vec<Tunnel>>,
    }

    #[async_trait]
    impl ConnectionHandler for Stalled {
        async fn handle_broadcast(&self, _msg: Bytes) {}

        async fn handle_request(&self, msg: Bytes, _timeout: Duration) -> Result<Bytes, RequestError> {
            self.release.notified().await;
            Ok(msg)
        }

        async fn handle_tunnel(&self, tunnel: Tunnel) {
            self.tunnels.lock().await.push(tunnel);
        }

        async fn handle_drop(&self, _reason: &str) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Ignore;

    #[async_trait]
    impl SubscriptionHandler for Ignore {
        async fn handle_event(&self, _msg: Bytes) {}
    }

    fn stalled() -> Arc<Stalled> {
        Arc::new(Stalled {
            release: Notify::new(),
            dropped: AtomicUsize::new(0),
            tunnels: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Loopback delivery that refuses to register topic interest
    struct NoTopics(LoopbackOverlay);

    #[async_trait]
    impl Overlay for NoTopics {
        fn local_node(&self) -> NodeId {
            self.0.local_node()
        }

        async fn deliver_direct(&self, node: NodeId, envelope: Envelope) -> Result<(), OverlayError> {
            self.0.deliver_direct(node, envelope).await
        }

        async fn deliver_broadcast(
            &self,
            scope: Scope,
            name: &str,
            envelope: Envelope,
        ) -> Result<(), OverlayError> {
            self.0.deliver_broadcast(scope, name, envelope).await
        }

        async fn deliver_balance(
            &self,
            scope: Scope,
            name: &str,
            envelope: Envelope,
        ) -> Result<(), OverlayError> {
            self.0.deliver_balance(scope, name, envelope).await
        }

        async fn subscribe(&self, scope: Scope, name: &str) -> Result<(), OverlayError> {
            match scope {
                Scope::Topic => Err(OverlayError::InboxClosed),
                Scope::Cluster => self.0.subscribe(scope, name).await,
            }
        }

        async fn unsubscribe(&self, scope: Scope, name: &str) -> Result<(), OverlayError> {
            self.0.unsubscribe(scope, name).await
        }
    }

    fn serving_node() -> (Arc<Node>, mpsc::Sender<Delivery>) {
        let (tx, rx) = mpsc::channel(256);
        let overlay = Arc::new(LoopbackOverlay::new(NodeId(1), tx.clone()));
        let node = Arc::new(Node::new(SessionConfig::default(), overlay));
        let server = node.clone();
        tokio::spawn(async move { server.serve(rx).await });
        (node, tx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_terminates_pending_requests() {
        let (node, _tx) = serving_node();
        let _server = node.attach("slow", stalled()).await.unwrap();
        let client = Arc::new(node.attach("client", stalled()).await.unwrap());

        let mut waits = Vec::new();
        for _ in 0..5 {
            let client = client.clone();
            waits.push(tokio::spawn(async move {
                client
                    .request("slow", Bytes::from_static(b"q"), Duration::from_secs(30))
                    .await
            }));
        }
        while client.pending_requests().await < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.close().await;
        for wait in waits {
            assert_eq!(wait.await.unwrap(), Err(RequestError::Terminating));
        }
        assert_eq!(client.pending_requests().await, 0);
        assert_eq!(
            client
                .request("slow", Bytes::new(), Duration::from_secs(1))
                .await,
            Err(RequestError::Terminating)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_closes_tunnels_and_clears_registrations() {
        let (node, _tx) = serving_node();
        let acceptor = node.attach("acceptor", stalled()).await.unwrap();
        let initiator = node.attach("initiator", stalled()).await.unwrap();
        initiator.subscribe("events", Arc::new(Ignore)).await.unwrap();

        let tunnel = initiator
            .tunnel("acceptor", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(initiator.tunnel_count().await, 1);

        initiator.close().await;
        initiator.close().await;
        assert!(initiator.is_closed());
        assert_eq!(tunnel.state(), crate::TunnelState::Closed);
        assert_eq!(initiator.tunnel_count().await, 0);
        assert_eq!(node.topic_count().await, 0);
        assert_eq!(node.session_count().await, 1);

        // The acceptor side learns about the close from the notification
        for _ in 0..200 {
            if acceptor.tunnel_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(acceptor.tunnel_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscription_bookkeeping() {
        let (node, _tx) = serving_node();
        let session = node.attach("c", stalled()).await.unwrap();

        session.subscribe("t", Arc::new(Ignore)).await.unwrap();
        assert!(matches!(
            session.subscribe("t", Arc::new(Ignore)).await,
            Err(SessionError::AlreadySubscribed(_))
        ));
        session.unsubscribe("t").await.unwrap();
        assert!(matches!(
            session.unsubscribe("t").await,
            Err(SessionError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_after_close_leaves_nothing_behind() {
        let (node, _tx) = serving_node();
        let session = node.attach("c", stalled()).await.unwrap();
        session.close().await;

        assert!(matches!(
            session.subscribe("late", Arc::new(Ignore)).await,
            Err(SessionError::Closed)
        ));
        assert_eq!(node.topic_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_racing_close_leaves_nothing_behind() {
        let (node, _tx) = serving_node();

        for round in 0..50 {
            let session = Arc::new(node.attach("c", stalled()).await.unwrap());
            let mut subscribers = Vec::new();
            for i in 0..8 {
                let session = session.clone();
                subscribers.push(tokio::spawn(async move {
                    session.subscribe(&format!("t{}-{}", round, i), Arc::new(Ignore)).await
                }));
            }
            tokio::task::yield_now().await;
            session.close().await;

            for subscriber in subscribers {
                match subscriber.await.unwrap() {
                    Ok(()) | Err(SessionError::Closed) => {}
                    Err(e) => panic!("unexpected subscribe failure: {}", e),
                }
            }
            assert_eq!(node.topic_count().await, 0, "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_rejected_topic_interest_rolls_back_subscription() {
        let (tx, rx) = mpsc::channel(256);
        let overlay = Arc::new(NoTopics(LoopbackOverlay::new(NodeId(1), tx.clone())));
        let node = Arc::new(Node::new(SessionConfig::default(), overlay));
        let server = node.clone();
        tokio::spawn(async move { server.serve(rx).await });

        let session = node.attach("c", stalled()).await.unwrap();
        assert!(matches!(
            session.subscribe("t", Arc::new(Ignore)).await,
            Err(SessionError::Overlay(OverlayError::InboxClosed))
        ));
        assert_eq!(node.topic_count().await, 0);

        // Nothing local remains, so a retry reaches the overlay again
        assert!(matches!(
            session.subscribe("t", Arc::new(Ignore)).await,
            Err(SessionError::Overlay(_))
        ));
        assert!(matches!(
            session.unsubscribe("t").await,
            Err(SessionError::NotSubscribed(_))
        ));
        assert_eq!(node.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_node_shutdown_notifies_handlers() {
        let (node, _tx) = serving_node();
        let handler = stalled();
        let session = node.attach("c", handler.clone()).await.unwrap();

        node.shutdown().await;
        assert!(session.is_closed());
        assert_eq!(handler.dropped.load(Ordering::SeqCst), 1);
        assert_eq!(node.session_count().await, 0);

        // Closing after the node already did is a no-op
        session.close().await;
        assert_eq!(handler.dropped.load(Ordering::SeqCst), 1);
    }
}
