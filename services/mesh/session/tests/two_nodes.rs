//! Two nodes joined by a pair of queued secure links.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_link::{HkdfKeyMaterial, LinkCloser, Role, SecureLink};
use mesh_routing::{forward_link, NodeId, PeerOverlay};
use mesh_session::{
    ConnectionHandler, DispatchError, Node, RequestError, SessionConfig, SubscriptionHandler,
    Tunnel,
};
use rand::RngCore;
use tokio::io::duplex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const SECRET: &[u8] = b"two node integration secret";

struct MeshSide {
    node: Arc<Node>,
    closer: LinkCloser,
    serve: JoinHandle<Result<(), DispatchError>>,
    forward: JoinHandle<Option<String>>,
}

struct Mesh {
    a: MeshSide,
    b: MeshSide,
}

fn side<S>(link: SecureLink<S>, local: NodeId, peer: NodeId, config: &SessionConfig) -> MeshSide
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (sender, receiver, closer) = link.start(config.link_queue).split();
    let (inbox_tx, inbox_rx) = mpsc::channel(1024);
    let overlay = Arc::new(PeerOverlay::new(local, peer, sender, inbox_tx.clone()));
    let node = Arc::new(Node::new(config.clone(), overlay));

    let forward = tokio::spawn(forward_link(receiver, peer, inbox_tx));
    let server = node.clone();
    let serve = tokio::spawn(async move { server.serve(inbox_rx).await });

    MeshSide {
        node,
        closer,
        serve,
        forward,
    }
}

fn mesh(config: SessionConfig) -> Mesh {
    let (a, b) = duplex(256 * 1024);
    let link_a = SecureLink::new(a, &mut HkdfKeyMaterial::new(SECRET).unwrap(), Role::Client).unwrap();
    let link_b = SecureLink::new(b, &mut HkdfKeyMaterial::new(SECRET).unwrap(), Role::Server).unwrap();
    Mesh {
        a: side(link_a, NodeId(1), NodeId(2), &config),
        b: side(link_b, NodeId(2), NodeId(1), &config),
    }
}

#[derive(Default)]
struct Echo {
    broadcasts: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl ConnectionHandler for Echo {
    async fn handle_broadcast(&self, msg: Bytes) {
        self.broadcasts.lock().await.push(msg);
    }

    async fn handle_request(&self, msg: Bytes, _timeout: Duration) -> Result<Bytes, RequestError> {
        if msg.as_ref() == b"fail" {
            return Err(RequestError::Failed("rejected by echo".to_string()));
        }
        Ok(msg)
    }

    async fn handle_tunnel(&self, tunnel: Tunnel) {
        let timeout = Duration::from_secs(5);
        while let Ok(data) = tunnel.recv(timeout).await {
            if tunnel.send(data, timeout).await.is_err() {
                break;
            }
        }
    }
}

struct Collect(Mutex<Vec<Bytes>>);

#[async_trait]
impl SubscriptionHandler for Collect {
    async fn handle_event(&self, msg: Bytes) {
        self.0.lock().await.push(msg);
    }
}

async fn wait_for_len(items: &Mutex<Vec<Bytes>>, len: usize) {
    for _ in 0..500 {
        if items.lock().await.len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} items, got {}", len, items.lock().await.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_reply_across_nodes() {
    let mesh = mesh(SessionConfig::default());
    let _server = mesh.b.node.attach("echo", Arc::new(Echo::default())).await.unwrap();
    let client = mesh.a.node.attach("client", Arc::new(Echo::default())).await.unwrap();

    let timeout = Duration::from_secs(5);
    let reply = client
        .request("echo", Bytes::from_static(b"hello"), timeout)
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello"));

    let failed = client.request("echo", Bytes::from_static(b"fail"), timeout).await;
    assert_eq!(
        failed,
        Err(RequestError::Failed("rejected by echo".to_string()))
    );
    assert_eq!(client.pending_requests().await, 0);
    assert!(!mesh.a.serve.is_finished());
    assert!(!mesh.b.serve.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_correlated() {
    let mesh = mesh(SessionConfig::default());
    let _server = mesh.b.node.attach("echo", Arc::new(Echo::default())).await.unwrap();
    let client = Arc::new(mesh.a.node.attach("client", Arc::new(Echo::default())).await.unwrap());

    let mut calls = Vec::new();
    for i in 0..200u32 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let msg = Bytes::copy_from_slice(&i.to_be_bytes());
            let reply = client
                .request("echo", msg.clone(), Duration::from_secs(10))
                .await
                .unwrap();
            assert_eq!(reply, msg);
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_to_missing_cluster_times_out() {
    let mesh = mesh(SessionConfig::default());
    let client = mesh.a.node.attach("client", Arc::new(Echo::default())).await.unwrap();
    let result = client
        .request("nobody", Bytes::from_static(b"?"), Duration::from_millis(200))
        .await;
    assert_eq!(result, Err(RequestError::Timeout));
    assert_eq!(client.pending_requests().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_and_publish_reach_both_nodes() {
    let mesh = mesh(SessionConfig::default());
    let local = Arc::new(Echo::default());
    let remote = Arc::new(Echo::default());
    let local_session = mesh.a.node.attach("fan", local.clone()).await.unwrap();
    let remote_session = mesh.b.node.attach("fan", remote.clone()).await.unwrap();

    let local_events = Arc::new(Collect(Mutex::new(Vec::new())));
    let remote_events = Arc::new(Collect(Mutex::new(Vec::new())));
    local_session.subscribe("news", local_events.clone()).await.unwrap();
    remote_session.subscribe("news", remote_events.clone()).await.unwrap();

    local_session
        .broadcast("fan", Bytes::from_static(b"to everyone"))
        .await
        .unwrap();
    remote_session
        .publish("news", Bytes::from_static(b"headline"))
        .await
        .unwrap();

    wait_for_len(&local.broadcasts, 1).await;
    wait_for_len(&remote.broadcasts, 1).await;
    wait_for_len(&local_events.0, 1).await;
    wait_for_len(&remote_events.0, 1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(local.broadcasts.lock().await.len(), 1);
    assert_eq!(remote.broadcasts.lock().await.len(), 1);
    assert_eq!(local_events.0.lock().await.len(), 1);
    assert_eq!(remote_events.0.lock().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tunnel_transfer_across_nodes() {
    let mesh = mesh(SessionConfig {
        tunnel_buffer: 8,
        ..SessionConfig::default()
    });
    let _server = mesh.b.node.attach("echo", Arc::new(Echo::default())).await.unwrap();
    let client = mesh.a.node.attach("client", Arc::new(Echo::default())).await.unwrap();

    let timeout = Duration::from_secs(5);
    let tunnel = Arc::new(client.tunnel("echo", timeout).await.unwrap());
    assert_eq!(tunnel.window(), 8);

    let mut payloads = Vec::new();
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let mut payload = vec![0u8; 32];
        rng.fill_bytes(&mut payload);
        payloads.push(Bytes::from(payload));
    }

    let sender = tunnel.clone();
    let outgoing = payloads.clone();
    let writer = tokio::spawn(async move {
        for payload in outgoing {
            sender.send(payload, timeout).await.unwrap();
        }
    });

    for expected in &payloads {
        assert_eq!(&tunnel.recv(timeout).await.unwrap(), expected);
    }
    writer.await.unwrap();

    tunnel.close().await;
    assert!(!mesh.a.serve.is_finished());
    assert!(!mesh.b.serve.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_balancing_spreads_requests() {
    struct Tagged(u8);

    #[async_trait]
    impl ConnectionHandler for Tagged {
        async fn handle_broadcast(&self, _msg: Bytes) {}
        async fn handle_request(&self, _msg: Bytes, _timeout: Duration) -> Result<Bytes, RequestError> {
            Ok(Bytes::from(vec![self.0]))
        }
        async fn handle_tunnel(&self, _tunnel: Tunnel) {}
    }

    let mesh = mesh(SessionConfig::default());
    let mut workers = Vec::new();
    for tag in 0..3u8 {
        workers.push(mesh.b.node.attach("pool", Arc::new(Tagged(tag))).await.unwrap());
    }
    let client = mesh.a.node.attach("client", Arc::new(Echo::default())).await.unwrap();

    let mut seen = HashSet::new();
    for _ in 0..60 {
        let reply = client
            .request("pool", Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap();
        seen.insert(reply[0]);
    }
    assert_eq!(seen.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closing_link_tears_down_both_sides() {
    let mesh = mesh(SessionConfig::default());
    let session = mesh.a.node.attach("client", Arc::new(Echo::default())).await.unwrap();

    mesh.a.closer.close().await.unwrap();
    assert_eq!(mesh.b.forward.await.unwrap(), None);
    assert_eq!(mesh.a.forward.await.unwrap(), None);
    let _ = mesh.b.closer.close().await;

    let result = session
        .request("anyone", Bytes::new(), Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(RequestError::Delivery(_))));

    mesh.a.node.shutdown().await;
    mesh.b.node.shutdown().await;
    assert_eq!(mesh.a.node.session_count().await, 0);
}
