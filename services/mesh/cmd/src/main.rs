//! Mesh node binary.
//!
//! Joins exactly one peer over a secure link, attaches an application session
//! to the configured cluster and serves it until Ctrl-C or link loss.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use mesh_link::{accept_link, connect_link, listen_tcp, HkdfKeyMaterial, SecureLink};
use mesh_routing::{forward_link, NodeId, PeerOverlay};
use mesh_session::{
    ConnectionHandler, Node, RequestError, SessionConfig, SubscriptionHandler, Tunnel,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::MeshConfig;
use logging::MeshLogFormatter;

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Mesh node joined to a single peer
#[derive(Parser, Debug)]
#[command(name = "mesh", version, about = "Mesh node over an authenticated encrypted link")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Node ID of this node
    #[arg(long)]
    node_id: Option<u64>,

    /// Node ID of the peer
    #[arg(long)]
    peer_node_id: Option<u64>,

    /// Accept the peer on this address, e.g. 0.0.0.0:9400
    #[arg(long, conflicts_with = "connect")]
    listen: Option<SocketAddr>,

    /// Connect to the peer at this address, e.g. 127.0.0.1:9400
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Tunnel setup timeout, e.g. 3s
    #[arg(long)]
    setup_timeout: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let formatter = MeshLogFormatter::new("mesh");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter(args.log_level.as_deref().unwrap_or("info"))?)
        .with_target(false)
        .event_format(formatter)
        .with_filter_reloading();
    let filter_handle = builder.reload_handle();
    builder.init();

    info!("Starting mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut mesh_config = MeshConfig::load_from_file(&args.config);
    apply_args(&mut mesh_config, &args);
    if args.log_level.is_none() {
        filter_handle
            .reload(log_filter(&mesh_config.log_level)?)
            .context("failed to apply configured log level")?;
    }

    let mut session_config = mesh_config.session.to_session_config()?;
    if let Some(timeout) = args.setup_timeout {
        session_config.tunnel_setup_timeout = timeout.into();
    }
    validate(&mesh_config)?;

    let link = establish_link(&mesh_config).await?;
    run_node(mesh_config, session_config, link).await
}

/// Filter for our crates at `level`, unless RUST_LOG says otherwise
fn log_filter(level: &str) -> Result<EnvFilter> {
    if std::env::var("RUST_LOG").is_ok() {
        return Ok(EnvFilter::from_default_env());
    }

    let mut filter = EnvFilter::new("warn");
    for target in ["mesh", "mesh_link", "mesh_routing", "mesh_session", "mesh_wire"] {
        filter = filter.add_directive(
            format!("{}={}", target, level)
                .parse()
                .with_context(|| format!("invalid log level {:?}", level))?,
        );
    }
    Ok(filter)
}

fn apply_args(config: &mut MeshConfig, args: &Args) {
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(peer_node_id) = args.peer_node_id {
        config.peer_node_id = peer_node_id;
    }
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
        config.connect = None;
    }
    if let Some(connect) = args.connect {
        config.connect = Some(connect);
        config.listen = None;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
}

fn validate(config: &MeshConfig) -> Result<()> {
    if config.secret.is_empty() {
        bail!("no link secret configured (set `secret` or MESH_SECRET)");
    }
    if config.node_id == config.peer_node_id {
        bail!("node_id and peer_node_id must differ (both {})", config.node_id);
    }
    match (config.listen, config.connect) {
        (Some(_), Some(_)) => bail!("configure either listen or connect, not both"),
        (None, None) => bail!("configure a listen or a connect address"),
        _ => Ok(()),
    }
}

async fn establish_link(config: &MeshConfig) -> Result<SecureLink<TcpStream>> {
    let mut keys = HkdfKeyMaterial::new(config.secret.as_bytes())
        .context("failed to derive link key material")?;

    if let Some(addr) = config.listen {
        let listener = listen_tcp(addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;
        info!("Waiting for peer on {}", addr);
        let (link, peer) = accept_link(&listener, &mut keys)
            .await
            .context("failed to accept peer link")?;
        info!("Accepted peer link from {}", peer);
        return Ok(link);
    }

    let Some(addr) = config.connect else {
        bail!("no peer address configured");
    };
    let mut attempt = 1;
    loop {
        match connect_link(addr, &mut keys).await {
            Ok(link) => {
                info!("Connected peer link to {}", addr);
                return Ok(link);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!("Connect to {} failed (attempt {}): {}", addr, attempt, e);
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to connect to {}", addr));
            }
        }
    }
}

async fn run_node(
    config: MeshConfig,
    session_config: SessionConfig,
    link: SecureLink<TcpStream>,
) -> Result<()> {
    let local = NodeId(config.node_id);
    let peer = NodeId(config.peer_node_id);

    let (sender, receiver, closer) = link.start(session_config.link_queue).split();
    let (inbox_tx, inbox_rx) = mpsc::channel(session_config.link_queue);
    let overlay = Arc::new(PeerOverlay::new(local, peer, sender, inbox_tx.clone()));
    let node = Arc::new(Node::new(session_config, overlay));

    let mut forward = tokio::spawn(forward_link(receiver, peer, inbox_tx));
    let mut serve = tokio::spawn({
        let node = node.clone();
        async move { node.serve(inbox_rx).await }
    });

    let session = node
        .attach(&config.cluster, Arc::new(AppHandler))
        .await
        .with_context(|| format!("failed to attach to cluster {}", config.cluster))?;
    for topic in &config.topics {
        session
            .subscribe(topic, Arc::new(TopicLogger { topic: topic.clone() }))
            .await
            .with_context(|| format!("failed to subscribe to {}", topic))?;
    }
    info!(
        "Node {} serving cluster {} with peer {}",
        local, config.cluster, peer
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
        result = &mut forward => match result {
            Ok(Some(reason)) => warn!("Peer link lost: {}", reason),
            Ok(None) => info!("Peer link closed"),
            Err(e) => error!("Link forwarder panicked: {}", e),
        },
        result = &mut serve => match result {
            Ok(Ok(())) => info!("Node inbox closed"),
            Ok(Err(violation)) => error!("Protocol violation from peer: {}", violation),
            Err(e) => error!("Dispatch loop panicked: {}", e),
        },
    }

    session.close().await;
    node.shutdown().await;
    if let Err(e) = closer.close().await {
        warn!("Link terminated with failure: {}", e);
    }
    serve.abort();
    forward.abort();

    info!("Mesh node stopped");
    Ok(())
}

/// Application session: logs broadcasts and echoes requests and tunnels
struct AppHandler;

#[async_trait]
impl ConnectionHandler for AppHandler {
    async fn handle_broadcast(&self, msg: Bytes) {
        crate::component_info!("app", "Broadcast received ({} bytes)", msg.len());
    }

    async fn handle_request(&self, msg: Bytes, _timeout: Duration) -> Result<Bytes, RequestError> {
        crate::component_info!("app", "Echoing request ({} bytes)", msg.len());
        Ok(msg)
    }

    async fn handle_tunnel(&self, tunnel: Tunnel) {
        let timeout = Duration::from_secs(30);
        crate::component_info!("app", "Tunnel {} accepted", tunnel.id());
        while let Ok(data) = tunnel.recv(timeout).await {
            if let Err(e) = tunnel.send(data, timeout).await {
                crate::component_warn!("app", "Tunnel {} echo failed: {}", tunnel.id(), e);
                break;
            }
        }
        tunnel.close().await;
    }

    async fn handle_drop(&self, reason: &str) {
        crate::component_error!("app", "Session dropped: {}", reason);
    }
}

/// Logs every event published on one topic
struct TopicLogger {
    topic: String,
}

#[async_trait]
impl SubscriptionHandler for TopicLogger {
    async fn handle_event(&self, msg: Bytes) {
        crate::component_info!("app", "Event on {} ({} bytes)", self.topic, msg.len());
    }
}
