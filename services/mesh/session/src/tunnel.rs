//! Flow-controlled bidirectional tunnels.
//!
//! A tunnel is set up in two phases. The initiator registers a local entry
//! under a fresh id and announces it with its buffer offer (`Pending`). The
//! acceptor's confirmation names the remote end and the acceptor's buffer;
//! the entry then negotiates its window (`Establishing`) and opens for
//! transfer (`Live`). Both ends use the smaller of the two offers as the
//! window.
//!
//! Every data unit sent consumes one credit; every unit the remote
//! application consumes is acknowledged and returns one credit. Credits are
//! only ever restored for units actually in flight, so duplicate
//! acknowledgements cannot inflate the window.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use mesh_routing::{NodeId, Overlay};
use mesh_wire::{Envelope, Header};
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tracing::{debug, warn};

use crate::TunnelError;

/// Tunnel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Registered and announced, awaiting the remote confirmation
    Pending,
    /// Confirmed, window being negotiated
    Establishing,
    /// Data may flow in both directions
    Live,
    /// Terminal
    Closed,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelState::Pending,
            1 => TunnelState::Establishing,
            2 => TunnelState::Live,
            _ => TunnelState::Closed,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Pending => write!(f, "pending"),
            TunnelState::Establishing => write!(f, "establishing"),
            TunnelState::Live => write!(f, "live"),
            TunnelState::Closed => write!(f, "closed"),
        }
    }
}

/// The remote end of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TunnelPeer {
    pub node: NodeId,
    pub session: u64,
    pub tunnel: u64,
}

/// Inbound data exceeded the negotiated window
#[derive(Debug)]
pub(crate) struct WindowExceeded;

pub(crate) struct TunnelInner {
    id: u64,
    session: u64,
    state: AtomicU8,
    window: AtomicU32,
    peer: OnceLock<TunnelPeer>,
    credits: Semaphore,
    in_flight: AtomicU32,
    buffered: AtomicU32,
    inbound_tx: StdMutex<Option<mpsc::Sender<Bytes>>>,
    inbound_rx: Mutex<mpsc::Receiver<Bytes>>,
    overlay: Arc<dyn Overlay>,
    registry: Weak<TunnelRegistry>,
}

impl TunnelInner {
    /// Create a pending tunnel able to buffer up to `capacity` inbound units
    pub(crate) fn new(
        id: u64,
        session: u64,
        capacity: u32,
        overlay: Arc<dyn Overlay>,
        registry: &Arc<TunnelRegistry>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1) as usize);
        Arc::new(Self {
            id,
            session,
            state: AtomicU8::new(TunnelState::Pending as u8),
            window: AtomicU32::new(0),
            peer: OnceLock::new(),
            credits: Semaphore::new(0),
            in_flight: AtomicU32::new(0),
            buffered: AtomicU32::new(0),
            inbound_tx: StdMutex::new(Some(tx)),
            inbound_rx: Mutex::new(rx),
            overlay,
            registry: Arc::downgrade(registry),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TunnelState, to: TunnelState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!(session = self.session, tunnel = self.id, "Tunnel {} -> {}", from, to);
        }
        moved
    }

    /// Bind the remote end and open the window
    pub(crate) fn promote(&self, peer: TunnelPeer, window: u32) -> bool {
        if !self.transition(TunnelState::Pending, TunnelState::Establishing) {
            return false;
        }
        if self.peer.set(peer).is_err() {
            return false;
        }
        self.window.store(window, Ordering::Release);
        self.credits.add_permits(window as usize);
        self.transition(TunnelState::Establishing, TunnelState::Live)
    }

    /// Buffer one inbound data unit
    pub(crate) fn deliver(&self, data: Bytes) -> Result<(), WindowExceeded> {
        match self.state() {
            TunnelState::Closed => {
                debug!(tunnel = self.id, "Dropping data for closed tunnel");
                return Ok(());
            }
            TunnelState::Live => {}
            _ => return Err(WindowExceeded),
        }

        let window = self.window.load(Ordering::Acquire);
        let buffered = self.buffered.fetch_add(1, Ordering::AcqRel);
        if buffered >= window {
            self.buffered.fetch_sub(1, Ordering::AcqRel);
            return Err(WindowExceeded);
        }

        let tx = self.inbound_tx.lock().ok().and_then(|tx| tx.clone());
        let accepted = tx.is_some_and(|tx| tx.try_send(data).is_ok());
        if !accepted {
            self.buffered.fetch_sub(1, Ordering::AcqRel);
            debug!(tunnel = self.id, "Dropping data for draining tunnel");
        }
        Ok(())
    }

    /// Restore one credit for an acknowledged unit
    pub(crate) fn ack(&self) -> bool {
        let restored = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if restored {
            self.credits.add_permits(1);
        } else {
            warn!(tunnel = self.id, "Ignoring acknowledgement without data in flight");
        }
        restored
    }

    async fn send(&self, data: Bytes, timeout: Duration) -> Result<(), TunnelError> {
        let peer = match (self.state(), self.peer.get()) {
            (TunnelState::Live, Some(peer)) => *peer,
            _ => return Err(TunnelError::Closed),
        };

        let permit = match tokio::time::timeout(timeout, self.credits.acquire()).await {
            Err(_) => return Err(TunnelError::Timeout),
            Ok(Err(_)) => return Err(TunnelError::Closed),
            Ok(Ok(permit)) => permit,
        };
        permit.forget();
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let envelope = Envelope::new(
            Header::TunnelData {
                dst_session: peer.session,
                tunnel_id: peer.tunnel,
            },
            data,
        );
        self.overlay
            .deliver_direct(peer.node, envelope)
            .await
            .map_err(|e| TunnelError::Delivery(e.to_string()))
    }

    async fn recv(&self, timeout: Duration) -> Result<Bytes, TunnelError> {
        let next = tokio::time::timeout(timeout, async {
            let mut rx = self.inbound_rx.lock().await;
            rx.recv().await
        })
        .await;

        let data = match next {
            Err(_) => return Err(TunnelError::Timeout),
            Ok(None) => return Err(TunnelError::Closed),
            Ok(Some(data)) => data,
        };
        self.buffered.fetch_sub(1, Ordering::AcqRel);

        if let (TunnelState::Live, Some(peer)) = (self.state(), self.peer.get()) {
            let ack = Envelope::control(Header::TunnelAck {
                dst_session: peer.session,
                tunnel_id: peer.tunnel,
            });
            if let Err(e) = self.overlay.deliver_direct(peer.node, ack).await {
                debug!(tunnel = self.id, "Failed to acknowledge tunnel data: {}", e);
            }
        }
        Ok(data)
    }

    /// Move to `Closed`, returning the previous state when this call closed it
    fn shut(&self) -> Option<TunnelState> {
        let previous = TunnelState::from_u8(
            self.state
                .swap(TunnelState::Closed as u8, Ordering::AcqRel),
        );
        if previous == TunnelState::Closed {
            return None;
        }
        self.credits.close();
        if let Ok(mut tx) = self.inbound_tx.lock() {
            tx.take();
        }
        debug!(session = self.session, tunnel = self.id, "Tunnel {} -> closed", previous);
        Some(previous)
    }

    async fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id).await;
        }
    }

    /// Close locally, notifying the remote end if it was ever bound
    pub(crate) async fn close(&self) {
        let Some(previous) = self.shut() else {
            return;
        };
        self.deregister().await;

        if previous == TunnelState::Live {
            if let Some(peer) = self.peer.get() {
                let close = Envelope::control(Header::TunnelClose {
                    dst_session: peer.session,
                    tunnel_id: peer.tunnel,
                });
                if let Err(e) = self.overlay.deliver_direct(peer.node, close).await {
                    debug!(tunnel = self.id, "Failed to notify tunnel close: {}", e);
                }
            }
        }
    }

    /// Close on request of the remote end; buffered data stays readable
    pub(crate) async fn close_remote(&self) {
        if self.shut().is_some() {
            self.deregister().await;
        }
    }
}

/// Tunnels of one session keyed by local id
pub(crate) struct TunnelRegistry {
    tunnels: RwLock<HashMap<u64, Arc<TunnelInner>>>,
}

impl TunnelRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) async fn insert(&self, tunnel: Arc<TunnelInner>) {
        self.tunnels.write().await.insert(tunnel.id(), tunnel);
    }

    pub(crate) async fn get(&self, id: u64) -> Option<Arc<TunnelInner>> {
        self.tunnels.read().await.get(&id).cloned()
    }

    pub(crate) async fn remove(&self, id: u64) -> Option<Arc<TunnelInner>> {
        self.tunnels.write().await.remove(&id)
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<TunnelInner>> {
        self.tunnels.read().await.values().cloned().collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }
}

/// Application handle to a live tunnel.
///
/// Dropping the handle closes the tunnel.
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

impl Tunnel {
    pub(crate) fn new(inner: Arc<TunnelInner>) -> Self {
        Self { inner }
    }

    /// Local tunnel id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        self.inner.state()
    }

    /// Negotiated window in data units
    pub fn window(&self) -> u32 {
        self.inner.window.load(Ordering::Acquire)
    }

    /// Send one data unit, waiting up to `timeout` for window credit
    pub async fn send(&self, data: impl Into<Bytes>, timeout: Duration) -> Result<(), TunnelError> {
        self.inner.send(data.into(), timeout).await
    }

    /// Receive the next data unit, waiting up to `timeout`.
    ///
    /// Fails with [`TunnelError::Closed`] once the tunnel is closed and every
    /// buffered unit has been consumed.
    pub async fn recv(&self, timeout: Duration) -> Result<Bytes, TunnelError> {
        self.inner.recv(timeout).await
    }

    /// Close the tunnel and notify the remote end; repeated calls are no-ops
    pub async fn close(&self) {
        self.inner.close().await
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.inner.state() == TunnelState::Closed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move { inner.close().await });
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.inner.id)
            .field("session", &self.inner.session)
            .field("state", &self.state())
            .field("window", &self.window())
            .finish()
    }
}
