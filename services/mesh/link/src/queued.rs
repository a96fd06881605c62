//! Queued mode: background encoder and decoder workers behind bounded queues.
//!
//! The encoder drains the outbound queue into the stream and the decoder
//! pushes verified envelopes into the inbound queue. Each worker exclusively
//! owns its half of the stream together with that direction's cipher state.
//! A failure on either side stops both workers.

use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use mesh_wire::Envelope;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::frame::{FrameReader, FrameWriter};
use crate::LinkError;

/// How long [`LinkCloser::close`] waits for the workers to flush and exit
/// before aborting them
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared lifecycle of a queued link
struct LinkState {
    shutdown: watch::Sender<bool>,
    failure: StdMutex<Option<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkState {
    fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    fn fail(&self, err: &LinkError) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| err.to_string());
        }
        self.shutdown.send_replace(true);
    }

    fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn terminal_error(&self) -> LinkError {
        match self.failure() {
            Some(reason) => LinkError::Dead(reason),
            None => LinkError::Closed,
        }
    }
}

/// A link driven by background workers
pub struct QueuedLink {
    sender: LinkSender,
    receiver: LinkReceiver,
    closer: LinkCloser,
}

impl QueuedLink {
    pub(crate) fn spawn<S>(
        writer: FrameWriter<WriteHalf<S>>,
        reader: FrameReader<ReadHalf<S>>,
        capacity: usize,
        failure: Option<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (shutdown, _) = watch::channel(failure.is_some());
        let state = Arc::new(LinkState {
            shutdown,
            failure: StdMutex::new(failure),
            workers: Mutex::new(Vec::with_capacity(2)),
        });

        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);

        let encoder = tokio::spawn(run_encoder(
            writer,
            out_rx,
            state.shutdown.subscribe(),
            state.clone(),
        ));
        let decoder = tokio::spawn(run_decoder(
            reader,
            in_tx,
            state.shutdown.subscribe(),
            state.clone(),
        ));
        if let Ok(mut workers) = state.workers.try_lock() {
            workers.push(encoder);
            workers.push(decoder);
        }

        debug!(capacity, "Queued link started");
        Self {
            sender: LinkSender {
                tx: out_tx,
                state: state.clone(),
            },
            receiver: LinkReceiver {
                rx: in_rx,
                state: state.clone(),
            },
            closer: LinkCloser { state },
        }
    }

    /// A cloneable handle for enqueueing outbound envelopes
    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// A cloneable handle for closing the link
    pub fn closer(&self) -> LinkCloser {
        self.closer.clone()
    }

    /// Enqueue one envelope for sending
    pub async fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.sender.send(envelope).await
    }

    /// Next inbound envelope, `None` once the link has terminated
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Close the link and wait for both workers
    pub async fn close(&self) -> Result<(), LinkError> {
        self.closer.close().await
    }

    /// Split into independently owned handles
    pub fn split(self) -> (LinkSender, LinkReceiver, LinkCloser) {
        (self.sender, self.receiver, self.closer)
    }
}

/// Outbound queue handle
#[derive(Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<Envelope>,
    state: Arc<LinkState>,
}

impl LinkSender {
    /// Enqueue `envelope`, waiting while the queue is full
    pub async fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        if self.state.is_stopped() {
            return Err(self.state.terminal_error());
        }
        self.tx
            .send(envelope)
            .await
            .map_err(|_| self.state.terminal_error())
    }

    /// Whether the link has stopped accepting envelopes
    pub fn is_closed(&self) -> bool {
        self.state.is_stopped()
    }
}

/// Inbound queue handle
pub struct LinkReceiver {
    rx: mpsc::Receiver<Envelope>,
    state: Arc<LinkState>,
}

impl LinkReceiver {
    /// Next inbound envelope, `None` once the link has terminated
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// The failure that terminated the link, if it did not close cleanly
    pub fn failure(&self) -> Option<String> {
        self.state.failure()
    }
}

/// Link termination handle
#[derive(Clone)]
pub struct LinkCloser {
    state: Arc<LinkState>,
}

impl LinkCloser {
    /// Stop both workers and wait until they have exited.
    ///
    /// Envelopes already queued for sending are flushed best-effort. Workers
    /// still busy after [`CLOSE_TIMEOUT`], e.g. writing to a peer that
    /// stopped reading, are aborted and the link is reported dead. Safe to
    /// call concurrently and repeatedly; every caller returns only after the
    /// workers are gone.
    pub async fn close(&self) -> Result<(), LinkError> {
        self.state.stop();

        let deadline = tokio::time::Instant::now() + CLOSE_TIMEOUT;
        let mut workers = self.state.workers.lock().await;
        for mut handle in workers.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Link worker panicked: {}", e),
                Err(_) => {
                    warn!("Link worker still busy after {:?}, aborting", CLOSE_TIMEOUT);
                    handle.abort();
                    if let Err(e) = handle.await {
                        if !e.is_cancelled() {
                            error!("Link worker panicked: {}", e);
                        }
                    }
                    self.state.fail(&LinkError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "close timed out flushing the link",
                    )));
                }
            }
        }
        drop(workers);

        match self.state.failure() {
            Some(reason) => Err(LinkError::Dead(reason)),
            None => Ok(()),
        }
    }

    /// Resolve once the link has stopped for any reason
    pub async fn closed(&self) {
        let mut rx = self.state.shutdown.subscribe();
        stopped(&mut rx).await;
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn run_encoder<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut queue: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<LinkState>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            next = queue.recv() => match next {
                Some(envelope) => {
                    if let Err(e) = writer.write(&envelope).await {
                        if matches!(e, LinkError::Malformed(_)) {
                            warn!("Dropping unencodable envelope: {}", e);
                            continue;
                        }
                        error!("Link encoder failed: {}", e);
                        state.fail(&e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Flush what was queued before close unless the stream already failed
    queue.close();
    if state.failure().is_none() {
        while let Ok(envelope) = queue.try_recv() {
            if let Err(e) = writer.write(&envelope).await {
                debug!("Stopped flushing queued envelopes: {}", e);
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Link shutdown error: {}", e);
    }
    state.stop();
    debug!("Link encoder exited");
}

async fn run_decoder<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    inbound: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<LinkState>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            frame = reader.read() => match frame {
                Ok(envelope) => envelope,
                Err(LinkError::Closed) => {
                    info!("Peer closed link");
                    state.stop();
                    break;
                }
                Err(e) => {
                    error!("Link decoder failed: {}", e);
                    state.fail(&e);
                    break;
                }
            },
        };

        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            sent = inbound.send(envelope) => {
                if sent.is_err() {
                    debug!("Inbound receiver dropped");
                    state.stop();
                    break;
                }
            }
        }
    }
    debug!("Link decoder exited");
}
