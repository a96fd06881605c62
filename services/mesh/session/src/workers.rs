//! Per-destination delivery workers.
//!
//! Each session owns one broadcast worker and each subscription one event
//! worker. A worker drains its own FIFO queue, so deliveries to the same
//! destination keep their order while a slow destination never stalls
//! dispatch for others. Queues are unbounded: nothing offered to a live
//! worker is lost. A backlog above the configured threshold is logged.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handler::{ConnectionHandler, SubscriptionHandler};

/// What a worker feeds its messages into
pub(crate) enum Target {
    Broadcast(Arc<dyn ConnectionHandler>),
    Event(Arc<dyn SubscriptionHandler>),
}

impl Target {
    async fn deliver(&self, msg: Bytes) {
        match self {
            Target::Broadcast(handler) => handler.handle_broadcast(msg).await,
            Target::Event(handler) => handler.handle_event(msg).await,
        }
    }
}

/// Sending side of a worker queue.
///
/// The worker exits once every clone has been dropped and the queue drained.
#[derive(Clone)]
pub(crate) struct WorkerQueue {
    label: Arc<str>,
    tx: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<AtomicUsize>,
    warn_at: usize,
}

impl WorkerQueue {
    /// Spawn a worker feeding `target`, warning once `warn_at` messages wait
    pub(crate) fn spawn(label: String, warn_at: usize, target: Target) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let label: Arc<str> = Arc::from(label);
        let backlog = Arc::new(AtomicUsize::new(0));

        let worker_label = label.clone();
        let worker_backlog = backlog.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                worker_backlog.fetch_sub(1, Ordering::AcqRel);
                target.deliver(msg).await;
            }
            debug!(worker = %worker_label, "Delivery worker exited");
        });

        Self {
            label,
            tx,
            backlog,
            warn_at: warn_at.max(1),
        }
    }

    /// Queue `msg` without waiting; returns `false` only when the worker is gone
    pub(crate) fn offer(&self, msg: Bytes) -> bool {
        let waiting = self.backlog.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(msg).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            debug!(worker = %self.label, "Worker gone, dropping message");
            return false;
        }
        if waiting == self.warn_at {
            warn!(worker = %self.label, backlog = waiting, "Delivery worker falling behind");
        }
        true
    }

    /// Messages queued but not yet handed to the destination
    #[cfg(test)]
    pub(crate) fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }
}
