//! Correlation of outstanding requests with their replies.
//!
//! Every outstanding exchange owns a one-shot reply slot and a one-shot
//! failure slot keyed by a table-scoped sequence number. Resolution happens
//! under the shared lock and never blocks; the first resolution wins and
//! anything after it, or for an id that is no longer registered, is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::debug;

/// Result of waiting on a registered id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The remote side answered
    Reply(T),
    /// The remote side reported a failure
    Failed(String),
    /// Nothing arrived before the deadline
    TimedOut,
    /// The owning session was torn down
    Terminated,
}

struct Slot<T> {
    resolved: AtomicBool,
    reply: mpsc::Sender<T>,
    error: mpsc::Sender<String>,
}

/// Receiving end of a registered id
pub struct Waiter<T> {
    id: u64,
    reply: mpsc::Receiver<T>,
    error: mpsc::Receiver<String>,
}

impl<T> Waiter<T> {
    /// The id this waiter was registered under
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for a reply, a failure, the deadline or session termination.
    ///
    /// The caller still has to [`release`](RequestTable::release) the id.
    pub async fn wait(mut self, timeout: Duration, mut terminate: watch::Receiver<bool>) -> Outcome<T> {
        if *terminate.borrow() {
            return Outcome::Terminated;
        }
        tokio::select! {
            biased;
            Some(reply) = self.reply.recv() => Outcome::Reply(reply),
            Some(reason) = self.error.recv() => Outcome::Failed(reason),
            _ = terminated(&mut terminate) => Outcome::Terminated,
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        }
    }
}

async fn terminated(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|t| *t).await;
}

/// Outstanding correlations keyed by sequence number
pub struct RequestTable<T> {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Slot<T>>>,
}

impl<T: Send> RequestTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a fresh id
    pub fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `id` and return its waiter
    pub async fn register(&self, id: u64) -> Waiter<T> {
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        self.entries.write().await.insert(
            id,
            Slot {
                resolved: AtomicBool::new(false),
                reply: reply_tx,
                error: error_tx,
            },
        );
        Waiter {
            id,
            reply: reply_rx,
            error: error_rx,
        }
    }

    /// Hand a reply or a failure to the waiter of `id`.
    ///
    /// Returns `false` when the id is unknown or was already resolved.
    pub async fn resolve(&self, id: u64, result: Result<T, String>) -> bool {
        let entries = self.entries.read().await;
        let Some(slot) = entries.get(&id) else {
            debug!(id, "Dropping resolution for unknown id");
            return false;
        };

        // Reply and failure share one budget
        if slot.resolved.swap(true, Ordering::AcqRel) {
            debug!(id, "Dropping duplicate resolution");
            return false;
        }
        match result {
            Ok(reply) => slot.reply.try_send(reply).is_ok(),
            Err(reason) => slot.error.try_send(reason).is_ok(),
        }
    }

    /// Remove `id`; safe to call for ids that were never registered
    pub async fn release(&self, id: u64) {
        self.entries.write().await.remove(&id);
    }

    /// Whether `id` is currently registered
    pub async fn contains(&self, id: u64) -> bool {
        self.entries.read().await.contains_key(&id)
    }

    /// Number of registered ids
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no ids are registered
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop every entry, returning how many were removed
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        removed
    }
}

impl<T: Send> Default for RequestTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
