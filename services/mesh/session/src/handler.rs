//! Application callbacks.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::tunnel::Tunnel;
use crate::RequestError;

/// Callbacks for one attached application session.
///
/// All methods run on worker tasks and must not block indefinitely.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A message broadcast to the session's cluster
    async fn handle_broadcast(&self, msg: Bytes);

    /// A request balanced onto this session.
    ///
    /// Returning [`RequestError::Timeout`] or [`RequestError::Terminating`]
    /// suppresses the reply; any other error is reported to the requester.
    async fn handle_request(&self, msg: Bytes, timeout: Duration) -> Result<Bytes, RequestError>;

    /// An inbound tunnel accepted on behalf of this session
    async fn handle_tunnel(&self, tunnel: Tunnel);

    /// The node tore the session down
    async fn handle_drop(&self, _reason: &str) {}
}

/// Callback for one topic subscription
#[async_trait]
pub trait SubscriptionHandler: Send + Sync + 'static {
    /// An event published on the subscribed topic
    async fn handle_event(&self, msg: Bytes);
}
