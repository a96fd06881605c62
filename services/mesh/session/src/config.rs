//! Session layer tuning values.

use std::time::Duration;

/// Configuration shared by every session attached to a node
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Tunnel buffer offered during setup, in data units
    pub tunnel_buffer: u32,
    /// How long tunnel setup waits for the remote confirmation
    pub tunnel_setup_timeout: Duration,
    /// Capacity of the queued link's inbound and outbound queues
    pub link_queue: usize,
    /// Undelivered messages per broadcast or event worker above which a
    /// backlog warning is logged
    pub worker_backlog: usize,
    /// Maximum number of inbound requests executing at once
    pub request_workers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tunnel_buffer: 128,
            tunnel_setup_timeout: Duration::from_secs(3),
            link_queue: 128,
            worker_backlog: 1024,
            request_workers: 64,
        }
    }
}
