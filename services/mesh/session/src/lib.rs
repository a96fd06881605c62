//! Session multiplexing for mesh nodes.
//!
//! This crate multiplexes the envelopes a node exchanges with the mesh into
//! independent sessions, one per attached application. Each session can
//! broadcast, publish and subscribe, issue correlated requests and open
//! flow-controlled tunnels.
//!
//! ## Features
//!
//! - **Request/Reply**: correlation by id with timeouts and termination
//! - **Fan-out**: broadcast and publish through per-destination workers
//! - **Load Balancing**: requests and tunnels go to one random session
//! - **Tunnels**: ordered streams with credit-based flow control
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use mesh_routing::{LoopbackOverlay, NodeId};
//! use mesh_session::{ConnectionHandler, Node, RequestError, SessionConfig, Tunnel};
//! use tokio::sync::mpsc;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ConnectionHandler for Echo {
//!     async fn handle_broadcast(&self, _msg: Bytes) {}
//!     async fn handle_request(&self, msg: Bytes, _timeout: Duration) -> Result<Bytes, RequestError> {
//!         Ok(msg)
//!     }
//!     async fn handle_tunnel(&self, _tunnel: Tunnel) {}
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (tx, rx) = mpsc::channel(1024);
//! let node = Arc::new(Node::new(
//!     SessionConfig::default(),
//!     Arc::new(LoopbackOverlay::new(NodeId(1), tx)),
//! ));
//! let server = node.clone();
//! tokio::spawn(async move { server.serve(rx).await });
//!
//! let session = node.attach("echo", Arc::new(Echo)).await?;
//! let reply = session
//!     .request("echo", Bytes::from_static(b"ping"), Duration::from_secs(1))
//!     .await?;
//! assert_eq!(reply, Bytes::from_static(b"ping"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod handler;
pub mod node;
pub mod pending;
pub mod session;
pub mod tunnel;
mod workers;

// Re-export main types
pub use config::SessionConfig;
pub use error::{DispatchError, RequestError, SessionError, TunnelError};
pub use handler::{ConnectionHandler, SubscriptionHandler};
pub use node::Node;
pub use pending::{Outcome, RequestTable, Waiter};
pub use session::Session;
pub use tunnel::{Tunnel, TunnelState};
