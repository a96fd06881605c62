//! Configuration handling for the mesh node.
//!
//! Values are read from a YAML file and then overridden by environment
//! variables. Command line flags are applied last by `main`.

use anyhow::{Context, Result};
use mesh_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Mesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Identifier of this node
    pub node_id: u64,
    /// Identifier of the single peer node
    pub peer_node_id: u64,
    /// Accept the peer on this address (server role)
    pub listen: Option<SocketAddr>,
    /// Dial the peer at this address (client role)
    pub connect: Option<SocketAddr>,
    /// Shared secret the link keys are derived from
    pub secret: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Cluster the application session attaches to
    pub cluster: String,
    /// Topics the application session subscribes to
    pub topics: Vec<String>,
    /// Session layer settings
    pub session: SessionSettings,
}

/// Session layer settings as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Inbound tunnel window offered to peers
    pub tunnel_buffer: u32,
    /// Tunnel setup timeout, e.g. "3s"
    pub tunnel_setup_timeout: String,
    /// Capacity of the link send and receive queues
    pub link_queue: usize,
    /// Per-worker backlog that triggers a warning
    pub worker_backlog: usize,
    /// Concurrently executing inbound requests
    pub request_workers: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            tunnel_buffer: defaults.tunnel_buffer,
            tunnel_setup_timeout: humantime::format_duration(defaults.tunnel_setup_timeout)
                .to_string(),
            link_queue: defaults.link_queue,
            worker_backlog: defaults.worker_backlog,
            request_workers: defaults.request_workers,
        }
    }
}

impl SessionSettings {
    /// Convert into the library configuration
    pub fn to_session_config(&self) -> Result<SessionConfig> {
        let tunnel_setup_timeout = parse_duration(&self.tunnel_setup_timeout)
            .with_context(|| format!("invalid tunnel_setup_timeout {:?}", self.tunnel_setup_timeout))?;
        Ok(SessionConfig {
            tunnel_buffer: self.tunnel_buffer.max(1),
            tunnel_setup_timeout,
            link_queue: self.link_queue.max(1),
            worker_backlog: self.worker_backlog.max(1),
            request_workers: self.request_workers.max(1),
        })
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peer_node_id: 2,
            listen: None,
            connect: None,
            secret: String::new(),
            log_level: "info".to_string(),
            cluster: "mesh".to_string(),
            topics: Vec::new(),
            session: SessionSettings::default(),
        }
    }
}

/// Parse a humantime duration string such as "250ms" or "3s"
pub fn parse_duration(value: &str) -> Result<Duration> {
    let parsed: humantime::Duration = value.trim().parse()?;
    Ok(parsed.into())
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Self {
        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<MeshConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok());

        info!(
            "Mesh configuration: node_id={}, peer_node_id={}, listen={:?}, connect={:?}",
            config.node_id, config.peer_node_id, config.listen, config.connect
        );
        config
    }

    /// Apply environment variable overrides read through `lookup`
    fn apply_environment_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MESH_NODE_ID") {
            match value.parse::<u64>() {
                Ok(id) => {
                    self.node_id = id;
                    info!("Node ID overridden by environment: {}", id);
                }
                Err(_) => warn!("Ignoring invalid MESH_NODE_ID {:?}", value),
            }
        }

        if let Some(value) = lookup("MESH_PEER_NODE_ID") {
            match value.parse::<u64>() {
                Ok(id) => {
                    self.peer_node_id = id;
                    info!("Peer node ID overridden by environment: {}", id);
                }
                Err(_) => warn!("Ignoring invalid MESH_PEER_NODE_ID {:?}", value),
            }
        }

        if let Some(value) = lookup("MESH_LISTEN") {
            match value.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.listen = Some(addr);
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid MESH_LISTEN {:?}", value),
            }
        }

        if let Some(value) = lookup("MESH_CONNECT") {
            match value.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.connect = Some(addr);
                    info!("Connect address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid MESH_CONNECT {:?}", value),
            }
        }

        if let Some(secret) = lookup("MESH_SECRET") {
            self.secret = secret;
            info!("Link secret overridden by environment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.peer_node_id, 2);
        assert!(config.listen.is_none());
        assert!(config.connect.is_none());

        let session = config.session.to_session_config().unwrap();
        assert_eq!(session.tunnel_buffer, 128);
        assert_eq!(session.tunnel_setup_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
node_id: 7
peer_node_id: 8
listen: 127.0.0.1:9400
secret: correct horse
cluster: storage
topics:
  - alerts
  - metrics
session:
  tunnel_buffer: 16
  tunnel_setup_timeout: 750ms
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = MeshConfig::load_from_file(temp_file.path());
        assert_eq!(config.node_id, 7);
        assert_eq!(config.peer_node_id, 8);
        assert_eq!(config.listen, Some("127.0.0.1:9400".parse().unwrap()));
        assert_eq!(config.secret, "correct horse");
        assert_eq!(config.cluster, "storage");
        assert_eq!(config.topics, vec!["alerts", "metrics"]);

        let session = config.session.to_session_config().unwrap();
        assert_eq!(session.tunnel_buffer, 16);
        assert_eq!(session.tunnel_setup_timeout, Duration::from_millis(750));
        assert_eq!(session.worker_backlog, SessionConfig::default().worker_backlog);
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"node_id: [not, a, number").unwrap();

        let config = MeshConfig::load_from_file(temp_file.path());
        assert_eq!(config.cluster, MeshConfig::default().cluster);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESH_NODE_ID", "42"),
            ("MESH_PEER_NODE_ID", "not-a-number"),
            ("MESH_CONNECT", "10.0.0.2:9400"),
            ("MESH_SECRET", "from-env"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config.apply_environment_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.node_id, 42);
        assert_eq!(config.peer_node_id, 2);
        assert_eq!(config.connect, Some("10.0.0.2:9400".parse().unwrap()));
        assert!(config.listen.is_none());
        assert_eq!(config.secret, "from-env");
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let settings = SessionSettings {
            tunnel_setup_timeout: "soon".to_string(),
            ..SessionSettings::default()
        };
        assert!(settings.to_session_config().is_err());
    }
}
