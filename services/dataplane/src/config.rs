//! Dataplane configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::api;

/// Dataplane configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Local peer name; node id on discovery streams and suffix of the TLS server names.
    pub peer_name: String,

    /// Control plane `host:port`, serving both discovery and authorization.
    pub controlplane_addr: String,

    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    /// Public port demultiplexed by server name.
    pub sni_listen_addr: SocketAddr,

    /// Loopback HTTPS port of the dataplane server.
    pub dataplane_listen_addr: SocketAddr,

    pub authz_timeout: Duration,

    /// Bound on a peer dataplane answering an outbound handoff.
    pub handoff_timeout: Duration,

    /// Delay between discovery reconnect attempts.
    pub retry_interval: Duration,

    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let peer_name = var("PEERLINK_PEER_NAME")
            .filter(|v| !v.trim().is_empty())
            .context("Missing peer name. Set PEERLINK_PEER_NAME.")?;

        let controlplane_addr =
            var("PEERLINK_CONTROLPLANE_ADDR").unwrap_or_else(|| "127.0.0.1:444".to_string());

        let ca_file = var("PEERLINK_CA_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/ssl/peerlink/ca.pem"));
        let cert_file = var("PEERLINK_CERT_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/ssl/peerlink/cert.pem"));
        let key_file = var("PEERLINK_KEY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/ssl/peerlink/key.pem"));

        let sni_listen_addr = var("PEERLINK_SNI_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:443".to_string())
            .parse()
            .context("PEERLINK_SNI_LISTEN_ADDR must be a socket address (ip:port).")?;

        let dataplane_listen_addr = var("PEERLINK_DATAPLANE_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8443".to_string())
            .parse()
            .context("PEERLINK_DATAPLANE_LISTEN_ADDR must be a socket address (ip:port).")?;

        let authz_timeout_ms: u64 = var("PEERLINK_AUTHZ_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PEERLINK_AUTHZ_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(250);

        let handoff_timeout_ms: u64 = var("PEERLINK_HANDOFF_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PEERLINK_HANDOFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);

        let retry_interval_ms: u64 = var("PEERLINK_RETRY_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PEERLINK_RETRY_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(5000);

        let log_level = var("PEERLINK_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            peer_name,
            controlplane_addr,
            ca_file,
            cert_file,
            key_file,
            sni_listen_addr,
            dataplane_listen_addr,
            authz_timeout: Duration::from_millis(authz_timeout_ms.max(10)),
            handoff_timeout: Duration::from_millis(handoff_timeout_ms.max(10)),
            retry_interval: Duration::from_millis(retry_interval_ms.max(100)),
            log_level,
        })
    }

    /// Base URL of the control plane authorization endpoints.
    pub fn control_plane_url(&self) -> String {
        format!("https://{}", self.controlplane_addr)
    }

    /// Routes of the SNI demultiplexer: the local control plane and the local dataplane.
    pub fn sni_routes(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                api::controlplane_server_name(&self.peer_name),
                self.controlplane_addr.clone(),
            ),
            (
                api::dataplane_server_name(&self.peer_name),
                self.dataplane_listen_addr.to_string(),
            ),
        ])
    }
}
