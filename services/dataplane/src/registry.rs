//! Endpoint registry.
//!
//! Maps cluster names to resolved endpoints and listener names to their bound
//! sockets. The discovery client is the only writer; the dataplane server
//! reads it on every connection.
//!
//! - Cluster lookups go through an immutable snapshot swapped with `ArcSwap`,
//!   so a reader sees either the previous or the next cluster value, never a
//!   mix, and never waits on a writer.
//! - Updates replace a cluster wholesale (last write wins per name).
//! - Listener entries hold the one-shot signal that stops their accept loop.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::DataplaneError;

/// Default connect timeout for cluster endpoints.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A single `host:port` endpoint of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterEndpoint {
    pub host: String,
    pub port: u16,
}

impl ClusterEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A named, resolvable endpoint set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    /// Endpoints in preference order; never empty.
    pub endpoints: Vec<ClusterEndpoint>,
    pub connect_timeout: Duration,
    /// Upstream speaks multiplexed (HTTP/2) streams.
    pub http2: bool,
}

impl Cluster {
    /// Create a cluster, rejecting an empty endpoint set.
    pub fn new(name: impl Into<String>, endpoints: Vec<ClusterEndpoint>) -> Result<Self, DataplaneError> {
        let name = name.into();
        if endpoints.is_empty() {
            return Err(DataplaneError::InvalidResource(format!(
                "cluster {name} has no endpoints"
            )));
        }

        Ok(Self {
            name,
            endpoints,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            http2: false,
        })
    }

    /// Connect to the first endpoint that accepts, in preference order.
    pub async fn connect(&self) -> Result<(TcpStream, ClusterEndpoint), DataplaneError> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            debug!(cluster = %self.name, endpoint = %endpoint, "Connecting to cluster endpoint");

            let attempt = timeout(
                self.connect_timeout,
                TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
            )
            .await;

            match attempt {
                Ok(Ok(stream)) => return Ok((stream, endpoint.clone())),
                Ok(Err(e)) => {
                    warn!(cluster = %self.name, endpoint = %endpoint, error = %e, "Endpoint connection failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(cluster = %self.name, endpoint = %endpoint, "Endpoint connect timeout");
                    last_error = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timeout",
                    ));
                }
            }
        }

        Err(DataplaneError::Dial {
            cluster: self.name.clone(),
            source: last_error.unwrap_or_else(|| std::io::Error::other("no endpoints")),
        })
    }
}

/// Bind description of an egress listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    /// Import name; unique among listeners.
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ListenerSpec {
    pub fn bind_target(&self) -> String {
        ClusterEndpoint::new(self.host.clone(), self.port).to_string()
    }
}

/// A bound listener and the signals that stop its accept loop.
#[derive(Debug)]
pub struct ListenerEntry {
    pub spec: ListenerSpec,
    pub local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    /// Resolves once the accept loop has dropped its socket.
    stopped: oneshot::Receiver<()>,
}

impl ListenerEntry {
    pub fn new(
        spec: ListenerSpec,
        local_addr: SocketAddr,
        stop: oneshot::Sender<()>,
        stopped: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            spec,
            local_addr,
            stop,
            stopped,
        }
    }

    /// Signal the accept loop to stop and wait until its socket is released.
    /// Returns `false` if the loop had already exited.
    pub async fn stop(self) -> bool {
        let signalled = self.stop.send(()).is_ok();
        // Sender is dropped, never sent on.
        let _ = self.stopped.await;
        signalled
    }
}

/// Shared registry of clusters and listeners.
pub struct EndpointRegistry {
    clusters: ArcSwap<HashMap<String, Arc<Cluster>>>,
    listeners: RwLock<HashMap<String, ListenerEntry>>,
}

impl EndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            clusters: ArcSwap::from_pointee(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a cluster. Returns `true` if a previous value was replaced.
    pub fn upsert_cluster(&self, cluster: Cluster) -> bool {
        let name = cluster.name.clone();
        let cluster = Arc::new(cluster);
        let mut replaced = false;

        self.clusters.rcu(|current| {
            let mut next = HashMap::clone(current);
            replaced = next.insert(name.clone(), Arc::clone(&cluster)).is_some();
            next
        });

        info!(
            cluster = %name,
            endpoints = cluster.endpoints.len(),
            replaced,
            "Cluster upserted"
        );
        replaced
    }

    /// Remove a cluster.
    pub fn remove_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        let mut removed = None;
        self.clusters.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(name);
            next
        });
        removed
    }

    /// Look up a cluster in the current snapshot.
    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.load().get(name).cloned()
    }

    /// Look up a cluster, failing explicitly when it is unknown.
    pub fn resolve(&self, name: &str) -> Result<Arc<Cluster>, DataplaneError> {
        self.cluster(name)
            .ok_or_else(|| DataplaneError::UnknownCluster(name.to_string()))
    }

    /// Resolve a cluster and connect to its first reachable endpoint.
    pub async fn dial(&self, name: &str) -> Result<(TcpStream, ClusterEndpoint), DataplaneError> {
        self.resolve(name)?.connect().await
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.load().len()
    }

    /// Register a listener; fails without touching an existing entry of the same name.
    pub async fn register_listener(&self, entry: ListenerEntry) -> Result<(), DataplaneError> {
        let mut listeners = self.listeners.write().await;
        if listeners.contains_key(&entry.spec.name) {
            return Err(DataplaneError::ListenerExists(entry.spec.name.clone()));
        }

        listeners.insert(entry.spec.name.clone(), entry);
        Ok(())
    }

    /// Remove a listener; the caller decides whether to signal it.
    pub async fn remove_listener(&self, name: &str) -> Option<ListenerEntry> {
        self.listeners.write().await.remove(name)
    }

    pub async fn has_listener(&self, name: &str) -> bool {
        self.listeners.read().await.contains_key(name)
    }

    /// Local address a listener is bound to.
    pub async fn listener_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners.read().await.get(name).map(|e| e.local_addr)
    }

    pub async fn listener_spec(&self, name: &str) -> Option<ListenerSpec> {
        self.listeners.read().await.get(name).map(|e| e.spec.clone())
    }

    pub async fn listener_names(&self) -> Vec<String> {
        self.listeners.read().await.keys().cloned().collect()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}
