//! Discovery client.
//!
//! Keeps the endpoint registry in step with the control plane over two
//! independent resource streams, one for clusters and one for listeners.
//! Each stream fetches a batch, applies it, then acknowledges it; a batch
//! with malformed resources is rejected while its well-formed resources are
//! still applied. A lost stream is rebuilt after a fixed delay, forever;
//! only a fatal error ends a stream for good.
//!
//! Resources withdrawn upstream are not removed locally: entries persist
//! until replaced.

pub mod grpc;
pub mod resources;

pub use grpc::GrpcConnector;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_proto::{DiscoveryResponse, CLUSTER_TYPE_URL, LISTENER_TYPE_URL};
use prost_types::Any;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{DataplaneError, DiscoveryError};
use crate::registry::{EndpointRegistry, ListenerSpec};
use resources::{cluster_from_resource, listener_from_resource};

/// Default delay before rebuilding a lost stream.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Resource type carried by one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cluster,
    Listener,
}

impl ResourceKind {
    pub fn type_url(self) -> &'static str {
        match self {
            ResourceKind::Cluster => CLUSTER_TYPE_URL,
            ResourceKind::Listener => LISTENER_TYPE_URL,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Listener => "listener",
        }
    }
}

/// Opens discovery streams.
#[async_trait]
pub trait DiscoveryConnector: Send + Sync {
    /// Open a stream for one resource kind and subscribe to it.
    async fn connect(&self, kind: ResourceKind) -> Result<Box<dyn ResourceStream>, DiscoveryError>;
}

/// One subscribed resource stream.
#[async_trait]
pub trait ResourceStream: Send {
    /// Wait for the next batch.
    async fn fetch(&mut self) -> Result<DiscoveryResponse, DiscoveryError>;

    /// Accept the last fetched batch.
    async fn ack(&mut self) -> Result<(), DiscoveryError>;

    /// Reject the last fetched batch, staying on the previously accepted version.
    async fn nack(&mut self, message: String) -> Result<(), DiscoveryError>;
}

/// Binds and tears down egress listeners.
#[async_trait]
pub trait ListenerManager: Send + Sync {
    async fn create_listener(&self, spec: ListenerSpec) -> Result<SocketAddr, DataplaneError>;

    async fn delete_listener(&self, name: &str) -> Result<(), DataplaneError>;
}

/// Synchronizes the registry and listeners with the control plane.
pub struct DiscoveryClient {
    connector: Arc<dyn DiscoveryConnector>,
    registry: Arc<EndpointRegistry>,
    listeners: Arc<dyn ListenerManager>,
    retry_interval: Duration,
}

impl DiscoveryClient {
    pub fn new(
        connector: Arc<dyn DiscoveryConnector>,
        registry: Arc<EndpointRegistry>,
        listeners: Arc<dyn ListenerManager>,
    ) -> Self {
        Self {
            connector,
            registry,
            listeners,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Run both streams until shutdown is signalled.
    ///
    /// Fails only when both streams have failed fatally.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), DiscoveryError> {
        let (clusters, listeners) = tokio::join!(
            self.run_stream(ResourceKind::Cluster, shutdown.clone()),
            self.run_stream(ResourceKind::Listener, shutdown),
        );

        match (clusters, listeners) {
            (Err(clusters), Err(listeners)) => Err(DiscoveryError::Exhausted {
                clusters: Box::new(clusters),
                listeners: Box::new(listeners),
            }),
            _ => Ok(()),
        }
    }

    async fn run_stream(
        &self,
        kind: ResourceKind,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DiscoveryError> {
        let resource = kind.as_str();
        // Listener specs applied so far, by import name; survives reconnects.
        let mut applied = HashMap::new();

        loop {
            let outcome = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!(resource, "Discovery stream stopped");
                    return Ok(());
                }
                outcome = self.sync(kind, &mut applied) => outcome,
            };

            match outcome {
                Err(DiscoveryError::Fatal(reason)) => {
                    error!(resource, reason = %reason, "Discovery stream failed permanently");
                    return Err(DiscoveryError::Fatal(reason));
                }
                Err(e) => {
                    warn!(
                        resource,
                        error = %e,
                        retry_in_ms = self.retry_interval.as_millis() as u64,
                        "Discovery stream lost; retrying"
                    );
                }
                Ok(()) => {
                    warn!(resource, "Discovery stream ended; retrying");
                }
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!(resource, "Discovery stream stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    async fn sync(
        &self,
        kind: ResourceKind,
        applied: &mut HashMap<String, ListenerSpec>,
    ) -> Result<(), DiscoveryError> {
        let resource = kind.as_str();
        let mut stream = self.connector.connect(kind).await?;
        info!(resource, "Discovery stream connected");

        loop {
            let response = stream.fetch().await?;
            if !response.type_url.is_empty() && response.type_url != kind.type_url() {
                return Err(DiscoveryError::Transient(format!(
                    "unexpected resource type {} on {resource} stream",
                    response.type_url
                )));
            }

            debug!(
                resource,
                version = %response.version_info,
                resources = response.resources.len(),
                "Discovery response received"
            );

            let rejected = match kind {
                ResourceKind::Cluster => self.apply_clusters(&response.resources),
                ResourceKind::Listener => self.apply_listeners(&response.resources, applied).await,
            };

            if rejected.is_empty() {
                stream.ack().await?;
                debug!(resource, version = %response.version_info, "Discovery response acknowledged");
            } else {
                warn!(
                    resource,
                    version = %response.version_info,
                    rejected = rejected.len(),
                    "Discovery response rejected"
                );
                stream.nack(rejected.join("; ")).await?;
            }
        }
    }

    fn apply_clusters(&self, resources: &[Any]) -> Vec<String> {
        let mut rejected = Vec::new();

        for any in resources {
            match cluster_from_resource(any) {
                Ok(cluster) => {
                    self.registry.upsert_cluster(cluster);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping malformed cluster resource");
                    rejected.push(e.to_string());
                }
            }
        }

        rejected
    }

    async fn apply_listeners(
        &self,
        resources: &[Any],
        applied: &mut HashMap<String, ListenerSpec>,
    ) -> Vec<String> {
        let mut rejected = Vec::new();

        for any in resources {
            let spec = match listener_from_resource(any) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed listener resource");
                    rejected.push(e.to_string());
                    continue;
                }
            };

            if applied.get(&spec.name) == Some(&spec) {
                debug!(listener = %spec.name, "Listener unchanged");
                continue;
            }

            if let Some(previous) = applied.remove(&spec.name) {
                info!(
                    listener = %spec.name,
                    old = %previous.bind_target(),
                    new = %spec.bind_target(),
                    "Listener address changed; recreating"
                );
                if let Err(e) = self.listeners.delete_listener(&spec.name).await {
                    debug!(listener = %spec.name, error = %e, "Listener already gone");
                }
            }

            match self.listeners.create_listener(spec.clone()).await {
                Ok(local_addr) => {
                    info!(listener = %spec.name, local_addr = %local_addr, "Listener applied");
                    applied.insert(spec.name.clone(), spec);
                }
                Err(e) => {
                    // Not recorded, so the next announcement tries again.
                    error!(
                        listener = %spec.name,
                        bind = %spec.bind_target(),
                        error = %e,
                        reason = e.reason_code(),
                        "Listener creation failed"
                    );
                }
            }
        }

        rejected
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
