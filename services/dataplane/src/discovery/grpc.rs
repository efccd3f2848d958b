//! gRPC transport for discovery streams.

use std::time::Duration;

use async_trait::async_trait;
use peerlink_proto::{DiscoveryRequest, DiscoveryResponse, ADS_METHOD_PATH};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{ClientTlsConfig, Endpoint};
use tracing::debug;

use super::{DiscoveryConnector, ResourceKind, ResourceStream};
use crate::error::DiscoveryError;

const CHANNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_BUFFER: usize = 16;

/// Opens one aggregated discovery stream per resource kind.
pub struct GrpcConnector {
    endpoint: Endpoint,
    node_id: String,
}

impl GrpcConnector {
    /// Target the control plane at `addr` (`host:port`).
    ///
    /// An invalid address or TLS configuration is fatal: retrying cannot fix it.
    pub fn new(
        addr: &str,
        node_id: impl Into<String>,
        tls: Option<ClientTlsConfig>,
    ) -> Result<Self, DiscoveryError> {
        let scheme = if tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
            .map_err(|e| DiscoveryError::Fatal(format!("invalid control plane address {addr}: {e}")))?
            .connect_timeout(CHANNEL_CONNECT_TIMEOUT);

        if let Some(tls) = tls {
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| DiscoveryError::Fatal(format!("invalid discovery TLS config: {e}")))?;
        }

        Ok(Self {
            endpoint,
            node_id: node_id.into(),
        })
    }
}

#[async_trait]
impl DiscoveryConnector for GrpcConnector {
    async fn connect(&self, kind: ResourceKind) -> Result<Box<dyn ResourceStream>, DiscoveryError> {
        let channel = self
            .endpoint
            .connect()
            .await
            .map_err(|e| DiscoveryError::Transient(format!("channel connect failed: {e}")))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| DiscoveryError::Transient(format!("channel not ready: {e}")))?;

        let (requests, rx) = mpsc::channel(REQUEST_BUFFER);
        requests
            .send(DiscoveryRequest::subscribe(&self.node_id, kind.type_url()))
            .await
            .map_err(|_| DiscoveryError::Transient("request stream closed".to_string()))?;

        let response = grpc
            .streaming(
                tonic::Request::new(ReceiverStream::new(rx)),
                PathAndQuery::from_static(ADS_METHOD_PATH),
                ProstCodec::<DiscoveryRequest, DiscoveryResponse>::default(),
            )
            .await?;

        debug!(resource = kind.as_str(), "Discovery stream opened");

        Ok(Box::new(GrpcResourceStream {
            kind,
            node_id: self.node_id.clone(),
            requests,
            responses: response.into_inner(),
            accepted_version: String::new(),
            pending: None,
        }))
    }
}

/// One open stream; tracks the version/nonce pair owed an answer.
struct GrpcResourceStream {
    kind: ResourceKind,
    node_id: String,
    requests: mpsc::Sender<DiscoveryRequest>,
    responses: Streaming<DiscoveryResponse>,
    accepted_version: String,
    /// (version, nonce) of the last fetched response.
    pending: Option<(String, String)>,
}

impl GrpcResourceStream {
    async fn send(&mut self, request: DiscoveryRequest) -> Result<(), DiscoveryError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| DiscoveryError::Transient("request stream closed".to_string()))
    }

    fn take_pending(&mut self) -> Result<(String, String), DiscoveryError> {
        self.pending
            .take()
            .ok_or_else(|| DiscoveryError::Transient("no response to answer".to_string()))
    }
}

#[async_trait]
impl ResourceStream for GrpcResourceStream {
    async fn fetch(&mut self) -> Result<DiscoveryResponse, DiscoveryError> {
        let response = self
            .responses
            .message()
            .await?
            .ok_or_else(|| DiscoveryError::Transient("stream closed by control plane".to_string()))?;

        self.pending = Some((response.version_info.clone(), response.nonce.clone()));
        Ok(response)
    }

    async fn ack(&mut self) -> Result<(), DiscoveryError> {
        let (version, nonce) = self.take_pending()?;
        self.send(DiscoveryRequest::ack(&self.node_id, self.kind.type_url(), &version, &nonce))
            .await?;
        self.accepted_version = version;
        Ok(())
    }

    async fn nack(&mut self, message: String) -> Result<(), DiscoveryError> {
        let (_, nonce) = self.take_pending()?;
        self.send(DiscoveryRequest::nack(
            &self.node_id,
            self.kind.type_url(),
            &self.accepted_version,
            &nonce,
            message,
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address_is_fatal() {
        let err = GrpcConnector::new("not a uri", "peera", None).err().unwrap();
        assert!(matches!(err, DiscoveryError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = GrpcConnector::new(&addr.to_string(), "peera", None).unwrap();
        let err = connector.connect(ResourceKind::Cluster).await.err().unwrap();
        assert!(matches!(err, DiscoveryError::Transient(_)));
    }
}
