//! Discovery protocol messages.
//!
//! The dataplane consumes a subset of the Envoy v3 aggregated discovery
//! protocol. Only the fields the dataplane reads are declared here; the tags
//! match the upstream `.proto` definitions, so resources produced by an Envoy
//! compatible control plane decode cleanly and unknown fields are skipped.
//!
//! Messages are declared by hand with `prost` derives rather than generated,
//! which keeps the build free of `protoc`.

pub mod discovery;
pub mod resources;

pub use discovery::{DiscoveryRequest, DiscoveryResponse, Node, RpcStatus};
pub use resources::{
    Address, Cluster, ClusterLoadAssignment, Endpoint, Http2ProtocolOptions, LbEndpoint, Listener,
    LocalityLbEndpoints, SocketAddress, SocketProtocol,
};

use prost::Message;
use prost_types::Any;
use thiserror::Error;

/// Type URL of cluster resources.
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

/// Type URL of listener resources.
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

/// gRPC method carrying the aggregated discovery stream.
pub const ADS_METHOD_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// Errors unpacking a typed resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unexpected resource type {actual} (expected {expected})")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid resource encoding: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Pack a message into an `Any` with the given type URL.
pub fn to_any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

/// Unpack an `Any`, checking that it carries the expected type.
pub fn from_any<M: Message + Default>(
    any: &Any,
    expected: &'static str,
) -> Result<M, ResourceError> {
    if any.type_url != expected {
        return Err(ResourceError::TypeMismatch {
            expected,
            actual: any.type_url.clone(),
        });
    }

    Ok(M::decode(any.value.as_slice())?)
}
