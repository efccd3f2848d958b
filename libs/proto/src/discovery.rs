//! `envoy.service.discovery.v3` request/response envelopes.

use prost_types::Any;

/// Identity of the node opening a discovery stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub cluster: String,
}

/// `google.rpc.Status`, used to report a rejected update.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Sent by the client to subscribe, ACK or NACK.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryRequest {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,
    #[prost(string, repeated, tag = "3")]
    pub resource_names: Vec<String>,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub response_nonce: String,
    #[prost(message, optional, tag = "6")]
    pub error_detail: Option<RpcStatus>,
}

/// A batch of resources pushed by the control plane.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: String,
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<Any>,
    #[prost(bool, tag = "3")]
    pub canary: bool,
    #[prost(string, tag = "4")]
    pub type_url: String,
    #[prost(string, tag = "5")]
    pub nonce: String,
}

impl DiscoveryRequest {
    /// Initial subscription for a resource type.
    pub fn subscribe(node_id: &str, type_url: &str) -> Self {
        Self {
            node: Some(Node {
                id: node_id.to_string(),
                cluster: String::new(),
            }),
            type_url: type_url.to_string(),
            ..Default::default()
        }
    }

    /// Acknowledge the response identified by `version_info` and `nonce`.
    pub fn ack(node_id: &str, type_url: &str, version_info: &str, nonce: &str) -> Self {
        Self {
            version_info: version_info.to_string(),
            response_nonce: nonce.to_string(),
            ..Self::subscribe(node_id, type_url)
        }
    }

    /// Reject the response identified by `nonce`, staying on `version_info`.
    pub fn nack(
        node_id: &str,
        type_url: &str,
        version_info: &str,
        nonce: &str,
        message: String,
    ) -> Self {
        Self {
            error_detail: Some(RpcStatus {
                // INVALID_ARGUMENT
                code: 3,
                message,
            }),
            ..Self::ack(node_id, type_url, version_info, nonce)
        }
    }
}
