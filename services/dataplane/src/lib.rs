//! peerlink dataplane.
//!
//! Connects services across sites over mutually authenticated TLS, with
//! every connection authorized by the local control plane before any byte is
//! forwarded:
//! - an SNI demultiplexer sharing one public port between the control plane
//!   and the dataplane
//! - a dataplane server handling ingress handoffs and egress import listeners
//! - a discovery client keeping the endpoint registry in step with the
//!   control plane

pub mod api;
pub mod authz;
pub mod config;
pub mod discovery;
pub mod error;
pub mod forwarder;
pub mod registry;
pub mod server;
pub mod sni;
pub mod sniproxy;
pub mod tls;

pub use authz::{AuthzError, ControlPlaneClient, EgressGrant, IngressGrant};
pub use config::Config;
pub use discovery::{
    DiscoveryClient, DiscoveryConnector, GrpcConnector, ListenerManager, ResourceKind,
    ResourceStream,
};
pub use error::{DataplaneError, DiscoveryError};
pub use forwarder::{forward, ForwardStats};
pub use registry::{Cluster, ClusterEndpoint, EndpointRegistry, ListenerSpec};
pub use server::{DataplaneServer, ServerStats, ServerTimeouts};
pub use sni::{SniConfig, SniInspector, SniResult};
pub use sniproxy::{SniProxy, SniProxyConfig};
pub use tls::TlsIdentity;
