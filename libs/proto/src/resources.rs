//! Cluster and listener resources (subset of `envoy.config.*.v3`).

use prost_types::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SocketProtocol {
    Tcp = 0,
    Udp = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SocketAddress {
    #[prost(enumeration = "SocketProtocol", tag = "1")]
    pub protocol: i32,
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(uint32, tag = "3")]
    pub port_value: u32,
}

/// `envoy.config.core.v3.Address`; only the socket address arm is modelled.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Address {
    #[prost(message, optional, tag = "1")]
    pub socket_address: Option<SocketAddress>,
}

impl Address {
    pub fn tcp(address: &str, port: u32) -> Self {
        Self {
            socket_address: Some(SocketAddress {
                protocol: SocketProtocol::Tcp as i32,
                address: address.to_string(),
                port_value: port,
            }),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Endpoint {
    #[prost(message, optional, tag = "1")]
    pub address: Option<Address>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LbEndpoint {
    #[prost(message, optional, tag = "1")]
    pub endpoint: Option<Endpoint>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LocalityLbEndpoints {
    #[prost(message, repeated, tag = "2")]
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClusterLoadAssignment {
    #[prost(string, tag = "1")]
    pub cluster_name: String,
    #[prost(message, repeated, tag = "2")]
    pub endpoints: Vec<LocalityLbEndpoints>,
}

/// Presence marks a cluster whose upstream speaks multiplexed (HTTP/2) streams.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Http2ProtocolOptions {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Cluster {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "4")]
    pub connect_timeout: Option<Duration>,
    #[prost(message, optional, tag = "14")]
    pub http2_protocol_options: Option<Http2ProtocolOptions>,
    #[prost(message, optional, tag = "33")]
    pub load_assignment: Option<ClusterLoadAssignment>,
}

impl Cluster {
    /// Build a single-locality cluster from `(host, port)` pairs.
    pub fn with_endpoints(name: &str, endpoints: &[(&str, u32)]) -> Self {
        let lb_endpoints = endpoints
            .iter()
            .map(|(host, port)| LbEndpoint {
                endpoint: Some(Endpoint {
                    address: Some(Address::tcp(host, *port)),
                }),
            })
            .collect();

        Self {
            name: name.to_string(),
            load_assignment: Some(ClusterLoadAssignment {
                cluster_name: name.to_string(),
                endpoints: vec![LocalityLbEndpoints { lb_endpoints }],
            }),
            ..Default::default()
        }
    }

    /// All socket addresses of the load assignment, in declaration order.
    pub fn socket_addresses(&self) -> Vec<(String, u32)> {
        self.load_assignment
            .iter()
            .flat_map(|la| la.endpoints.iter())
            .flat_map(|locality| locality.lb_endpoints.iter())
            .filter_map(|lb| lb.endpoint.as_ref()?.address.as_ref()?.socket_address.as_ref())
            .map(|sa| (sa.address.clone(), sa.port_value))
            .collect()
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Listener {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub address: Option<Address>,
}

impl Listener {
    pub fn socket_address(&self) -> Option<&SocketAddress> {
        self.address.as_ref()?.socket_address.as_ref()
    }
}
