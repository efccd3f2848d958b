//! Conversion of discovery resources into registry values.

use std::time::Duration;

use peerlink_proto::{self as proto, from_any, CLUSTER_TYPE_URL, LISTENER_TYPE_URL};
use prost_types::Any;

use crate::api;
use crate::error::DataplaneError;
use crate::registry::{Cluster, ClusterEndpoint, ListenerSpec, DEFAULT_CONNECT_TIMEOUT};

/// Decode a cluster resource.
pub fn cluster_from_resource(any: &Any) -> Result<Cluster, DataplaneError> {
    let resource: proto::Cluster = from_any(any, CLUSTER_TYPE_URL)
        .map_err(|e| DataplaneError::InvalidResource(e.to_string()))?;

    if resource.name.is_empty() {
        return Err(DataplaneError::InvalidResource("cluster without a name".to_string()));
    }

    let endpoints = resource
        .socket_addresses()
        .into_iter()
        .map(|(host, port)| {
            let port = checked_port(&resource.name, port)?;
            Ok(ClusterEndpoint::new(host, port))
        })
        .collect::<Result<Vec<_>, DataplaneError>>()?;

    let mut cluster = Cluster::new(resource.name.clone(), endpoints)?;
    cluster.connect_timeout = resource
        .connect_timeout
        .as_ref()
        .and_then(|d| Duration::try_from(d.clone()).ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    cluster.http2 = resource.http2_protocol_options.is_some();

    Ok(cluster)
}

/// Decode a listener resource into a `ListenerSpec` keyed by import name.
pub fn listener_from_resource(any: &Any) -> Result<ListenerSpec, DataplaneError> {
    let resource: proto::Listener = from_any(any, LISTENER_TYPE_URL)
        .map_err(|e| DataplaneError::InvalidResource(e.to_string()))?;

    let import = api::import_name(&resource.name);
    if import.is_empty() {
        return Err(DataplaneError::InvalidResource(format!(
            "listener {:?} has no import name",
            resource.name
        )));
    }

    let socket = resource.socket_address().ok_or_else(|| {
        DataplaneError::InvalidResource(format!("listener {} has no socket address", resource.name))
    })?;

    Ok(ListenerSpec {
        name: import.to_string(),
        host: socket.address.clone(),
        port: checked_port(&resource.name, socket.port_value)?,
    })
}

fn checked_port(resource: &str, port: u32) -> Result<u16, DataplaneError> {
    u16::try_from(port)
        .map_err(|_| DataplaneError::InvalidResource(format!("{resource}: port {port} out of range")))
}
