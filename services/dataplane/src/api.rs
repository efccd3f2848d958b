//! Names, paths and headers shared between dataplanes and the control plane.

/// Dataplane HTTPS path accepting ingress handoffs from remote peers.
pub const DATAPLANE_INGRESS_PATH: &str = "/dataplane/ingress";

/// Control-plane path deciding inbound connections.
pub const CONTROLPLANE_INGRESS_AUTHZ_PATH: &str = "/authz/ingress";

/// Control-plane path deciding outbound connections.
pub const CONTROLPLANE_EGRESS_AUTHZ_PATH: &str = "/authz/egress";

/// Imported service a connection belongs to.
pub const IMPORT_NAME_HEADER: &str = "x-import-name";

/// IP address of the application client that opened the connection.
pub const CLIENT_IP_HEADER: &str = "x-client-ip";

/// Cluster an authorized ingress connection must be dialed to.
pub const TARGET_CLUSTER_HEADER: &str = "x-target-cluster";

/// Peer an authorized egress connection must be sent to.
pub const TARGET_PEER_HEADER: &str = "x-target-peer";

/// Opaque token presented to the remote peer on handoff.
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Listener resources are named `import-<import name>`.
pub const IMPORT_LISTENER_PREFIX: &str = "import-";

/// Registry clusters pointing at remote dataplanes are named `remote-peer-<peer>`.
pub const REMOTE_PEER_CLUSTER_PREFIX: &str = "remote-peer-";

/// TLS server name of a peer's dataplane.
pub fn dataplane_server_name(peer: &str) -> String {
    format!("dataplane.{peer}")
}

/// TLS server name of a peer's control plane.
pub fn controlplane_server_name(peer: &str) -> String {
    format!("controlplane.{peer}")
}

/// Registry cluster holding the address of a peer's dataplane.
pub fn remote_peer_cluster_name(peer: &str) -> String {
    format!("{REMOTE_PEER_CLUSTER_PREFIX}{peer}")
}

/// Import name carried by a listener resource name.
///
/// Names without the prefix are taken verbatim.
pub fn import_name(listener_name: &str) -> &str {
    listener_name
        .strip_prefix(IMPORT_LISTENER_PREFIX)
        .unwrap_or(listener_name)
}
