//! Error types for the dataplane.

use std::io;

use thiserror::Error;

use crate::authz::AuthzError;

/// Dataplane errors.
///
/// Per-connection variants terminate only the affected connection; the
/// `Identity` and `Bind` variants are fatal at startup.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// No cluster registered under this name.
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// Every endpoint of the cluster refused or timed out.
    #[error("failed to dial cluster {cluster}: {source}")]
    Dial {
        cluster: String,
        #[source]
        source: io::Error,
    },

    /// A listener with this name is already registered.
    #[error("listener already exists: {0}")]
    ListenerExists(String),

    /// No listener registered under this name.
    #[error("unknown listener: {0}")]
    UnknownListener(String),

    /// Could not bind a listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Local TLS identity is missing or unusable.
    #[error("tls identity: {0}")]
    Identity(String),

    /// Discovery resource could not be applied.
    #[error("invalid resource: {0}")]
    InvalidResource(String),

    /// Malformed HTTP exchange on a dataplane connection.
    #[error("http protocol error: {0}")]
    Http(String),

    /// Remote dataplane refused the handoff.
    #[error("peer handoff rejected (status {0})")]
    HandoffRejected(u16),

    /// Remote dataplane did not answer the handoff in time.
    #[error("peer handoff timed out")]
    HandoffTimeout,

    /// Authorization round-trip failed or was denied.
    #[error(transparent)]
    Authz(#[from] AuthzError),

    /// TLS handshake or socket failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DataplaneError {
    /// Short reason code used in structured log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DataplaneError::UnknownCluster(_) => "unknown_cluster",
            DataplaneError::Dial { .. } => "dial_failed",
            DataplaneError::ListenerExists(_) => "listener_exists",
            DataplaneError::UnknownListener(_) => "unknown_listener",
            DataplaneError::Bind { .. } => "bind_failed",
            DataplaneError::Identity(_) => "identity_invalid",
            DataplaneError::InvalidResource(_) => "invalid_resource",
            DataplaneError::Http(_) => "http_protocol",
            DataplaneError::HandoffRejected(_) => "handoff_rejected",
            DataplaneError::HandoffTimeout => "handoff_timeout",
            DataplaneError::Authz(AuthzError::Denied(_)) => "authz_denied",
            DataplaneError::Authz(_) => "authz_unavailable",
            DataplaneError::Io(_) => "io_error",
        }
    }
}

/// Discovery client errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Channel, fetch or ack failure; the stream is rebuilt after a delay.
    #[error("discovery stream unavailable: {0}")]
    Transient(String),

    /// Local misconfiguration; the stream gives up.
    #[error("discovery stream failed permanently: {0}")]
    Fatal(String),

    /// Both resource streams failed permanently.
    #[error("all discovery streams failed (clusters: {clusters}; listeners: {listeners})")]
    Exhausted {
        clusters: Box<DiscoveryError>,
        listeners: Box<DiscoveryError>,
    },
}

impl From<tonic::Status> for DiscoveryError {
    fn from(status: tonic::Status) -> Self {
        DiscoveryError::Transient(format!("{}: {}", status.code(), status.message()))
    }
}
