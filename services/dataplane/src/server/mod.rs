//! Dataplane server.
//!
//! Terminates mutually authenticated TLS on the loopback HTTPS port (reached
//! through the SNI demultiplexer) and hosts one TCP listener per imported
//! service.
//!
//! - Ingress: a remote peer posts its handoff to `/dataplane/ingress`; the
//!   request is authorized by the local control plane, then the connection
//!   is hijacked and spliced to the granted cluster.
//! - Egress: a local client connects to an import listener; the connection
//!   is authorized, handed off to the remote peer's dataplane over mTLS,
//!   then spliced.
//!
//! Authorization always completes before any application byte is forwarded.

pub mod egress;
pub mod http;
pub mod ingress;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, Instrument};

use crate::api;
use crate::authz::ControlPlaneClient;
use crate::error::DataplaneError;
use crate::forwarder::ForwardStats;
use crate::registry::EndpointRegistry;
use crate::tls::TlsIdentity;
use http::HttpConn;

/// Default bound on a TLS handshake, inbound or outbound.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on reading the handoff request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the peer's answer to an outbound handoff.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection time bounds.
#[derive(Debug, Clone, Copy)]
pub struct ServerTimeouts {
    pub handshake: Duration,
    pub request: Duration,
    /// Covers writing the handoff and reading the peer's response head.
    pub handoff: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            request: DEFAULT_REQUEST_TIMEOUT,
            handoff: DEFAULT_HANDOFF_TIMEOUT,
        }
    }
}

/// Connection counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub ingress_accepted: AtomicU64,
    pub ingress_denied: AtomicU64,
    pub ingress_forwarded: AtomicU64,
    /// Authorized, but the target could not be dialed.
    pub ingress_failed: AtomicU64,
    pub egress_accepted: AtomicU64,
    pub egress_denied: AtomicU64,
    pub egress_forwarded: AtomicU64,
    /// Authorized, but the peer could not be dialed or refused the handoff.
    pub egress_failed: AtomicU64,
    /// Bytes from the accepted side to the dialed side.
    pub bytes_to_target: AtomicU64,
    /// Bytes from the dialed side to the accepted side.
    pub bytes_from_target: AtomicU64,
}

impl ServerStats {
    fn record_transfer(&self, transferred: ForwardStats) {
        self.bytes_to_target
            .fetch_add(transferred.a_to_b, Ordering::Relaxed);
        self.bytes_from_target
            .fetch_add(transferred.b_to_a, Ordering::Relaxed);
    }
}

/// Shared handle to the dataplane server.
#[derive(Clone)]
pub struct DataplaneServer {
    inner: Arc<Inner>,
}

struct Inner {
    peer_name: String,
    registry: Arc<EndpointRegistry>,
    control_plane: ControlPlaneClient,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    timeouts: ServerTimeouts,
    stats: ServerStats,
}

impl DataplaneServer {
    pub fn new(
        peer_name: impl Into<String>,
        registry: Arc<EndpointRegistry>,
        control_plane: ControlPlaneClient,
        identity: &TlsIdentity,
    ) -> Result<Self, DataplaneError> {
        Self::with_timeouts(
            peer_name,
            registry,
            control_plane,
            identity,
            ServerTimeouts::default(),
        )
    }

    pub fn with_timeouts(
        peer_name: impl Into<String>,
        registry: Arc<EndpointRegistry>,
        control_plane: ControlPlaneClient,
        identity: &TlsIdentity,
        timeouts: ServerTimeouts,
    ) -> Result<Self, DataplaneError> {
        Ok(Self {
            inner: Arc::new(Inner {
                peer_name: peer_name.into(),
                registry,
                control_plane,
                acceptor: identity.acceptor()?,
                connector: identity.connector()?,
                timeouts,
                stats: ServerStats::default(),
            }),
        })
    }

    pub fn peer_name(&self) -> &str {
        &self.inner.peer_name
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.inner.registry
    }

    pub fn stats(&self) -> &ServerStats {
        &self.inner.stats
    }

    /// Bind the HTTPS port.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, DataplaneError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DataplaneError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        info!(bind_addr = %listener.local_addr()?, "Dataplane HTTPS listener bound");
        Ok(listener)
    }

    /// Accept HTTPS connections forever.
    pub async fn run(&self, listener: TcpListener) -> io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, peer = %self.inner.peer_name, "Dataplane server started");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let server = self.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = server.handle_https(stream).await {
                                debug!(error = %e, reason = e.reason_code(), "Dataplane connection error");
                            }
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_https(&self, stream: TcpStream) -> Result<(), DataplaneError> {
        let tls = timeout(self.inner.timeouts.handshake, self.inner.acceptor.accept(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timeout"))??;

        let mut conn = HttpConn::new(tls);
        let request = timeout(self.inner.timeouts.request, conn.read_request())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request read timeout"))??;

        let Some((head, body)) = request else {
            return Ok(());
        };

        let path = head.path.split('?').next().unwrap_or_default();
        if path != api::DATAPLANE_INGRESS_PATH {
            debug!(method = %head.method, path = %head.path, "Unknown dataplane path");
            conn.respond(StatusCode::NOT_FOUND).await?;
            return Ok(());
        }
        if head.method != "POST" {
            conn.respond(StatusCode::METHOD_NOT_ALLOWED).await?;
            return Ok(());
        }

        self.handle_ingress(conn, head, body).await
    }
}
