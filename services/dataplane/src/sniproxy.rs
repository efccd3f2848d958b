//! SNI demultiplexer.
//!
//! One public TCP port routed by the ClientHello server name to a fixed set
//! of backends (the local control plane and the local dataplane HTTPS
//! server). TLS is passed through untouched: the peeked ClientHello is
//! replayed to the backend before splicing the rest of the stream.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::forwarder::forward;
use crate::sni::{normalize_server_name, SniConfig, SniInspector, SniResult};

/// Default connect timeout towards a backend.
pub const DEFAULT_BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the SNI demultiplexer.
#[derive(Debug, Clone)]
pub struct SniProxyConfig {
    pub bind_addr: SocketAddr,
    /// Exact server name to backend `host:port`.
    pub routes: HashMap<String, String>,
    pub sni_config: SniConfig,
    pub connect_timeout: Duration,
}

impl SniProxyConfig {
    pub fn new(bind_addr: SocketAddr, routes: HashMap<String, String>) -> Self {
        Self {
            bind_addr,
            routes,
            sni_config: SniConfig::default(),
            connect_timeout: DEFAULT_BACKEND_CONNECT_TIMEOUT,
        }
    }
}

/// Counters for the demultiplexer.
#[derive(Debug, Default)]
pub struct SniProxyStats {
    pub connections_accepted: AtomicU64,
    pub connections_routed: AtomicU64,
    /// No usable server name, or no route for it.
    pub connections_rejected: AtomicU64,
    pub backend_failed: AtomicU64,
}

/// TLS passthrough listener routing by server name.
pub struct SniProxy {
    listener: TcpListener,
    routes: HashMap<String, String>,
    inspector: SniInspector,
    connect_timeout: Duration,
    stats: Arc<SniProxyStats>,
}

impl SniProxy {
    /// Bind the public port.
    pub async fn bind(config: SniProxyConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let routes = config
            .routes
            .into_iter()
            .map(|(name, backend)| (normalize_server_name(&name), backend))
            .collect::<HashMap<_, _>>();

        info!(
            bind_addr = %listener.local_addr()?,
            routes = ?routes,
            "SNI proxy bound"
        );

        Ok(Self {
            listener,
            routes,
            inspector: SniInspector::with_config(config.sni_config),
            connect_timeout: config.connect_timeout,
            stats: Arc::new(SniProxyStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &SniProxyStats {
        &self.stats
    }

    /// Backend configured for a server name.
    pub fn backend_for(&self, server_name: &str) -> Option<&str> {
        self.routes.get(server_name).map(String::as_str)
    }

    /// Accept connections forever.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    let proxy = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            if let Err(e) = proxy.handle_connection(stream).await {
                                debug!(error = %e, "SNI connection error");
                            }
                        }
                        .instrument(tracing::info_span!("sni_connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut client: TcpStream) -> io::Result<()> {
        let sniffed = self.inspector.inspect(&mut client).await;

        let server_name = match sniffed.result {
            SniResult::Found(name) => name,
            other => {
                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                debug!(result = ?other, "No usable server name; closing");
                return Ok(());
            }
        };

        let Some(backend_addr) = self.backend_for(&server_name) else {
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(server_name = %server_name, "No route for server name; closing");
            return Ok(());
        };

        let mut backend = match timeout(self.connect_timeout, TcpStream::connect(backend_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(server_name = %server_name, backend = %backend_addr, error = %e, "Backend connection failed");
                return Ok(());
            }
            Err(_) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(server_name = %server_name, backend = %backend_addr, "Backend connect timeout");
                return Ok(());
            }
        };

        self.stats.connections_routed.fetch_add(1, Ordering::Relaxed);
        debug!(server_name = %server_name, backend = %backend_addr, "Routing connection");

        backend.write_all(&sniffed.buffered).await?;
        let transferred = forward(client, backend).await;

        debug!(
            server_name = %server_name,
            bytes_to_backend = transferred.a_to_b + sniffed.buffered.len() as u64,
            bytes_from_backend = transferred.b_to_a,
            "SNI connection closed"
        );
        Ok(())
    }
}
