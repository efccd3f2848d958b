//! Test harness for dataplane integration tests.
//!
//! Provides a throwaway PKI, TCP echo backends, dataplane instances with
//! their SNI front door, and mTLS clients.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use peerlink_dataplane::{
    Cluster, ClusterEndpoint, ControlPlaneClient, DataplaneServer, EndpointRegistry, SniProxy,
    SniProxyConfig, TlsIdentity,
};

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Throwaway CA issuing leaf identities.
pub struct Pki {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

#[allow(dead_code)]
impl Pki {
    pub fn new() -> Self {
        init_crypto_provider();

        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).unwrap();

        Self { ca_cert, ca_key }
    }

    /// Leaf identity valid for the given DNS names.
    pub fn identity(&self, names: &[&str]) -> TlsIdentity {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .unwrap()
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .unwrap();

        TlsIdentity::from_pem(
            self.ca_cert.pem().into_bytes(),
            cert.pem().into_bytes(),
            key.serialize_pem().into_bytes(),
        )
        .unwrap()
    }

    /// Trust store holding only this CA.
    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.der().clone()).unwrap();
        roots
    }
}

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn cluster(&self, name: &str) -> Cluster {
        Cluster::new(name, vec![ClusterEndpoint::new("127.0.0.1", self.addr.port())]).unwrap()
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running dataplane: HTTPS server plus the SNI port in front of it.
#[allow(dead_code)]
pub struct DataplaneHandle {
    pub peer: String,
    pub server: DataplaneServer,
    pub registry: Arc<EndpointRegistry>,
    pub https_addr: SocketAddr,
    pub sni_addr: SocketAddr,
}

#[allow(dead_code)]
impl DataplaneHandle {
    /// Start a dataplane for `peer` whose control plane answers at `control_plane_url`.
    pub async fn spawn(peer: &str, pki: &Pki, control_plane_url: &str) -> Self {
        let identity = pki.identity(&[&format!("dataplane.{peer}")]);
        let registry = Arc::new(EndpointRegistry::new());
        let control_plane =
            ControlPlaneClient::new(control_plane_url, Duration::from_millis(250), None).unwrap();

        let server =
            DataplaneServer::new(peer, Arc::clone(&registry), control_plane, &identity).unwrap();
        let listener = DataplaneServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let https_addr = listener.local_addr().unwrap();

        let https_server = server.clone();
        tokio::spawn(async move {
            let _ = https_server.run(listener).await;
        });

        let routes = [(format!("dataplane.{peer}"), https_addr.to_string())]
            .into_iter()
            .collect();
        let sni = SniProxy::bind(SniProxyConfig::new("127.0.0.1:0".parse().unwrap(), routes))
            .await
            .unwrap();
        let sni_addr = sni.local_addr().unwrap();
        tokio::spawn(Arc::new(sni).run());

        Self {
            peer: peer.to_string(),
            server,
            registry,
            https_addr,
            sni_addr,
        }
    }
}

/// Open an mTLS connection presenting `identity`.
#[allow(dead_code)]
pub async fn mtls_connect(
    addr: SocketAddr,
    server_name: &str,
    identity: &TlsIdentity,
) -> io::Result<TlsStream<TcpStream>> {
    let connector = identity.connector().map_err(io::Error::other)?;
    connect_with(connector, addr, server_name).await
}

/// Open a TLS connection that presents no client certificate.
#[allow(dead_code)]
pub async fn anonymous_connect(
    addr: SocketAddr,
    server_name: &str,
    pki: &Pki,
) -> io::Result<TlsStream<TcpStream>> {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(io::Error::other)?
    .with_root_certificates(pki.roots())
    .with_no_client_auth();

    connect_with(TlsConnector::from(Arc::new(config)), addr, server_name).await
}

async fn connect_with(
    connector: TlsConnector,
    addr: SocketAddr,
    server_name: &str,
) -> io::Result<TlsStream<TcpStream>> {
    let name = peerlink_dataplane::tls::server_name(server_name).map_err(io::Error::other)?;
    let tcp = TcpStream::connect(addr).await?;
    connector.connect(name, tcp).await
}

/// Poll `condition` until it holds or a few seconds pass.
#[allow(dead_code)]
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
