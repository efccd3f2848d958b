//! Local mTLS identity.
//!
//! One CA bundle plus one certificate/key pair serve every authenticated
//! channel: the dataplane HTTPS server (client certificates required), the
//! outbound connections to peer dataplanes, the discovery gRPC channel and
//! the authorization HTTP client.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::DataplaneError;

/// Parsed CA bundle, certificate chain and private key.
pub struct TlsIdentity {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    roots: Arc<RootCertStore>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Load PEM files from disk.
    pub fn load(ca_file: &Path, cert_file: &Path, key_file: &Path) -> Result<Self, DataplaneError> {
        let read = |path: &Path| {
            fs::read(path).map_err(|e| {
                DataplaneError::Identity(format!("failed to read {}: {e}", path.display()))
            })
        };

        Self::from_pem(read(ca_file)?, read(cert_file)?, read(key_file)?)
    }

    /// Build an identity from PEM contents.
    pub fn from_pem(
        ca_pem: Vec<u8>,
        cert_pem: Vec<u8>,
        key_pem: Vec<u8>,
    ) -> Result<Self, DataplaneError> {
        let ca_certs = parse_certs(&ca_pem, "CA bundle")?;
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| DataplaneError::Identity(format!("invalid CA certificate: {e}")))?;
        }

        let certs = parse_certs(&cert_pem, "certificate")?;

        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| DataplaneError::Identity(format!("invalid private key PEM: {e}")))?
            .ok_or_else(|| DataplaneError::Identity("no private key found".to_string()))?;

        Ok(Self {
            ca_pem,
            cert_pem,
            key_pem,
            roots: Arc::new(roots),
            certs,
            key,
        })
    }

    /// Server config that requires a client certificate signed by the CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, DataplaneError> {
        let provider = Arc::new(ring::default_provider());
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), Arc::clone(&provider))
            .build()
            .map_err(|e| DataplaneError::Identity(format!("client verifier: {e}")))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| DataplaneError::Identity(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| DataplaneError::Identity(format!("server certificate: {e}")))?;

        Ok(Arc::new(config))
    }

    /// Client config presenting the local certificate.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, DataplaneError> {
        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| DataplaneError::Identity(e.to_string()))?
            .with_root_certificates(Arc::clone(&self.roots))
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| DataplaneError::Identity(format!("client certificate: {e}")))?;

        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, DataplaneError> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }

    pub fn connector(&self) -> Result<TlsConnector, DataplaneError> {
        Ok(TlsConnector::from(self.client_config()?))
    }

    /// TLS settings for the discovery gRPC channel.
    pub fn grpc_tls_config(&self) -> tonic::transport::ClientTlsConfig {
        tonic::transport::ClientTlsConfig::new()
            .ca_certificate(tonic::transport::Certificate::from_pem(&self.ca_pem))
            .identity(tonic::transport::Identity::from_pem(&self.cert_pem, &self.key_pem))
    }

    /// Client identity and trust anchor for the authorization HTTP client.
    pub fn http_identity(&self) -> Result<(reqwest::Identity, reqwest::Certificate), DataplaneError> {
        let mut pem = self.cert_pem.clone();
        pem.push(b'\n');
        pem.extend_from_slice(&self.key_pem);

        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| DataplaneError::Identity(format!("http client identity: {e}")))?;
        let ca = reqwest::Certificate::from_pem(&self.ca_pem)
            .map_err(|e| DataplaneError::Identity(format!("http client CA: {e}")))?;

        Ok((identity, ca))
    }
}

/// Validate a DNS server name for an outbound handshake.
pub fn server_name(name: &str) -> Result<ServerName<'static>, DataplaneError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| DataplaneError::Identity(format!("invalid server name {name}: {e}")))
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, DataplaneError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DataplaneError::Identity(format!("invalid {what} PEM: {e}")))?;

    if certs.is_empty() {
        return Err(DataplaneError::Identity(format!("no certificates in {what}")));
    }
    Ok(certs)
}
